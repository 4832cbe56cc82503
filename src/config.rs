//! Experiment configuration.
//!
//! The chaos controller hands over a loosely typed field bag
//! (`RawExperimentConfig`), either through environment variables or a JSON
//! document. It is validated exactly once into an immutable
//! `ExperimentConfig`; nothing downstream re-parses strings.

use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::Path, str::FromStr, time::Duration};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::types::{NodeName, RunId};

/// Experiment parameters exactly as supplied by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawExperimentConfig {
    pub experiment_name: String,
    pub engine_name: String,
    pub chaos_duration: i64,
    pub ramp_time: i64,
    pub chaos_lib: String,
    pub app_ns: String,
    pub app_label: String,
    pub app_kind: String,
    pub chaos_uid: String,
    pub termination_grace_period_seconds: i64,
    pub instance_id: String,
    pub chaos_namespace: String,
    pub chaos_pod_name: String,
    #[serde(rename = "nodeCPUcores")]
    pub node_cpu_cores: String,
    #[serde(rename = "cpuLoad")]
    pub cpu_load: String,
    pub run_id: String,
    #[serde(rename = "libImage")]
    pub lib_image: String,
    #[serde(rename = "libImagePullPolicy")]
    pub lib_image_pull_policy: String,
    pub auxiliary_app_info: String,
    pub timeout: i64,
    pub delay: i64,
    pub target_nodes: String,
    pub nodes_affected_perc: String,
    pub sequence: String,
    pub target_container: String,
    pub node_label: String,
    pub set_helper_data: String,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_int(name: &str, default: i64) -> Result<i64, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            ConfigError::Parse(format!("{} is not an integer: {:?}", name, raw))
        }),
        _ => Ok(default),
    }
}

impl RawExperimentConfig {
    /// Read the field bag from the environment the chaos runner is started with.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            experiment_name: env_or("EXPERIMENT_NAME", "node-cpu-hog"),
            engine_name: env_or("CHAOSENGINE", ""),
            chaos_duration: env_int("TOTAL_CHAOS_DURATION", 60)?,
            ramp_time: env_int("RAMP_TIME", 0)?,
            chaos_lib: env_or("LIB", "litmus"),
            app_ns: env_or("APP_NAMESPACE", ""),
            app_label: env_or("APP_LABEL", ""),
            app_kind: env_or("APP_KIND", ""),
            chaos_uid: env_or("CHAOS_UID", ""),
            termination_grace_period_seconds: env_int("TERMINATION_GRACE_PERIOD_SECONDS", 0)?,
            instance_id: env_or("INSTANCE_ID", ""),
            chaos_namespace: env_or("CHAOS_NAMESPACE", "litmus"),
            chaos_pod_name: env_or("POD_NAME", ""),
            node_cpu_cores: env_or("NODE_CPU_CORE", ""),
            cpu_load: env_or("CPU_LOAD", "100"),
            run_id: env_or("RUN_ID", ""),
            lib_image: env_or("LIB_IMAGE", "litmuschaos/go-runner:latest"),
            lib_image_pull_policy: env_or("LIB_IMAGE_PULL_POLICY", "Always"),
            auxiliary_app_info: env_or("AUXILIARY_APPINFO", ""),
            timeout: env_int("STATUS_CHECK_TIMEOUT", 180)?,
            delay: env_int("STATUS_CHECK_DELAY", 2)?,
            target_nodes: env_or("TARGET_NODES", ""),
            nodes_affected_perc: env_or("NODES_AFFECTED_PERC", ""),
            sequence: env_or("SEQUENCE", "parallel"),
            target_container: env_or("TARGET_CONTAINER", ""),
            node_label: env_or("NODE_LABEL", ""),
            set_helper_data: env_or("SET_HELPER_DATA", "true"),
        })
    }

    /// Load the field bag from a JSON document, expanding `${VAR}` references
    /// in string values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Io(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg.expanded())
    }

    fn expanded(mut self) -> Self {
        for field in [
            &mut self.experiment_name,
            &mut self.engine_name,
            &mut self.app_ns,
            &mut self.app_label,
            &mut self.chaos_namespace,
            &mut self.lib_image,
            &mut self.target_nodes,
            &mut self.node_label,
            &mut self.run_id,
        ] {
            *field = expand_env_vars(field);
        }
        self
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Whether targets are injected one at a time or all at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceMode {
    Serial,
    Parallel,
}

impl FromStr for SequenceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "" | "parallel" => Ok(Self::Parallel),
            other => Err(ConfigError::invalid(
                "sequence",
                format!("expected serial or parallel, got {:?}", other),
            )),
        }
    }
}

impl fmt::Display for SequenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "serial"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// Image pull policy applied to the helper workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "Always" => Ok(Self::Always),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            other => Err(ConfigError::invalid(
                "lib_image_pull_policy",
                format!("unknown pull policy {:?}", other),
            )),
        }
    }
}

/// How the set of candidate nodes is described.
///
/// Precedence when several are configured: explicit list, then node label,
/// then application placement, then every node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetSelector {
    /// Exact node names, used verbatim.
    Explicit(Vec<NodeName>),
    /// Nodes matching a label selector such as `role=worker`.
    NodeLabel(String),
    /// Nodes currently hosting pods matching `label` in `namespace`.
    AppPlacement { namespace: String, label: String },
    /// Every node in the cluster.
    AllNodes,
}

/// Validated, immutable experiment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_name: String,
    pub engine_name: String,
    pub chaos_lib: String,
    pub chaos_uid: String,
    pub instance_id: String,
    pub chaos_namespace: String,
    pub run_id: RunId,

    pub chaos_duration: Duration,
    pub ramp_time: Duration,
    /// Slack on top of `chaos_duration` before a helper counts as overrun.
    pub timeout: Duration,
    /// Pause between successive targets in serial mode.
    pub delay: Duration,
    pub termination_grace_period: Duration,

    pub target: TargetSelector,
    /// 0 selects a single node.
    pub affected_percentage: u8,
    pub sequence: SequenceMode,

    /// 0 sizes the helper to the node's allocatable CPU.
    pub cpu_cores: u32,
    pub cpu_load: u8,
    pub image: String,
    pub image_pull_policy: PullPolicy,
}

/// Upper bound for every configured duration: 7 days.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

fn bounded_secs(field: &'static str, value: i64) -> Result<Duration, ConfigError> {
    let secs = u64::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("must not be negative, got {}", value)))?;
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::invalid(
            field,
            format!("must not exceed {}s, got {}", MAX_DURATION_SECS, secs),
        ));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_optional_number<T: FromStr + Default>(
    field: &'static str,
    raw: &str,
) -> Result<T, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(T::default());
    }
    raw.parse()
        .map_err(|_| ConfigError::invalid(field, format!("not a number: {:?}", raw)))
}

fn split_node_list(raw: &str) -> Vec<NodeName> {
    let mut nodes: Vec<NodeName> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !nodes.iter().any(|n| n.as_str() == name) {
            nodes.push(NodeName::new(name));
        }
    }
    nodes
}

impl TryFrom<RawExperimentConfig> for ExperimentConfig {
    type Error = ConfigError;

    fn try_from(raw: RawExperimentConfig) -> Result<Self, Self::Error> {
        let chaos_duration = bounded_secs("chaos_duration", raw.chaos_duration)?;
        if chaos_duration.is_zero() {
            return Err(ConfigError::invalid("chaos_duration", "must be greater than zero"));
        }

        let affected_percentage: u8 =
            parse_optional_number("nodes_affected_perc", &raw.nodes_affected_perc)?;
        if affected_percentage > 100 {
            return Err(ConfigError::invalid(
                "nodes_affected_perc",
                format!("must be within 0..=100, got {}", affected_percentage),
            ));
        }

        let cpu_load: u8 = if raw.cpu_load.trim().is_empty() {
            100
        } else {
            parse_optional_number("cpu_load", &raw.cpu_load)?
        };
        if !(1..=100).contains(&cpu_load) {
            return Err(ConfigError::invalid(
                "cpu_load",
                format!("must be within 1..=100, got {}", cpu_load),
            ));
        }

        let image = raw.lib_image.trim().to_string();
        if image.is_empty() {
            return Err(ConfigError::invalid("lib_image", "must not be empty"));
        }

        let explicit = split_node_list(&raw.target_nodes);
        let target = if !explicit.is_empty() {
            TargetSelector::Explicit(explicit)
        } else if !raw.node_label.trim().is_empty() {
            TargetSelector::NodeLabel(raw.node_label.trim().to_string())
        } else if !raw.app_label.trim().is_empty() {
            TargetSelector::AppPlacement {
                namespace: raw.app_ns.trim().to_string(),
                label: raw.app_label.trim().to_string(),
            }
        } else {
            TargetSelector::AllNodes
        };

        let run_id = if raw.run_id.trim().is_empty() {
            RunId::generate()
        } else {
            RunId::new(raw.run_id.trim())
        };

        Ok(Self {
            experiment_name: raw.experiment_name,
            engine_name: raw.engine_name,
            chaos_lib: raw.chaos_lib,
            chaos_uid: raw.chaos_uid,
            instance_id: raw.instance_id,
            chaos_namespace: raw.chaos_namespace,
            run_id,
            chaos_duration,
            ramp_time: bounded_secs("ramp_time", raw.ramp_time)?,
            timeout: bounded_secs("timeout", raw.timeout)?,
            delay: bounded_secs("delay", raw.delay)?,
            termination_grace_period: bounded_secs(
                "termination_grace_period_seconds",
                raw.termination_grace_period_seconds,
            )?,
            target,
            affected_percentage,
            sequence: raw.sequence.parse()?,
            cpu_cores: parse_optional_number("node_cpu_cores", &raw.node_cpu_cores)?,
            cpu_load,
            image,
            image_pull_policy: raw.lib_image_pull_policy.parse()?,
        })
    }
}

impl ExperimentConfig {
    /// Upper bound on a single helper's runtime.
    pub fn helper_bound(&self) -> Duration {
        self.chaos_duration.saturating_add(self.timeout)
    }
}

/// Tuning of the orchestrator itself, shared by every run it drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// How often a monitor polls its helper's status.
    pub poll_interval: Duration,
    pub teardown_retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            teardown_retry: RetryPolicy::default(),
        }
    }
}
