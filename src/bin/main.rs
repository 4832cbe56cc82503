use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;

use node_cpu_hog::cluster::{NodeBehavior, NodeInfo, SimOutcome};
use node_cpu_hog::retry::RetryPolicy;
use node_cpu_hog::types::RunId;
use node_cpu_hog::{
    ClusterApi, DatabaseConfig, ExperimentConfig, ExperimentReport, KubeCluster, Orchestrator,
    OrchestratorSettings, RawExperimentConfig, SimulatedCluster, StateRecorder,
    create_state_recorder,
};

#[derive(Parser)]
#[command(name = "node-cpu-hog")]
#[command(about = "Node CPU hog chaos injection orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct KubeArgs {
    /// Namespace helper pods are created in
    #[arg(long, env = "CHAOS_NAMESPACE", default_value = "litmus")]
    namespace: String,
    /// Kubeconfig file; the in-cluster config or default kubeconfig is used otherwise
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[arg(long)]
    context: Option<String>,
}

#[derive(Args)]
struct TuningArgs {
    /// Seconds between helper status polls
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,
    /// Teardown attempts before a helper is left pending cleanup
    #[arg(long, default_value_t = 5)]
    teardown_attempts: u32,
}

impl TuningArgs {
    fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            teardown_retry: RetryPolicy::with_max_attempts(self.teardown_attempts),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment against a Kubernetes cluster
    Run {
        /// JSON experiment config; read from environment variables when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, env = "SURREALDB_URL")]
        db_url: Option<String>,
        #[command(flatten)]
        kube: KubeArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Run an experiment against an in-process simulated cluster
    Simulate {
        /// Number of nodes in the simulated cluster
        #[arg(long, default_value_t = 5)]
        nodes: usize,
        /// Simulated nodes whose helper exits with a failure
        #[arg(long, value_delimiter = ',')]
        fail_nodes: Vec<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "memory")]
        db_url: String,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Tear down leftover helpers of a persisted run
    Recover {
        run_id: String,
        /// Grace period granted to each helper before forced removal
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,
        #[arg(long, env = "SURREALDB_URL")]
        db_url: Option<String>,
        #[command(flatten)]
        kube: KubeArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Tear down leftover helpers of every persisted run
    RecoverAll {
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,
        #[arg(long, env = "SURREALDB_URL")]
        db_url: Option<String>,
        #[command(flatten)]
        kube: KubeArgs,
        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Print the persisted state of a run
    Show {
        run_id: String,
        #[arg(long, env = "SURREALDB_URL")]
        db_url: Option<String>,
    },
    /// Initialize the state database
    Init {
        #[arg(long, env = "SURREALDB_URL")]
        db_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("node_cpu_hog=info".parse()?)
                .add_directive("kube=warn".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            db_url,
            kube,
            tuning,
        } => {
            let cfg = load_config(config)?;
            info!("Starting experiment {} (run {})", cfg.experiment_name, cfg.run_id);

            let cluster = connect_cluster(&kube).await?;
            let recorder = state_recorder(db_url).await?;
            let orchestrator = Orchestrator::new(cluster, recorder, tuning.settings());

            let report = orchestrator.run(&cfg, cancel_on_ctrl_c()).await?;
            print_report(&report)?;
            if !report.passed() {
                std::process::exit(1);
            }
        }
        Commands::Simulate {
            nodes,
            fail_nodes,
            config,
            db_url,
            tuning,
        } => {
            let cfg = load_config(config)?;
            let cluster = Arc::new(SimulatedCluster::default());
            for i in 0..nodes {
                cluster
                    .add_node(NodeInfo {
                        allocatable_cpu: Some(4),
                        ..NodeInfo::ready(format!("sim-node-{}", i))
                    })
                    .await;
            }
            for node in fail_nodes {
                let half = cfg.chaos_duration / 2;
                cluster
                    .set_behavior(
                        node.as_str(),
                        NodeBehavior::with_outcome(SimOutcome::Exit {
                            after: half,
                            code: 1,
                        }),
                    )
                    .await;
            }
            info!("Simulating experiment {} on {} nodes", cfg.run_id, nodes);

            let recorder = state_recorder(Some(db_url)).await?;
            let orchestrator = Orchestrator::new(cluster, recorder, tuning.settings());
            let report = orchestrator.run(&cfg, cancel_on_ctrl_c()).await?;
            print_report(&report)?;
        }
        Commands::Recover {
            run_id,
            grace_secs,
            db_url,
            kube,
            tuning,
        } => {
            let cluster = connect_cluster(&kube).await?;
            let recorder = state_recorder(db_url).await?;
            let orchestrator = Orchestrator::new(cluster, recorder, tuning.settings());

            let report = orchestrator
                .recover(&RunId::new(run_id), Duration::from_secs(grace_secs))
                .await?;
            print_report(&report)?;
        }
        Commands::RecoverAll {
            grace_secs,
            db_url,
            kube,
            tuning,
        } => {
            let cluster = connect_cluster(&kube).await?;
            let recorder = state_recorder(db_url).await?;
            let orchestrator = Orchestrator::new(cluster, recorder, tuning.settings());

            let reports = orchestrator
                .recover_all(Duration::from_secs(grace_secs))
                .await?;
            if reports.is_empty() {
                println!("No runs need cleanup.");
            }
            for report in reports {
                print_report(&report)?;
            }
        }
        Commands::Show { run_id, db_url } => {
            let recorder = state_recorder(db_url).await?;
            let state = recorder.load(&RunId::new(run_id)).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Init { db_url } => {
            let db_config = database_config(db_url);
            info!("Using database url for initialization: {}", db_config.url);

            info!("Initializing database...");
            let db = node_cpu_hog::create_connection(db_config).await?;
            node_cpu_hog::ensure_schema(&db).await?;
            info!("Database initialized successfully");
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<ExperimentConfig> {
    let raw = match path {
        Some(path) => RawExperimentConfig::from_json_file(&path)
            .with_context(|| format!("loading experiment config from {}", path.display()))?,
        None => RawExperimentConfig::from_env().context("reading experiment config from env")?,
    };
    Ok(ExperimentConfig::try_from(raw)?)
}

fn database_config(db_url: Option<String>) -> DatabaseConfig {
    let mut config = DatabaseConfig::default();
    if let Some(url) = db_url {
        config.url = url;
    }
    config
}

async fn state_recorder(db_url: Option<String>) -> Result<Arc<dyn StateRecorder>> {
    let db_config = database_config(db_url);
    info!("Using state database url: {}", db_config.url);
    Ok(create_state_recorder(db_config).await?)
}

async fn connect_cluster(args: &KubeArgs) -> Result<Arc<dyn ClusterApi>> {
    let cluster = match &args.kubeconfig {
        Some(path) => {
            KubeCluster::from_kubeconfig(path, args.context.clone(), args.namespace.clone()).await?
        }
        None => KubeCluster::connect(args.namespace.clone()).await?,
    };
    Ok(Arc::new(cluster))
}

/// A token cancelled on the first ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting experiment");
            trigger.cancel();
        }
    });
    token
}

fn print_report(report: &ExperimentReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
