use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

use crate::error::StateError;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `memory`, `surrealkv://<path>` for a local durable store, or a
    /// `ws://` / `http://` URL of a SurrealDB server.
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL")
                .unwrap_or_else(|_| "surrealkv://node-cpu-hog-state".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "chaos".to_string()),
            database: env::var("SURREALDB_DATABASE")
                .unwrap_or_else(|_| "node_cpu_hog".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db, StateError> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<(), StateError> {
    let schema_queries = [
        // One row per experiment run. The full state is kept as a JSON
        // payload; the scalar columns exist for filtering.
        "DEFINE TABLE experiment_state SCHEMALESS;
         DEFINE FIELD run_id ON TABLE experiment_state TYPE string;
         DEFINE FIELD phase ON TABLE experiment_state TYPE string;
         DEFINE FIELD needs_cleanup ON TABLE experiment_state TYPE bool DEFAULT false;
         DEFINE FIELD payload ON TABLE experiment_state TYPE string;
         DEFINE FIELD started_at ON TABLE experiment_state TYPE string;
         DEFINE FIELD updated_at ON TABLE experiment_state VALUE time::now();",
        "DEFINE INDEX experiment_state_run_id ON TABLE experiment_state COLUMNS run_id UNIQUE;
         DEFINE INDEX experiment_state_cleanup ON TABLE experiment_state COLUMNS needs_cleanup;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}
