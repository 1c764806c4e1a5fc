//! Environment-driven world selection.
//!
//! Recognized variables are host integration only; they select and
//! parameterize the backend and carry no engine semantics:
//!
//! - `WORKFLOW_TARGET_WORLD` — `memory` (default), `postgres`, or `vercel`
//! - `WORKFLOW_LOCAL_BASE_URL`, `WORKFLOW_LOCAL_DATA_DIR` — local host wiring
//! - `WORKFLOW_VERCEL_ENV`, `WORKFLOW_VERCEL_AUTH_TOKEN`,
//!   `WORKFLOW_VERCEL_PROJECT`, `WORKFLOW_VERCEL_TEAM` — hosted backend
//! - `WORKFLOW_MANIFEST_PATH`, `WORKFLOW_PUBLIC_MANIFEST` — manifest serving
//! - `DATABASE_URL` — connection string for the postgres world

use std::path::PathBuf;
use std::sync::Arc;

use crate::memory::InMemoryWorld;
use crate::postgres::PostgresWorld;
use crate::store::{World, WorldError};

/// Which backend hosts the event log, run store, and stream store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldTarget {
    /// In-process memory; data dies with the process.
    Memory,

    /// PostgreSQL at the given connection string.
    Postgres { url: String },

    /// The hosted backend; requires the platform adapter, not constructible
    /// from this crate.
    Vercel,
}

/// Hosted-backend credentials, recognized and passed through to the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VercelConfig {
    pub env: Option<String>,
    pub auth_token: Option<String>,
    pub project: Option<String>,
    pub team: Option<String>,
}

/// Full world configuration read from the environment.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub target: WorldTarget,
    pub local_base_url: Option<String>,
    pub local_data_dir: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub public_manifest: Option<String>,
    pub vercel: VercelConfig,
}

impl WorldConfig {
    /// Reads configuration from the process environment (and `.env` if
    /// present).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let target = match std::env::var("WORKFLOW_TARGET_WORLD").as_deref() {
            Ok("postgres") => WorldTarget::Postgres {
                url: std::env::var("DATABASE_URL").unwrap_or_default(),
            },
            Ok("vercel") => WorldTarget::Vercel,
            _ => WorldTarget::Memory,
        };

        Self {
            target,
            local_base_url: std::env::var("WORKFLOW_LOCAL_BASE_URL").ok(),
            local_data_dir: std::env::var("WORKFLOW_LOCAL_DATA_DIR").ok().map(PathBuf::from),
            manifest_path: std::env::var("WORKFLOW_MANIFEST_PATH").ok().map(PathBuf::from),
            public_manifest: std::env::var("WORKFLOW_PUBLIC_MANIFEST").ok(),
            vercel: VercelConfig {
                env: std::env::var("WORKFLOW_VERCEL_ENV").ok(),
                auth_token: std::env::var("WORKFLOW_VERCEL_AUTH_TOKEN").ok(),
                project: std::env::var("WORKFLOW_VERCEL_PROJECT").ok(),
                team: std::env::var("WORKFLOW_VERCEL_TEAM").ok(),
            },
        }
    }

    /// Connects the configured backend.
    pub async fn connect(&self) -> Result<Arc<dyn World>, WorldError> {
        match &self.target {
            WorldTarget::Memory => Ok(Arc::new(InMemoryWorld::new())),
            WorldTarget::Postgres { url } => {
                if url.is_empty() {
                    return Err(WorldError::Database(
                        "WORKFLOW_TARGET_WORLD=postgres requires DATABASE_URL".to_string(),
                    ));
                }
                let pool = sqlx::PgPool::connect(url).await?;
                let world = PostgresWorld::new(pool);
                world.ensure_schema().await?;
                Ok(Arc::new(world))
            }
            WorldTarget::Vercel => Err(WorldError::Database(
                "the vercel world is provided by the platform adapter".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_target_is_memory() {
        let config = WorldConfig {
            target: WorldTarget::Memory,
            local_base_url: None,
            local_data_dir: None,
            manifest_path: None,
            public_manifest: None,
            vercel: VercelConfig::default(),
        };
        assert!(config.connect().await.is_ok());
    }

    #[tokio::test]
    async fn postgres_without_url_is_rejected() {
        let config = WorldConfig {
            target: WorldTarget::Postgres { url: String::new() },
            local_base_url: None,
            local_data_dir: None,
            manifest_path: None,
            public_manifest: None,
            vercel: VercelConfig::default(),
        };
        assert!(matches!(
            config.connect().await,
            Err(WorldError::Database(_))
        ));
    }

    #[tokio::test]
    async fn vercel_target_defers_to_adapter() {
        let config = WorldConfig {
            target: WorldTarget::Vercel,
            local_base_url: None,
            local_data_dir: None,
            manifest_path: None,
            public_manifest: None,
            vercel: VercelConfig::default(),
        };
        assert!(config.connect().await.is_err());
    }
}
