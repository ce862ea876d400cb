//! Environment-driven configuration for the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::storage::s3::S3Settings;
use crate::storage::{LocalProvider, Provider, RetryConfig, RetryingProvider, S3Provider};

#[derive(Debug, Clone)]
pub enum StorageBackend {
    Disabled,
    Local { root: PathBuf },
    S3(S3Settings),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub storage: StorageBackend,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let storage = match std::env::var("STACKSNAP_STORAGE").as_deref() {
            Ok("local") => StorageBackend::Local {
                root: PathBuf::from(
                    std::env::var("STACKSNAP_STORAGE_ROOT").unwrap_or_else(|_| "./backups".into()),
                ),
            },
            Ok("s3") => StorageBackend::S3(S3Settings {
                bucket: std::env::var("STACKSNAP_S3_BUCKET").unwrap_or_default(),
                region: std::env::var("STACKSNAP_S3_REGION")
                    .unwrap_or_else(|_| "us-east-1".into()),
                endpoint: std::env::var("STACKSNAP_S3_ENDPOINT").ok(),
                access_key: std::env::var("STACKSNAP_S3_ACCESS_KEY").ok(),
                secret_key: std::env::var("STACKSNAP_S3_SECRET_KEY").ok(),
            }),
            _ => StorageBackend::Disabled,
        };

        Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            storage,
        }
    }

    /// Install the global tracing subscriber at this config's log level.
    /// An explicit `level` argument overrides the configured one, and a set
    /// `RUST_LOG` wins over both. Operational log lines additionally reach
    /// the caller's sink through `pipeline::Reporter`.
    pub fn init_logging(&self, level: Option<&str>) {
        let level = level.unwrap_or(&self.log_level);
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    /// Build the configured provider, wrapped in the retry decorator.
    /// Returns `None` when no remote storage is configured.
    pub async fn build_provider(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn Provider>>> {
        let inner: Arc<dyn Provider> = match &self.storage {
            StorageBackend::Disabled => return Ok(None),
            StorageBackend::Local { root } => Arc::new(LocalProvider::new(root.clone())?),
            StorageBackend::S3(settings) => Arc::new(S3Provider::new(settings.clone()).await?),
        };
        Ok(Some(Arc::new(RetryingProvider::new(
            inner,
            RetryConfig::default(),
            cancel.clone(),
        ))))
    }
}
