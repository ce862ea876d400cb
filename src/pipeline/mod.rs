//! Backup and restore pipeline orchestration.
//!
//! The two entry points are [`backup_stack`] and [`restore_stack`]; callers
//! provide a runtime adapter, an optional storage provider and an optional
//! log sink, and get back structured results. Only one backup or restore per
//! project should be in flight at a time; concurrent operations on the same
//! project are undefined.

pub mod archive;
pub mod backup;
pub mod parallel;
pub mod pipe;
pub mod preflight;
pub mod restore;

pub use backup::backup_stack;
pub use parallel::ParallelConfig;
pub use restore::{peek_backup, restore_stack};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::storage::Provider;

/// Reentrant log sink; invoked from multiple tasks.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Fans operational log lines out to tracing and the caller's sink.
#[derive(Clone, Default)]
pub struct Reporter {
    sink: Option<LogSink>,
}

impl Reporter {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self { sink }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!("{msg}");
        if let Some(sink) = &self.sink {
            sink(msg);
        }
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!("{msg}");
        if let Some(sink) = &self.sink {
            sink(msg);
        }
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!("{msg}");
        if let Some(sink) = &self.sink {
            sink(msg);
        }
    }
}

#[derive(Clone)]
pub struct BackupOptions {
    /// Project directory holding the manifest. Mutually exclusive with
    /// `project_name`; one of the two is required.
    pub directory: Option<PathBuf>,
    /// Project name for label-based discovery without a directory.
    pub project_name: Option<String>,
    /// Local output path. Ignored when a provider is set; defaults to the
    /// generated archive key otherwise.
    pub output_path: Option<PathBuf>,
    pub pause_containers: bool,
    pub include_databases: bool,
    pub snapshot_images: bool,
    pub provider: Option<Arc<dyn Provider>>,
    /// Raw 32-byte key. Length is validated in preflight.
    pub encryption_key: Option<Vec<u8>>,
    pub parallel: ParallelConfig,
    pub cancel: CancellationToken,
    pub logger: Option<LogSink>,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            directory: None,
            project_name: None,
            output_path: None,
            pause_containers: false,
            include_databases: false,
            snapshot_images: false,
            provider: None,
            encryption_key: None,
            parallel: ParallelConfig::default(),
            cancel: CancellationToken::new(),
            logger: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupResult {
    pub stack_name: String,
    /// Final storage key or local path of the archive.
    pub output_path: String,
    pub size: u64,
    pub duration: Duration,
    pub volumes_backed_up: Vec<String>,
    pub databases_dumped: Vec<String>,
    pub paused_containers: usize,
    pub encrypted: bool,
}

#[derive(Clone)]
pub struct RestoreOptions {
    pub stack_name: String,
    /// Storage key (with a provider) or local archive path.
    pub input_path: String,
    pub provider: Option<Arc<dyn Provider>>,
    pub encryption_key: Option<Vec<u8>>,
    pub cancel: CancellationToken,
    pub logger: Option<LogSink>,
}

/// Archive metadata, authored last into every backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackMetadata {
    pub stack_name: String,
    pub created_at: DateTime<Utc>,
    pub compose_file: String,
    pub volumes: Vec<String>,
    pub services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Service safe-name to original image reference, used by restore to
    /// retag loaded snapshots even across hosts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub original_image_refs: BTreeMap<String, String>,
    pub stacksnap_version: String,
    pub encrypted: bool,
}

impl Default for StackMetadata {
    fn default() -> Self {
        Self {
            stack_name: String::new(),
            created_at: Utc::now(),
            compose_file: String::new(),
            volumes: Vec::new(),
            services: Vec::new(),
            databases: Vec::new(),
            secrets: Vec::new(),
            build_files: Vec::new(),
            images: Vec::new(),
            original_image_refs: BTreeMap::new(),
            stacksnap_version: env!("CARGO_PKG_VERSION").to_string(),
            encrypted: false,
        }
    }
}

/// Transient tag prefix for committed snapshot images.
pub const SNAPSHOT_TAG_PREFIX: &str = "stacksnap-backup-";

/// Storage key for a new archive: `<project>_<YYYYMMDD_HHMMSS>.tar.gz[.enc]`.
pub fn archive_key(stack_name: &str, encrypted: bool) -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = if encrypted { ".enc" } else { "" };
    format!("{stack_name}_{stamp}.tar.gz{suffix}")
}

/// Container name made safe for use inside tags and archive member names.
pub fn safe_container_name(name: &str) -> String {
    name.replace('/', "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_key_shape() {
        let key = archive_key("demo", false);
        assert!(key.starts_with("demo_"));
        assert!(key.ends_with(".tar.gz"));

        let enc = archive_key("demo", true);
        assert!(enc.ends_with(".tar.gz.enc"));

        // demo_YYYYMMDD_HHMMSS.tar.gz
        let stamp = key.trim_start_matches("demo_").trim_end_matches(".tar.gz");
        assert_eq!(stamp.len(), 15);
        assert_eq!(stamp.as_bytes()[8], b'_');
    }

    #[test]
    fn test_safe_container_name() {
        assert_eq!(safe_container_name("/demo-web-1"), "demo-web-1");
        assert_eq!(safe_container_name("demo/web/1"), "demoweb1");
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut refs = BTreeMap::new();
        refs.insert("demo-web-1".to_string(), "nginx:latest".to_string());

        let meta = StackMetadata {
            stack_name: "demo".into(),
            created_at: Utc::now(),
            compose_file: "docker-compose.yml".into(),
            volumes: vec!["demo_data".into()],
            services: vec!["web".into()],
            original_image_refs: refs,
            stacksnap_version: env!("CARGO_PKG_VERSION").into(),
            encrypted: false,
            ..Default::default()
        };

        let json = serde_json::to_string_pretty(&meta).unwrap();
        // Empty optional collections stay out of the wire format.
        assert!(!json.contains("databases"));
        assert!(json.contains("original_image_refs"));

        let parsed: StackMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stack_name, "demo");
        assert_eq!(parsed.volumes, vec!["demo_data"]);
        assert_eq!(
            parsed.original_image_refs.get("demo-web-1").map(String::as_str),
            Some("nginx:latest")
        );
    }
}
