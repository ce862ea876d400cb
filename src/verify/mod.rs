//! Backup verification.
//!
//! Two levels: structural verification parses the archive without side
//! effects and checks every required member, while live verification stands
//! the embedded manifest up as a disposable project and asserts that its
//! services come up healthy. Live verification always cleans up after
//! itself, on a time budget independent of the caller's cancellation.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Serialize;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::crypto::{DecryptReader, EncryptionKey};
use crate::error::{Result, SnapError};
use crate::pipeline::StackMetadata;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::storage::{BodyReader, Provider};

/// SQL dump content must contain at least one of these, case-insensitively.
const SQL_MARKERS: &[&str] = &["--", "create", "insert", "postgresql", "mysql", "dump", "set "];

/// Offset of the `ustar` magic inside a tar header block.
const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, Serialize)]
pub struct VerifyCheck {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StructuralReport {
    pub backup_key: String,
    pub verified: bool,
    pub tested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_name: Option<String>,
    pub has_metadata: bool,
    pub has_compose: bool,
    pub has_volumes: bool,
    pub has_database_dump: bool,
    pub volume_count: usize,
    pub checks: Vec<VerifyCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveReport {
    pub backup_key: String,
    pub verified: bool,
    pub tested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_logs: Option<String>,
}

async fn open_source(
    provider: &Option<Arc<dyn Provider>>,
    source: &str,
) -> Result<BodyReader> {
    match provider {
        Some(provider) => provider.download(source).await,
        None => {
            let file = tokio::fs::File::open(source).await?;
            Ok(Box::new(file))
        }
    }
}

fn parse_key(raw: &Option<Vec<u8>>) -> Result<Option<EncryptionKey>> {
    match raw {
        Some(bytes) => Ok(Some(EncryptionKey::from_bytes(bytes)?)),
        None => Ok(None),
    }
}

/// Structural verification: stream the archive through decrypt, gunzip and
/// tar, producing a per-check pass/fail list. No side effects.
pub async fn verify_archive(
    provider: Option<Arc<dyn Provider>>,
    encryption_key: Option<Vec<u8>>,
    source: &str,
) -> Result<StructuralReport> {
    let mut report = StructuralReport {
        backup_key: source.to_string(),
        verified: false,
        tested_at: Utc::now(),
        error_message: None,
        stack_name: None,
        has_metadata: false,
        has_compose: false,
        has_volumes: false,
        has_database_dump: false,
        volume_count: 0,
        checks: Vec::new(),
    };

    let key = parse_key(&encryption_key)?;
    let reader = match open_source(&provider, source).await {
        Ok(reader) => reader,
        Err(e) => {
            report.error_message = Some(format!("failed to open backup: {e}"));
            return Ok(report);
        }
    };
    report.checks.push(VerifyCheck {
        name: "Download/Open".into(),
        passed: true,
        detail: None,
    });

    let bridge = SyncIoBridge::new(reader);
    let facts = tokio::task::spawn_blocking(move || structural_walk(bridge, key))
        .await
        .map_err(|e| SnapError::Runtime(format!("verification task failed: {e}")))?;

    let facts = match facts {
        Ok(facts) => facts,
        Err(e) => {
            let e = SnapError::from_chain_io(e);
            report.error_message = Some(format!("corrupted archive: {e}"));
            return Ok(report);
        }
    };

    report.checks.extend(facts.checks);
    report.has_compose = facts.has_compose;
    report.has_database_dump = facts.has_database_dump;
    report.volume_count = facts.volume_count;
    report.has_volumes = facts.volume_count > 0;

    match &facts.metadata {
        Some(meta) => {
            report.has_metadata = true;
            report.stack_name = Some(meta.stack_name.clone());

            if !meta.compose_file.is_empty() {
                report.checks.push(VerifyCheck {
                    name: "Compose member listed in metadata present".into(),
                    passed: facts.has_compose,
                    detail: (!facts.has_compose)
                        .then(|| format!("metadata names {} but archive has none", meta.compose_file)),
                });
            }
            if !meta.volumes.is_empty() {
                report.checks.push(VerifyCheck {
                    name: "Volume members present".into(),
                    passed: facts.volume_count > 0,
                    detail: (facts.volume_count == 0)
                        .then(|| "metadata lists volumes but archive has none".to_string()),
                });
            }
        }
        None => {
            report.checks.push(VerifyCheck {
                name: "Metadata present".into(),
                passed: false,
                detail: Some("missing metadata.json".into()),
            });
        }
    }

    report.verified = report.checks.iter().all(|c| c.passed);
    if !report.verified && report.error_message.is_none() {
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        report.error_message = Some(format!("failed checks: {}", failed.join(", ")));
    }

    Ok(report)
}

struct WalkFacts {
    metadata: Option<StackMetadata>,
    has_compose: bool,
    has_database_dump: bool,
    volume_count: usize,
    checks: Vec<VerifyCheck>,
}

fn structural_walk<R: Read + 'static>(
    source: R,
    key: Option<EncryptionKey>,
) -> io::Result<WalkFacts> {
    let reader: Box<dyn Read> = match &key {
        Some(key) => Box::new(DecryptReader::new(key, source)?),
        None => Box::new(source),
    };
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    let mut facts = WalkFacts {
        metadata: None,
        has_compose: false,
        has_database_dump: false,
        volume_count: 0,
        checks: Vec::new(),
    };
    facts.checks.push(VerifyCheck {
        name: "Gzip integrity".into(),
        passed: true,
        detail: None,
    });

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if name == "metadata.json" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            match serde_json::from_slice::<StackMetadata>(&data) {
                Ok(meta) => {
                    facts.metadata = Some(meta);
                    facts.checks.push(VerifyCheck {
                        name: "Metadata parsing".into(),
                        passed: true,
                        detail: None,
                    });
                }
                Err(e) => {
                    facts.checks.push(VerifyCheck {
                        name: "Metadata parsing".into(),
                        passed: false,
                        detail: Some(e.to_string()),
                    });
                }
            }
        } else if name == "docker-compose.yml" || name == "docker-compose.yaml" {
            facts.has_compose = true;
            facts.checks.push(VerifyCheck {
                name: "Compose file".into(),
                passed: true,
                detail: None,
            });
            io::copy(&mut entry, &mut io::sink())?;
        } else if name.starts_with("volumes/") && name.ends_with(".tar") {
            facts.volume_count += 1;
            let mut head = [0u8; 512];
            let n = read_up_to(&mut entry, &mut head)?;
            let plausible = n >= TAR_MAGIC_OFFSET + 5
                && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar";
            facts.checks.push(VerifyCheck {
                name: format!("Volume tar format: {name}"),
                passed: plausible,
                detail: (!plausible).then(|| "missing ustar magic at offset 257".to_string()),
            });
            io::copy(&mut entry, &mut io::sink())?;
        } else if name.ends_with("_dump.sql") {
            facts.has_database_dump = true;
            let mut head = vec![0u8; 4096];
            let n = read_up_to(&mut entry, &mut head)?;
            // Empty dumps mean "no data" and pass; non-empty dumps must look
            // like SQL.
            let passed = n == 0 || looks_like_sql(&String::from_utf8_lossy(&head[..n]));
            facts.checks.push(VerifyCheck {
                name: format!("SQL dump: {name}"),
                passed,
                detail: (!passed).then(|| "missing expected SQL markers".to_string()),
            });
            io::copy(&mut entry, &mut io::sink())?;
        } else {
            io::copy(&mut entry, &mut io::sink())?;
        }
    }

    Ok(facts)
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn looks_like_sql(content: &str) -> bool {
    let lower = content.to_lowercase();
    SQL_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Live verification: stand up a disposable project from the embedded
/// manifest and assert that every service reaches a healthy state.
pub async fn verify_live(
    runtime: Arc<dyn ContainerRuntime>,
    provider: Option<Arc<dyn Provider>>,
    encryption_key: Option<Vec<u8>>,
    source: &str,
    cancel: CancellationToken,
) -> Result<LiveReport> {
    let mut report = LiveReport {
        backup_key: source.to_string(),
        verified: false,
        tested_at: Utc::now(),
        error_message: None,
        container_logs: None,
    };

    let key = parse_key(&encryption_key)?;
    let temp_dir = tempfile::tempdir()?;

    let reader = match open_source(&provider, source).await {
        Ok(reader) => reader,
        Err(e) => {
            report.error_message = Some(format!("failed to open backup: {e}"));
            return Ok(report);
        }
    };

    // Pull everything the disposable project needs out of the archive;
    // volumes and images are deliberately left behind.
    let bridge = SyncIoBridge::new(reader);
    let dest = temp_dir.path().to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || extract_config_members(bridge, key, &dest))
        .await
        .map_err(|e| SnapError::Runtime(format!("extraction task failed: {e}")))?;
    if let Err(e) = extracted {
        report.error_message = Some(format!(
            "failed to extract verification files: {}",
            SnapError::from_chain_io(e)
        ));
        return Ok(report);
    }

    let metadata: Option<StackMetadata> = tokio::fs::read(temp_dir.path().join("metadata.json"))
        .await
        .ok()
        .and_then(|data| serde_json::from_slice(&data).ok());

    let compose_path = ["docker-compose.yml", "docker-compose.yaml"]
        .iter()
        .map(|name| temp_dir.path().join(name))
        .find(|path| path.is_file());

    let Some(compose_path) = compose_path else {
        // Data-only archives have nothing to bring up; structural checks are
        // all that applies.
        tracing::info!("Performing data-only verification for {source}");
        report.verified = true;
        report.error_message = Some("Verified (data only - no compose file in archive)".into());
        return Ok(report);
    };
    if metadata.as_ref().map(|m| m.compose_file.is_empty()).unwrap_or(true) {
        report.verified = true;
        report.error_message = Some("Verified (data only - no compose file in metadata)".into());
        return Ok(report);
    }

    // Disposable project name derived from the current time.
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let project = format!("verify_{:x}", nanos % 100_000);

    let outcome = bring_up_and_check(
        &project,
        temp_dir.path(),
        &compose_path,
        &cancel,
        &mut report,
    )
    .await;

    // Cleanup is unconditional and runs on its own budget so a cancelled
    // outer operation still cleans up.
    cleanup_project(runtime.as_ref(), &project, temp_dir.path()).await;

    outcome?;
    Ok(report)
}

async fn bring_up_and_check(
    project: &str,
    work_dir: &Path,
    compose_path: &Path,
    cancel: &CancellationToken,
    report: &mut LiveReport,
) -> Result<()> {
    tracing::info!("Standing up verification project {project}");
    let up = tokio::process::Command::new("docker")
        .args(["compose", "-p", project, "-f"])
        .arg(compose_path)
        .args(["up", "-d", "--no-build"])
        .current_dir(work_dir)
        .output();
    let up = tokio::select! {
        _ = cancel.cancelled() => return Err(SnapError::Cancelled),
        output = up => output?,
    };
    if !up.status.success() {
        report.error_message = Some(format!(
            "compose up failed: {}",
            String::from_utf8_lossy(&up.stderr).trim()
        ));
        return Ok(());
    }

    // Give services a moment to start (or crash).
    tokio::select! {
        _ = cancel.cancelled() => return Err(SnapError::Cancelled),
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }

    let ps = tokio::process::Command::new("docker")
        .args(["compose", "-p", project, "ps", "--format", "json"])
        .current_dir(work_dir)
        .output()
        .await?;
    let status = String::from_utf8_lossy(&ps.stdout).into_owned();

    let any_failed = status.contains("\"State\":\"exited\"")
        || status.contains("\"State\":\"dead\"")
        || status.contains("\"Health\":\"unhealthy\"");
    let any_alive = status.contains("\"State\":\"running\"")
        || status.contains("\"State\":\"starting\"");

    if any_failed || !any_alive {
        report.error_message = Some(format!("services failed to start properly: {status}"));

        let logs = tokio::process::Command::new("docker")
            .args(["compose", "-p", project, "logs", "--tail", "50"])
            .current_dir(work_dir)
            .output()
            .await;
        if let Ok(logs) = logs {
            report.container_logs =
                Some(String::from_utf8_lossy(&logs.stdout).into_owned());
        }
    } else {
        report.verified = true;
    }

    Ok(())
}

/// Tear the disposable project down: compose-down first, forced removal of
/// labelled containers and volumes if that fails. Bounded at 30 seconds.
async fn cleanup_project(runtime: &dyn ContainerRuntime, project: &str, work_dir: &Path) {
    tracing::info!("Cleaning up verification project {project}");

    let cleanup = async {
        let down = tokio::process::Command::new("docker")
            .args([
                "compose", "-p", project, "down", "-v", "--remove-orphans", "--timeout", "10",
            ])
            .current_dir(work_dir)
            .output()
            .await;

        let down_ok = matches!(&down, Ok(output) if output.status.success());
        if !down_ok {
            tracing::warn!("Compose down failed for {project}, forcing cleanup");
            force_cleanup(runtime, project).await;
        }
    };

    if tokio::time::timeout(Duration::from_secs(30), cleanup)
        .await
        .is_err()
    {
        tracing::warn!("Cleanup of verification project {project} timed out");
    }
}

async fn force_cleanup(runtime: &dyn ContainerRuntime, project: &str) {
    match runtime.list_project_containers(project).await {
        Ok(containers) => {
            for ctr in containers {
                tracing::info!("Force removing container {}", ctr.name);
                if matches!(ctr.state, ContainerState::Running | ContainerState::Paused) {
                    if let Err(e) = runtime.stop_container(&ctr.id).await {
                        tracing::warn!("Failed to stop container {}: {}", ctr.name, e);
                    }
                }
                if let Err(e) = runtime.remove_container(&ctr.id).await {
                    tracing::warn!("Failed to remove container {}: {}", ctr.name, e);
                }
            }
        }
        Err(e) => tracing::warn!("Failed to list containers for cleanup: {}", e),
    }

    match runtime.list_project_volumes(project).await {
        Ok(volumes) => {
            for volume in volumes {
                tracing::info!("Removing volume {}", volume);
                if let Err(e) = runtime.remove_volume(&volume).await {
                    tracing::warn!("Failed to remove volume {}: {}", volume, e);
                }
            }
        }
        Err(e) => tracing::warn!("Failed to list volumes for cleanup: {}", e),
    }
}

fn extract_config_members<R: Read + 'static>(
    source: R,
    key: Option<EncryptionKey>,
    dest: &Path,
) -> io::Result<()> {
    let reader: Box<dyn Read> = match &key {
        Some(key) => Box::new(DecryptReader::new(key, source)?),
        None => Box::new(source),
    };
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if name.starts_with("volumes/") || name.starts_with("images/") {
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }
        // Members are flat basenames; anything path-like is suspect.
        if name.contains("..") || name.starts_with('/') || name.contains('/') {
            io::copy(&mut entry, &mut io::sink())?;
            continue;
        }

        let target: PathBuf = dest.join(&name);
        let mut file = std::fs::File::create(&target)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}
