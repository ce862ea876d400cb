//! The backup pipeline.
//!
//! A single writer chain assembles the archive back-to-front (tar, gzip,
//! optional AEAD envelope, sink) while the orchestrator walks the sequence:
//! discovery, pause, image snapshots, database dumps, config files, volumes,
//! metadata last. The upload consumer starts before the first byte and its
//! failure is the operation's failure. Containers paused here are unpaused
//! on every exit path, and nothing partial ever becomes observable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

use super::archive::{ArchiveEntry, ArchiveTarget, ArchiveWriter};
use super::parallel::{spill_volumes, VolumeProgress};
use super::pipe::byte_pipe;
use super::preflight::preflight_checks;
use super::{
    archive_key, safe_container_name, BackupOptions, BackupResult, Reporter, StackMetadata,
    SNAPSHOT_TAG_PREFIX,
};
use crate::compose::{self, Stack};
use crate::crypto::EncryptionKey;
use crate::database::{self, detect_family, DbFamily};
use crate::error::{Phase, Result, SnapError};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerState};

/// Create a consistent archive of a compose project and deliver it to local
/// disk or a storage provider.
pub async fn backup_stack(
    runtime: Arc<dyn ContainerRuntime>,
    opts: BackupOptions,
) -> Result<BackupResult> {
    let report = Reporter::new(opts.logger.clone());
    let started = Instant::now();

    let result = run_backup(&runtime, &opts, &report, started).await;
    match &result {
        Ok(_) => report.info("COMPLETE"),
        Err(e) => report.error(format!("ERROR: {e}")),
    }
    result
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(SnapError::Cancelled)
    } else {
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn run_backup(
    runtime: &Arc<dyn ContainerRuntime>,
    opts: &BackupOptions,
    report: &Reporter,
    started: Instant,
) -> Result<BackupResult> {
    let preflight = preflight_checks(runtime.as_ref(), opts).await;
    if !preflight.findings.is_empty() {
        report.warn("⚠️  Pre-flight check findings:");
        for finding in &preflight.findings {
            report.warn(format!("{}  {}", finding.severity.icon(), finding.message));
            if let Some(fix) = &finding.fix {
                report.warn(format!("   💡 {fix}"));
            }
        }
    }
    if !preflight.can_proceed {
        return Err(SnapError::Runtime(
            "pre-flight checks failed - cannot proceed with backup".into(),
        )
        .in_phase(Phase::Preflight, "checks"));
    }

    // Resolve the project, from a directory or a bare project name.
    let stack = if let Some(dir) = &opts.directory {
        compose::discover_stack(dir).map_err(|e| e.in_phase(Phase::Preflight, "discovery"))?
    } else if let Some(project) = &opts.project_name {
        report.info(format!(
            "ℹ️  Using label-based discovery for project: {project}"
        ));
        let volumes = match runtime.list_project_volumes(project).await {
            Ok(volumes) => volumes,
            Err(e) => {
                report.warn(format!(
                    "⚠️  Failed to list volumes for project {project}: {e}"
                ));
                Vec::new()
            }
        };
        Stack::standalone(project, volumes)
    } else {
        return Err(SnapError::Runtime(
            "either directory or project name must be provided for backup".into(),
        )
        .in_phase(Phase::Preflight, "options"));
    };

    report.info(format!("🐳 Backing up stack: {}", stack.name));

    let encryption_key = match &opts.encryption_key {
        Some(raw) => {
            report.info("🔒 Encryption enabled (AES-256-GCM)");
            Some(
                EncryptionKey::from_bytes(raw)
                    .map_err(|e| e.in_phase(Phase::Preflight, "encryption"))?,
            )
        }
        None => None,
    };
    if opts.provider.is_some() {
        report.info("☁️  Uploading to remote storage");
    }

    // Output sink: an upload pipe feeding the provider, or a local file. The
    // upload task starts before the first byte is written.
    let key = archive_key(&stack.name, encryption_key.is_some());
    let (target, upload_task, output_path) = match &opts.provider {
        Some(provider) => {
            let (pipe_writer, pipe_reader) = byte_pipe();
            let provider = provider.clone();
            let upload_key = key.clone();
            let upload_report = report.clone();
            let task = tokio::spawn(async move {
                upload_report.info(format!("☁️  Starting upload to: {upload_key}"));
                let result = provider.upload(&upload_key, Box::new(pipe_reader)).await;
                match &result {
                    Ok(()) => upload_report.info("✅ Upload complete"),
                    Err(e) => upload_report.error(format!("❌ Upload failed: {e}")),
                }
                result
            });
            (ArchiveTarget::Pipe(pipe_writer), Some(task), key.clone())
        }
        None => {
            let path = opts
                .output_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(&key));
            let display = path.display().to_string();
            (ArchiveTarget::File(path), None, display)
        }
    };

    let writer = ArchiveWriter::spawn(target, encryption_key.clone(), opts.parallel.clone());

    // Project containers; when the label query fails, fall back to the union
    // of containers using the project's volumes.
    let containers = match runtime.list_project_containers(&stack.name).await {
        Ok(containers) => containers,
        Err(e) => {
            report.warn(format!(
                "⚠️  Failed to list containers for project {}: {e}",
                stack.name
            ));
            let mut fallback: Vec<ContainerInfo> = Vec::new();
            for volume in &stack.named_volumes {
                if let Ok(users) = runtime.list_containers_using_volume(volume).await {
                    for ctr in users {
                        if !fallback.iter().any(|c| c.id == ctr.id) {
                            fallback.push(ctr);
                        }
                    }
                }
            }
            fallback
        }
    };

    // Gap-closing: running containers can mount named volumes the manifest
    // never declared.
    let mut volumes = stack.named_volumes.clone();
    for ctr in &containers {
        for volume in &ctr.volumes {
            if !volumes.contains(volume) {
                report.info(format!(
                    "ℹ️  Found implicit volume mount: {volume} (adding to backup)"
                ));
                volumes.push(volume.clone());
            }
        }
    }

    let mut paused: Vec<String> = Vec::new();
    let phases = run_phases(
        runtime, opts, report, &stack, &containers, &volumes, &mut paused, &writer,
    )
    .await;

    // Close the chain only after a clean run; otherwise tear it down so the
    // sink never commits a partial archive.
    let (phases, size) = match phases {
        Ok(output) => match writer.finish().await {
            Ok(size) => (Ok(output), size),
            Err(e) => (Err(e.in_phase(Phase::Archive, "writer")), 0),
        },
        Err(e) => {
            writer.abort(&e.to_string()).await;
            (Err(e), 0)
        }
    };

    // Join the upload either way so the pipe drains and failures surface.
    let upload_result = match upload_task {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(SnapError::Runtime(format!("upload task failed: {e}"))),
        },
        None => Ok(()),
    };

    // Balanced unpause: every container paused above is resumed, on every
    // exit path.
    for id in &paused {
        report.info("▶️  Resuming container...");
        if let Err(e) = runtime.unpause_container(id).await {
            report.warn(format!("⚠️  Failed to resume container {id}: {e}"));
        }
    }

    let output = phases?;
    upload_result.map_err(|e| e.in_phase(Phase::Upload, "storage"))?;

    let duration = started.elapsed();
    report.info(format!(
        "✅ Stack backup complete: {output_path} (Duration: {})",
        crate::utils::fmt::format_duration(duration.as_secs())
    ));

    Ok(BackupResult {
        stack_name: stack.name.clone(),
        output_path,
        size,
        duration,
        volumes_backed_up: output.volumes_backed_up,
        databases_dumped: output.databases_dumped,
        paused_containers: paused.len(),
        encrypted: encryption_key.is_some(),
    })
}

struct PhaseOutput {
    volumes_backed_up: Vec<String>,
    databases_dumped: Vec<String>,
}

#[allow(clippy::too_many_arguments)]
async fn run_phases(
    runtime: &Arc<dyn ContainerRuntime>,
    opts: &BackupOptions,
    report: &Reporter,
    stack: &Stack,
    containers: &[ContainerInfo],
    volumes: &[String],
    paused: &mut Vec<String>,
    writer: &ArchiveWriter,
) -> Result<PhaseOutput> {
    // Pause running application containers. Databases stay up so they can
    // serve their own dumps; a pause failure is fatal because consistency
    // can no longer be guaranteed.
    if opts.pause_containers {
        for ctr in containers {
            ensure_active(&opts.cancel)?;
            if !ctr.is_running() {
                continue;
            }
            if detect_family(&ctr.image) != DbFamily::Unknown {
                report.info(format!("ℹ️  Skipping pause for DB container: {}", ctr.name));
                continue;
            }
            report.info(format!("⏸️  Pausing {}...", ctr.name));
            runtime
                .pause_container(&ctr.id)
                .await
                .map_err(|e| e.in_phase(Phase::Pause, "runtime"))?;
            paused.push(ctr.id.clone());
        }

        if !paused.is_empty() {
            report.info("⏳ Waiting for in-flight writes to drain...");
            tokio::select! {
                _ = opts.cancel.cancelled() => return Err(SnapError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }
        }
    }

    // Per-container image snapshots via transient tags.
    let mut metadata_images: Vec<String> = Vec::new();
    let mut original_image_refs: BTreeMap<String, String> = BTreeMap::new();
    if opts.snapshot_images {
        report.info("📸 Creating container snapshots...");
        for ctr in containers {
            ensure_active(&opts.cancel)?;
            if !matches!(
                ctr.state,
                ContainerState::Running | ContainerState::Paused
            ) {
                continue;
            }
            report.info(format!("   - Snapshotting {}...", ctr.name));

            let safe = safe_container_name(&ctr.name);
            let stamp = Local::now().format("%Y%m%d%H%M%S");
            let tag = format!("{SNAPSHOT_TAG_PREFIX}{safe}:{stamp}");

            let image_id = match runtime.commit_container(&ctr.id, &tag).await {
                Ok(id) => id,
                Err(e) => {
                    report.warn(format!("⚠️  Failed to commit container {}: {e}", ctr.name));
                    continue;
                }
            };

            let append_result = match save_image_to_spill(runtime.as_ref(), &tag).await {
                Ok((file, size)) => writer
                    .append(ArchiveEntry::Spill {
                        name: format!("images/{safe}.tar"),
                        file,
                        size,
                    })
                    .await
                    .map(|()| true)
                    .map_err(|e| e.in_phase(Phase::Archive, "images")),
                Err(e) => {
                    report.warn(format!("⚠️  Failed to save image {tag}: {e}"));
                    Ok(false)
                }
            };

            // The transient image goes away no matter how the steps above
            // went, including an archive failure that aborts the operation.
            if let Err(e) = runtime.remove_image(&image_id).await {
                report.warn(format!("⚠️  Failed to remove transient image {tag}: {e}"));
            }

            match append_result {
                Ok(true) => {
                    metadata_images.push(tag);
                    original_image_refs.insert(safe, ctr.image.clone());
                }
                Ok(false) => {}
                Err(e) => return Err(e),
            }
        }
    }

    // Database hot dumps. A paused database is resumed for the duration of
    // its dump and re-paused immediately after.
    let mut databases_dumped: Vec<String> = Vec::new();
    if opts.include_databases {
        for ctr in containers {
            ensure_active(&opts.cancel)?;
            let family = detect_family(&ctr.image);
            if family == DbFamily::Unknown {
                continue;
            }
            report.info(format!(
                "🗄️  Dumping {family} database from {}...",
                ctr.name
            ));

            let was_paused = paused.iter().any(|id| id == &ctr.id);
            if was_paused {
                let _ = runtime.unpause_container(&ctr.id).await;
            }

            let dump_result = tokio::select! {
                _ = opts.cancel.cancelled() => Err(SnapError::Cancelled),
                result = database::dump(runtime.as_ref(), &ctr.id, family) => result,
            };

            if was_paused {
                if let Err(e) = runtime.pause_container(&ctr.id).await {
                    report.warn(format!(
                        "⚠️  Failed to re-pause {} after dump: {e}",
                        ctr.name
                    ));
                }
            }

            let data = match dump_result {
                Ok(data) => data,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    report.warn(format!(
                        "⚠️  Warning: failed to dump database {}: {e}",
                        ctr.name
                    ));
                    continue;
                }
            };

            if data.is_empty() {
                report.info(format!("ℹ️  Database {} returned no data", ctr.name));
            }
            writer
                .append(ArchiveEntry::Bytes {
                    name: format!("{}_{family}_dump.sql", ctr.name),
                    data,
                })
                .await
                .map_err(|e| e.in_phase(Phase::Dump, "archive"))?;
            databases_dumped.push(family.to_string());
        }
    }

    // Manifest, env, secret and build files under their basenames.
    let mut config_files: Vec<&PathBuf> = Vec::new();
    if let Some(compose_path) = &stack.compose_file {
        config_files.push(compose_path);
    }
    config_files.extend(&stack.env_files);
    config_files.extend(&stack.secret_files);
    config_files.extend(&stack.build_files);

    for path in config_files {
        ensure_active(&opts.cancel)?;
        if let Ok(data) = tokio::fs::read(path).await {
            writer
                .append(ArchiveEntry::Bytes {
                    name: file_name(path),
                    data,
                })
                .await
                .map_err(|e| e.in_phase(Phase::Archive, "config files"))?;
        }
    }

    // Volumes: spill through the worker pool, then append sequentially in
    // declared order. tar needs the size before the data, hence the spill.
    let progress_report = report.clone();
    let spills = spill_volumes(
        runtime.clone(),
        volumes,
        &opts.parallel,
        &opts.cancel,
        move |event| {
            if let VolumeProgress::Started { volume, .. } = event {
                progress_report.info(format!("🔄 Backing up volume {volume}..."));
            }
        },
    )
    .await;

    let mut volumes_backed_up = Vec::new();
    for (name, result) in spills {
        match result {
            Ok(spill) => {
                writer
                    .append(ArchiveEntry::Spill {
                        name: format!("volumes/{}.tar", spill.volume),
                        file: spill.file,
                        size: spill.size,
                    })
                    .await
                    .map_err(|e| e.in_phase(Phase::Archive, "volumes"))?;
                volumes_backed_up.push(name);
            }
            Err(e) if e.is_cancelled() => return Err(SnapError::Cancelled),
            Err(e) => {
                report.warn(format!("⚠️  Failed to backup volume {name}: {e}"));
            }
        }
    }

    // Metadata is authored strictly last.
    ensure_active(&opts.cancel)?;
    let metadata = StackMetadata {
        stack_name: stack.name.clone(),
        created_at: Utc::now(),
        compose_file: stack
            .compose_file
            .as_deref()
            .map(file_name)
            .unwrap_or_default(),
        volumes: volumes_backed_up.clone(),
        services: stack.services.clone(),
        databases: databases_dumped.clone(),
        secrets: stack.secret_files.iter().map(|p| file_name(p)).collect(),
        build_files: stack.build_files.iter().map(|p| file_name(p)).collect(),
        images: metadata_images,
        original_image_refs,
        stacksnap_version: env!("CARGO_PKG_VERSION").to_string(),
        encrypted: opts.encryption_key.is_some(),
    };
    writer
        .append(ArchiveEntry::Bytes {
            name: "metadata.json".into(),
            data: serde_json::to_vec_pretty(&metadata)?,
        })
        .await
        .map_err(|e| e.in_phase(Phase::Archive, "metadata"))?;

    Ok(PhaseOutput {
        volumes_backed_up,
        databases_dumped,
    })
}

async fn save_image_to_spill(
    runtime: &dyn ContainerRuntime,
    tag: &str,
) -> Result<(TempPath, u64)> {
    let spill = tempfile::NamedTempFile::new()?.into_temp_path();
    runtime.save_image(tag, &spill).await?;
    let size = tokio::fs::metadata(&*spill).await?.len();
    Ok((spill, size))
}
