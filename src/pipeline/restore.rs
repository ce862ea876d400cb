//! The restore pipeline.
//!
//! The reader chain mirrors backup: source (provider download or local
//! file), optional decryption envelope, gzip, tar. A blocking demux task
//! walks the archive and hands members to the async orchestrator: volume
//! tars are piped straight into helper containers, image tars spill to temp
//! files for loading and retagging, everything else is ignored here (the
//! verifier reads those members). Previously running services are stopped up
//! front and re-materialized on the way out, whatever happened in between.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tempfile::TempPath;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;

use super::pipe::{PipeReader, PIPE_DEPTH};
use super::{safe_container_name, Reporter, RestoreOptions, StackMetadata, SNAPSHOT_TAG_PREFIX};
use crate::crypto::{DecryptReader, EncryptionKey};
use crate::error::{Phase, Result, SnapError};
use crate::runtime::{ContainerRuntime, LABEL_CONFIG_FILES, LABEL_WORKING_DIR};
use crate::storage::{BodyReader, Provider};

/// Restore a stack from an archive: volumes repopulated, image snapshots
/// reloaded and retagged, services re-materialized.
pub async fn restore_stack(runtime: Arc<dyn ContainerRuntime>, opts: RestoreOptions) -> Result<()> {
    let report = Reporter::new(opts.logger.clone());
    let result = run_restore(&runtime, &opts, &report).await;
    match &result {
        Ok(()) => report.info("COMPLETE"),
        Err(e) => report.error(format!("ERROR: {e}")),
    }
    result
}

async fn open_source(
    provider: &Option<Arc<dyn Provider>>,
    input_path: &str,
) -> Result<BodyReader> {
    match provider {
        Some(provider) => provider.download(input_path).await,
        None => {
            let file = tokio::fs::File::open(input_path).await?;
            Ok(Box::new(file))
        }
    }
}

async fn run_restore(
    runtime: &Arc<dyn ContainerRuntime>,
    opts: &RestoreOptions,
    report: &Reporter,
) -> Result<()> {
    report.info(format!(
        "📦 Restoring stack {} from {}...",
        opts.stack_name, opts.input_path
    ));

    let key = match &opts.encryption_key {
        Some(raw) => {
            report.info("🔒 Decrypting archive (AES-256-GCM)");
            Some(
                EncryptionKey::from_bytes(raw)
                    .map_err(|e| e.in_phase(Phase::Restore, "encryption"))?,
            )
        }
        None => None,
    };

    if opts.provider.is_some() {
        report.info("☁️  Downloading from remote storage...");
    }
    let source = open_source(&opts.provider, &opts.input_path)
        .await
        .map_err(|e| e.in_phase(Phase::Restore, "source"))?;

    // Snapshot the project's current shape before touching anything: the
    // container-to-image map drives retagging, the labels drive service
    // re-materialization.
    let mut service_to_image: HashMap<String, String> = HashMap::new();
    let mut stopped: Vec<String> = Vec::new();
    let mut working_dir: Option<String> = None;
    let mut config_files: Option<String> = None;

    if !opts.stack_name.is_empty() {
        if let Ok(containers) = runtime.list_project_containers(&opts.stack_name).await {
            for ctr in &containers {
                service_to_image.insert(safe_container_name(&ctr.name), ctr.image.clone());

                if working_dir.is_none() {
                    working_dir = ctr.label(LABEL_WORKING_DIR).map(str::to_string);
                    config_files = ctr.label(LABEL_CONFIG_FILES).map(str::to_string);
                }

                if ctr.is_running() {
                    report.info(format!("⏸️  Stopping container {} for restore...", ctr.name));
                    if runtime.stop_container(&ctr.id).await.is_ok() {
                        stopped.push(ctr.id.clone());
                    }
                }
            }
        }
    }

    let walk = walk_archive(runtime, opts, report, source, key, &service_to_image).await;

    // Services come back up regardless of how the walk went.
    recreate_services(runtime.as_ref(), report, working_dir, config_files, &stopped).await;

    let found_volumes = walk?;
    if found_volumes == 0 {
        return Err(SnapError::CorruptArchive(
            "no volumes found in backup archive (is this a valid stack backup?)".into(),
        )
        .in_phase(Phase::Restore, "archive"));
    }

    report.info("✅ Stack restore complete!");
    Ok(())
}

enum RestoreItem {
    Volume {
        name: String,
        size: u64,
        chunks: mpsc::Receiver<io::Result<bytes::Bytes>>,
    },
    Image {
        name: String,
        file: TempPath,
    },
    Metadata(Box<StackMetadata>),
}

async fn walk_archive(
    runtime: &Arc<dyn ContainerRuntime>,
    opts: &RestoreOptions,
    report: &Reporter,
    source: BodyReader,
    key: Option<EncryptionKey>,
    service_to_image: &HashMap<String, String>,
) -> Result<usize> {
    let (items_tx, mut items_rx) = mpsc::channel(1);
    let bridge = SyncIoBridge::new(source);
    let demux = tokio::task::spawn_blocking(move || demux_archive(bridge, key, items_tx));

    let mut found_volumes = 0usize;
    let mut metadata: Option<StackMetadata> = None;
    // Loaded snapshots with no live container to retag against; resolved
    // from metadata after the walk.
    let mut untagged: Vec<(String, String)> = Vec::new();
    let mut walk_error: Option<SnapError> = None;

    while let Some(item) = items_rx.recv().await {
        if opts.cancel.is_cancelled() {
            walk_error = Some(SnapError::Cancelled);
            break;
        }

        match item {
            RestoreItem::Volume { name, size, chunks } => {
                report.info(format!("📁 Restoring volume: {name} (Size: {size} bytes)"));
                let mut reader = PipeReader::from_receiver(chunks);
                match runtime.restore_volume(&name, &mut reader, &opts.cancel).await {
                    Ok(()) => {
                        report.info(format!("✅ Volume {name} restored"));
                        found_volumes += 1;
                    }
                    Err(e) if e.is_cancelled() => {
                        walk_error = Some(SnapError::Cancelled);
                        break;
                    }
                    Err(e) => {
                        report.warn(format!("⚠️  Failed to restore volume {name}: {e}"));
                    }
                }
            }
            RestoreItem::Image { name, file } => {
                report.info(format!("🖼️  Restoring snapshot image for {name}..."));
                if let Some(transient) =
                    restore_image(runtime.as_ref(), report, &name, &file, service_to_image).await
                {
                    untagged.push((name, transient));
                }
            }
            RestoreItem::Metadata(meta) => metadata = Some(*meta),
        }
    }
    drop(items_rx);

    match demux.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if walk_error.is_none() {
                walk_error = Some(SnapError::from_chain_io(e).in_phase(Phase::Restore, "archive"));
            }
        }
        Err(e) => {
            if walk_error.is_none() {
                walk_error = Some(SnapError::Runtime(format!("archive reader failed: {e}")));
            }
        }
    }
    if let Some(e) = walk_error {
        return Err(e);
    }

    // Second chance for snapshots whose live mapping was missing: the
    // archive's own metadata records the original image references.
    if let Some(meta) = &metadata {
        for (service, transient) in untagged {
            if let Some(target) = meta.original_image_refs.get(&service) {
                match runtime.tag_image(&transient, target).await {
                    Ok(()) => report.info(format!("✅ Image restored: {transient} -> {target}")),
                    Err(e) => report.warn(format!(
                        "⚠️  Failed to retag {transient} to {target}: {e}"
                    )),
                }
            }
        }
    }

    Ok(found_volumes)
}

/// Load a snapshot image and retag it to the service's current image
/// reference. Returns the transient tag when no retag happened, so the
/// caller can try again from metadata.
async fn restore_image(
    runtime: &dyn ContainerRuntime,
    report: &Reporter,
    service: &str,
    file: &TempPath,
    service_to_image: &HashMap<String, String>,
) -> Option<String> {
    if let Err(e) = runtime.load_image(file).await {
        report.warn(format!("⚠️  Failed to load image for {service}: {e}"));
        return None;
    }

    // The engine keeps the tag the image was saved under; find it.
    let pattern = format!("{SNAPSHOT_TAG_PREFIX}{service}:*");
    let tags = runtime.list_images(&pattern).await.unwrap_or_default();
    let Some(transient) = tags.into_iter().next() else {
        report.warn(format!("⚠️  Could not find loaded image for {service}"));
        return None;
    };

    match service_to_image.get(service) {
        Some(target) if !target.is_empty() => {
            report.info(format!("   Retagging to: {target}"));
            match runtime.tag_image(&transient, target).await {
                Ok(()) => {
                    report.info(format!("✅ Image restored: {transient} -> {target}"));
                    None
                }
                Err(e) => {
                    report.warn(format!("⚠️  Failed to retag {transient} to {target}: {e}"));
                    Some(transient)
                }
            }
        }
        _ => {
            report.info(format!(
                "ℹ️  Snapshot loaded for {service} (no live container to retag)"
            ));
            Some(transient)
        }
    }
}

/// Bring services back: `docker compose up -d` in the recorded working
/// directory when labels gave us one, otherwise restart the containers that
/// were stopped for the restore.
async fn recreate_services(
    runtime: &dyn ContainerRuntime,
    report: &Reporter,
    working_dir: Option<String>,
    config_files: Option<String>,
    stopped: &[String],
) {
    if let Some(dir) = working_dir {
        report.info(format!("🔁 Recreating services via compose in {dir}..."));

        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose");
        if let Some(configs) = &config_files {
            for config in configs.split(',').filter(|c| !c.is_empty()) {
                cmd.args(["-f", config]);
            }
        }
        cmd.args(["up", "-d"]).current_dir(&dir);

        match cmd.output().await {
            Ok(output) if output.status.success() => {
                report.info("✅ Services recreated successfully");
                return;
            }
            Ok(output) => {
                report.warn(format!(
                    "⚠️  Compose recreation failed ({}), falling back to container restart",
                    String::from_utf8_lossy(&output.stderr).trim()
                ));
            }
            Err(e) => {
                report.warn(format!(
                    "⚠️  Compose recreation failed ({e}), falling back to container restart"
                ));
            }
        }
    }

    for id in stopped {
        report.info(format!("▶️  Restarting container {id} after restore..."));
        if let Err(e) = runtime.start_container(id).await {
            report.warn(format!("⚠️  Failed to restart container {id}: {e}"));
        }
    }
}

fn demux_archive<R: Read + 'static>(
    source: R,
    key: Option<EncryptionKey>,
    items: mpsc::Sender<RestoreItem>,
) -> io::Result<()> {
    let reader: Box<dyn Read> = match &key {
        Some(key) => Box::new(DecryptReader::new(key, source)?),
        None => Box::new(source),
    };
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();

        if name.starts_with("volumes/") && name.ends_with(".tar") {
            let volume = member_basename(&name);
            let size = entry.header().size()?;

            let (chunk_tx, chunk_rx) = mpsc::channel(PIPE_DEPTH);
            if items
                .blocking_send(RestoreItem::Volume {
                    name: volume,
                    size,
                    chunks: chunk_rx,
                })
                .is_err()
            {
                // Orchestrator is gone; stop quietly.
                return Ok(());
            }

            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = match entry.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = chunk_tx
                            .blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                        return Err(e);
                    }
                };
                if chunk_tx
                    .blocking_send(Ok(bytes::Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    // Consumer bailed; skip the rest of this member.
                    io::copy(&mut entry, &mut io::sink())?;
                    break;
                }
            }
        } else if name.starts_with("images/") && name.ends_with(".tar") {
            let service = member_basename(&name);
            let mut spill = tempfile::NamedTempFile::new()?;
            io::copy(&mut entry, spill.as_file_mut())?;
            if items
                .blocking_send(RestoreItem::Image {
                    name: service,
                    file: spill.into_temp_path(),
                })
                .is_err()
            {
                return Ok(());
            }
        } else if name == "metadata.json" {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            if let Ok(meta) = serde_json::from_slice::<StackMetadata>(&data) {
                if items
                    .blocking_send(RestoreItem::Metadata(Box::new(meta)))
                    .is_err()
                {
                    return Ok(());
                }
            }
        } else {
            // Config files and dumps are verification material, not restore
            // input.
            io::copy(&mut entry, &mut io::sink())?;
        }
    }

    Ok(())
}

/// `volumes/demo_data.tar` -> `demo_data`
fn member_basename(name: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.strip_suffix(".tar").unwrap_or(base).to_string()
}

/// Decrypt and decompress the archive, returning only its member names.
/// No side effects on the runtime; used for previews.
pub async fn peek_backup(opts: RestoreOptions) -> Result<Vec<String>> {
    let key = match &opts.encryption_key {
        Some(raw) => Some(EncryptionKey::from_bytes(raw)?),
        None => None,
    };
    let source = open_source(&opts.provider, &opts.input_path).await?;
    let bridge = SyncIoBridge::new(source);

    tokio::task::spawn_blocking(move || -> io::Result<Vec<String>> {
        let reader: Box<dyn Read> = match &key {
            Some(key) => Box::new(DecryptReader::new(key, bridge)?),
            None => Box::new(bridge),
        };
        let mut archive = tar::Archive::new(GzDecoder::new(reader));

        let mut names = Vec::new();
        for entry in archive.entries()? {
            let entry = entry?;
            names.push(String::from_utf8_lossy(&entry.path_bytes()).into_owned());
        }
        Ok(names)
    })
    .await
    .map_err(|e| SnapError::Runtime(format!("peek task failed: {e}")))?
    .map_err(SnapError::from_chain_io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_basename() {
        assert_eq!(member_basename("volumes/demo_data.tar"), "demo_data");
        assert_eq!(member_basename("images/demo-web-1.tar"), "demo-web-1");
        assert_eq!(member_basename("plain.tar"), "plain");
        assert_eq!(member_basename("noext"), "noext");
    }
}
