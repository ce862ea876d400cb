//! Docker Engine implementation of the runtime adapter, built on bollard.
//!
//! Volume I/O is mediated by a short-lived helper container running `tar`
//! rather than by opening host paths directly. That works uniformly no
//! matter where the engine stores volume data, including remote engines.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{
    CommitContainerOptions, CreateImageOptions, ImportImageOptions, ListImagesOptions,
    RemoveImageOptions, TagImageOptions,
};
use bollard::models::{HostConfig, Mount, MountPointTypeEnum, MountTypeEnum};
use bollard::volume::{ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{
    ContainerInfo, ContainerRuntime, ContainerState, HealthState, LABEL_PROJECT,
};
use crate::error::{Result, SnapError};

/// Image used for helper containers; pulled on first use.
const HELPER_IMAGE: &str = "alpine:latest";

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local engine endpoint (socket or env-configured host).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SnapError::RuntimeUnreachable(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn ensure_helper_image(&self) -> Result<()> {
        if self.docker.inspect_image(HELPER_IMAGE).await.is_ok() {
            return Ok(());
        }

        tracing::info!("Pulling helper image {}", HELPER_IMAGE);
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: HELPER_IMAGE.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| {
                SnapError::Runtime(format!("failed to pull helper image: {e}"))
            })?;
        }
        Ok(())
    }

    async fn create_helper(&self, volume: &str, config: Config<String>) -> Result<String> {
        let mut config = config;
        config.image = Some(HELPER_IMAGE.to_string());
        config.host_config = Some(HostConfig {
            mounts: Some(vec![Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: Some(volume.to_string()),
                target: Some("/volume".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        Ok(created.id)
    }

    async fn remove_helper(&self, id: &str) {
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("Failed to remove helper container {}: {}", id, e);
        }
    }

    /// Wait for a container to exit and check its status code.
    async fn wait_for_exit(&self, id: &str, context: &str, stderr: &[u8]) -> Result<()> {
        let mut wait = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(status)) if status.status_code == 0 => Ok(()),
            Some(Ok(status)) => Err(SnapError::Runtime(format!(
                "{context} failed with exit code {}: {}",
                status.status_code,
                String::from_utf8_lossy(stderr)
            ))),
            Some(Err(e)) => Err(SnapError::Runtime(format!(
                "{context} failed: {e}: {}",
                String::from_utf8_lossy(stderr)
            ))),
            None => Ok(()),
        }
    }

    async fn stream_backup(
        &self,
        helper_id: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attach = self
            .docker
            .attach_container(
                helper_id,
                Some(AttachContainerOptions::<String> {
                    stream: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        self.docker
            .start_container(helper_id, None::<StartContainerOptions<String>>)
            .await?;

        let mut stderr = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(SnapError::Cancelled),
                frame = attach.output.next() => match frame {
                    Some(Ok(LogOutput::StdOut { message }))
                    | Some(Ok(LogOutput::Console { message })) => {
                        writer.write_all(&message).await?;
                    }
                    Some(Ok(LogOutput::StdErr { message })) => {
                        stderr.extend_from_slice(&message);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(SnapError::Runtime(format!(
                            "failed to read backup stream: {e}"
                        )));
                    }
                    None => break,
                },
            }
        }
        writer.flush().await?;

        self.wait_for_exit(helper_id, "volume backup", &stderr).await
    }

    async fn stream_restore(
        &self,
        helper_id: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut attach = self
            .docker
            .attach_container(
                helper_id,
                Some(AttachContainerOptions::<String> {
                    stream: Some(true),
                    stdin: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        self.docker
            .start_container(helper_id, None::<StartContainerOptions<String>>)
            .await?;

        let copy = async {
            tokio::io::copy(reader, &mut attach.input)
                .await
                .map_err(SnapError::Io)?;
            attach.input.shutdown().await.map_err(SnapError::Io)?;
            Ok::<(), SnapError>(())
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(SnapError::Cancelled),
            result = copy => result?,
        }

        let result = self.wait_for_exit(helper_id, "volume restore", &[]).await;
        if result.is_err() {
            // Surface what tar printed before exiting nonzero.
            if let Ok(logs) = self.container_logs(helper_id, 20).await {
                if !logs.is_empty() {
                    return Err(SnapError::Runtime(format!(
                        "volume restore failed: {}",
                        logs.trim()
                    )));
                }
            }
        }
        result
    }
}

fn summary_to_info(summary: bollard::models::ContainerSummary) -> ContainerInfo {
    let name = summary
        .names
        .unwrap_or_default()
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let volumes = summary
        .mounts
        .unwrap_or_default()
        .into_iter()
        .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
        .filter_map(|m| m.name)
        .collect();

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        image: summary.image.unwrap_or_default(),
        state: ContainerState::parse(summary.state.as_deref().unwrap_or_default()),
        health: HealthState::None,
        labels: summary.labels.unwrap_or_default(),
        volumes,
    }
}

fn project_filter(project: &str) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert(
        "label".to_string(),
        vec![format!("{LABEL_PROJECT}={project}")],
    );
    filters
}

/// Split an image reference into repository and tag.
fn split_reference(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        // A colon inside a registry host:port is not a tag separator.
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| SnapError::RuntimeUnreachable(e.to_string()))?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let inspect = self.docker.inspect_container(id, None).await?;

        let name = inspect
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let config = inspect.config.unwrap_or_default();

        let (state, health) = match inspect.state {
            Some(state) => {
                let status = state
                    .status
                    .map(|s| ContainerState::parse(&s.to_string()))
                    .unwrap_or(ContainerState::Unknown);
                let health = state
                    .health
                    .and_then(|h| h.status)
                    .map(|s| HealthState::parse(&s.to_string()))
                    .unwrap_or_default();
                (status, health)
            }
            None => (ContainerState::Unknown, HealthState::None),
        };

        let volumes = inspect
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
            .filter_map(|m| m.name)
            .collect();

        Ok(ContainerInfo {
            id: id.to_string(),
            name,
            image: config.image.unwrap_or_default(),
            state,
            health,
            labels: config.labels.unwrap_or_default(),
            volumes,
        })
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerInfo>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().map(summary_to_info).collect())
    }

    async fn list_project_containers(&self, project: &str) -> Result<Vec<ContainerInfo>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: project_filter(project),
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().map(summary_to_info).collect())
    }

    async fn list_containers_using_volume(&self, volume: &str) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![volume.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().map(summary_to_info).collect())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_project_volumes(&self, project: &str) -> Result<Vec<String>> {
        let labelled = self
            .docker
            .list_volumes(Some(ListVolumesOptions {
                filters: project_filter(project),
            }))
            .await?;

        let mut names: std::collections::BTreeSet<String> = labelled
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect();

        // Older compose versions did not label volumes; fall back to the
        // project name prefix.
        let prefix = format!("{project}_");
        if let Ok(all) = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
        {
            for vol in all.volumes.unwrap_or_default() {
                if vol.name.starts_with(&prefix) {
                    names.insert(vol.name);
                }
            }
        }

        Ok(names.into_iter().collect())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        self.docker
            .pause_container(id)
            .await
            .map_err(|e| SnapError::Runtime(format!("failed to pause container {id}: {e}")))
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.docker
            .unpause_container(id)
            .await
            .map_err(|e| SnapError::Runtime(format!("failed to unpause container {id}: {e}")))
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<Vec<u8>> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match self.docker.start_exec(&exec.id, None::<StartExecOptions>).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(frame) = output.next().await {
                    match frame? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        match inspect.exit_code {
            Some(0) | None => Ok(stdout),
            Some(code) => Err(SnapError::Runtime(format!(
                "command exited with code {code}: {}",
                String::from_utf8_lossy(&stderr)
            ))),
        }
    }

    async fn backup_volume(
        &self,
        name: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.volume_exists(name).await? {
            return Err(SnapError::VolumeNotFound(name.to_string()));
        }
        self.ensure_helper_image().await?;

        let helper_id = self
            .create_helper(
                name,
                Config {
                    cmd: Some(
                        ["tar", "-cf", "-", "-C", "/volume", "."]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let result = self.stream_backup(&helper_id, writer, cancel).await;
        self.remove_helper(&helper_id).await;
        result
    }

    async fn restore_volume(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_helper_image().await?;

        let helper_id = self
            .create_helper(
                name,
                Config {
                    cmd: Some(
                        ["tar", "-xf", "-", "-C", "/volume"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                    open_stdin: Some(true),
                    stdin_once: Some(true),
                    attach_stdin: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let result = self.stream_restore(&helper_id, reader, cancel).await;
        self.remove_helper(&helper_id).await;
        result
    }

    async fn commit_container(&self, id: &str, reference: &str) -> Result<String> {
        let (repo, tag) = split_reference(reference);
        let commit = self
            .docker
            .commit_container(
                CommitContainerOptions {
                    container: id.to_string(),
                    repo,
                    tag,
                    comment: "Created by StackSnap backup".to_string(),
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await?;
        Ok(commit.id.unwrap_or_default())
    }

    async fn save_image(&self, reference: &str, path: &Path) -> Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut export = self.docker.export_image(reference);
        while let Some(chunk) = export.next().await {
            let chunk = chunk.map_err(|e| SnapError::Runtime(format!("failed to save image: {e}")))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn load_image(&self, path: &Path) -> Result<()> {
        let body = bytes::Bytes::from(tokio::fs::read(path).await?);

        let mut load = self
            .docker
            .import_image(ImportImageOptions { quiet: true }, body, None);
        while let Some(progress) = load.next().await {
            progress.map_err(|e| SnapError::Runtime(format!("failed to load image: {e}")))?;
        }
        Ok(())
    }

    async fn list_images(&self, reference_filter: &str) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "reference".to_string(),
            vec![reference_filter.to_string()],
        );

        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .flat_map(|img| img.repo_tags)
            .filter(|tag| !tag.contains("<none>"))
            .collect())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_reference(target);
        self.docker
            .tag_image(source, Some(TagImageOptions { repo, tag }))
            .await?;
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.docker
            .remove_image(
                id,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn container_logs(&self, id: &str, tail: usize) -> Result<String> {
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = String::new();
        while let Some(frame) = logs.next().await {
            match frame {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => {
                    out.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}
