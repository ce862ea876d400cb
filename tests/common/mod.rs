//! In-memory runtime used by the pipeline integration tests.
//!
//! Volumes are maps of file name to bytes; backup streams them out as real
//! tar data, restore parses tar data back in. Pause, image and exec calls
//! are recorded so tests can assert on lifecycle balance and cleanup.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use stacksnap::error::{Result, SnapError};
use stacksnap::runtime::{
    ContainerInfo, ContainerRuntime, ContainerState, HealthState, LABEL_PROJECT,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct MockState {
    pub containers: Vec<ContainerInfo>,
    /// volume name -> file name -> contents
    pub volumes: HashMap<String, HashMap<String, Vec<u8>>>,
    pub paused: Vec<String>,
    pub unpaused: Vec<String>,
    pub stopped: Vec<String>,
    pub started: Vec<String>,
    pub fail_pause: HashSet<String>,
    pub fail_volumes: HashSet<String>,
    pub slow_volumes: HashSet<String>,
    /// container id -> exec stdout
    pub exec_responses: HashMap<String, Vec<u8>>,
    /// Delay applied to every image save, to order saves against concurrent
    /// pipeline failures.
    pub save_delay: Option<Duration>,
    pub committed: Vec<String>,
    pub removed_images: Vec<String>,
    pub loaded_images: Vec<String>,
    /// (source, target) pairs applied via tag_image
    pub tags_applied: Vec<(String, String)>,
}

#[derive(Default)]
pub struct MockRuntime {
    pub state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock state lock poisoned")
    }
}

/// Build a running container for test fixtures.
pub fn container(id: &str, name: &str, image: &str, project: &str, volumes: &[&str]) -> ContainerInfo {
    let mut labels = HashMap::new();
    labels.insert(LABEL_PROJECT.to_string(), project.to_string());
    ContainerInfo {
        id: id.to_string(),
        name: name.to_string(),
        image: image.to_string(),
        state: ContainerState::Running,
        health: HealthState::None,
        labels,
        volumes: volumes.iter().map(|v| v.to_string()).collect(),
    }
}

fn volume_as_tar(files: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut names: Vec<&String> = files.keys().collect();
    names.sort();
    for name in names {
        let data = &files[name];
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name.as_str(), data.as_slice())
            .expect("in-memory tar append");
    }
    builder.into_inner().expect("in-memory tar finish")
}

fn tar_to_files(data: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    let mut files = HashMap::new();
    for entry in archive.entries().expect("parse restored tar") {
        let mut entry = entry.expect("restored tar entry");
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).expect("read entry");
        files.insert(name, contents);
    }
    files
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.lock()
            .containers
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| SnapError::Runtime(format!("no such container: {id}")))
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self.lock().containers.clone())
    }

    async fn list_project_containers(&self, project: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.labels.get(LABEL_PROJECT).map(String::as_str) == Some(project))
            .cloned()
            .collect())
    }

    async fn list_containers_using_volume(&self, volume: &str) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.volumes.iter().any(|v| v == volume))
            .cloned()
            .collect())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().volumes.contains_key(name))
    }

    async fn list_project_volumes(&self, project: &str) -> Result<Vec<String>> {
        let prefix = format!("{project}_");
        let mut names: Vec<String> = self
            .lock()
            .volumes
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.lock().volumes.remove(name);
        Ok(())
    }

    async fn pause_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_pause.contains(id) {
            return Err(SnapError::Runtime(format!("cannot pause {id}")));
        }
        state.paused.push(id.to_string());
        Ok(())
    }

    async fn unpause_container(&self, id: &str) -> Result<()> {
        self.lock().unpaused.push(id.to_string());
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.lock().stopped.push(id.to_string());
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.lock().started.push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, id: &str, _cmd: &[&str]) -> Result<Vec<u8>> {
        self.lock()
            .exec_responses
            .get(id)
            .cloned()
            .ok_or_else(|| SnapError::Runtime(format!("exec failed in {id}")))
    }

    async fn backup_volume(
        &self,
        name: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (slow, failing, data) = {
            let state = self.lock();
            let files = state
                .volumes
                .get(name)
                .ok_or_else(|| SnapError::VolumeNotFound(name.to_string()))?;
            (
                state.slow_volumes.contains(name),
                state.fail_volumes.contains(name),
                volume_as_tar(files),
            )
        };

        if failing {
            return Err(SnapError::Runtime(format!(
                "volume backup helper exited with status 2: tar: {name} is busy"
            )));
        }
        if slow {
            // Dribble forever until the caller gives up.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SnapError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {
                        writer.write_all(&[0u8; 512]).await?;
                    }
                }
            }
        }

        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn restore_volume(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let files = tar_to_files(&data);
        self.lock().volumes.insert(name.to_string(), files);
        Ok(())
    }

    async fn commit_container(&self, _id: &str, reference: &str) -> Result<String> {
        self.lock().committed.push(reference.to_string());
        Ok(format!("sha256:{reference}"))
    }

    async fn save_image(&self, reference: &str, path: &Path) -> Result<()> {
        let delay = self.lock().save_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        std::fs::write(path, reference.as_bytes())?;
        Ok(())
    }

    async fn load_image(&self, path: &Path) -> Result<()> {
        let reference = String::from_utf8_lossy(&std::fs::read(path)?).into_owned();
        self.lock().loaded_images.push(reference);
        Ok(())
    }

    async fn list_images(&self, reference_filter: &str) -> Result<Vec<String>> {
        let prefix = reference_filter.trim_end_matches('*');
        Ok(self
            .lock()
            .loaded_images
            .iter()
            .filter(|tag| tag.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        self.lock()
            .tags_applied
            .push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn remove_image(&self, id: &str) -> Result<()> {
        self.lock().removed_images.push(id.to_string());
        Ok(())
    }

    async fn container_logs(&self, _id: &str, _tail: usize) -> Result<String> {
        Ok(String::new())
    }
}
