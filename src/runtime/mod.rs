//! Container runtime abstraction.
//!
//! [`ContainerRuntime`] is the capability surface the pipeline needs from a
//! container engine: container lifecycle, volume streaming through helper
//! containers, exec, and image snapshot operations. The production
//! implementation is [`DockerRuntime`]; tests substitute an in-memory mock.

mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Compose label carrying the owning project name.
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
/// Compose label carrying the service name.
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
/// Compose label carrying the project working directory.
pub const LABEL_WORKING_DIR: &str = "com.docker.compose.project.working_dir";
/// Compose label carrying the comma-separated config file list.
pub const LABEL_CONFIG_FILES: &str = "com.docker.compose.project.config_files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
    Dead,
    Restarting,
    Created,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            "restarting" => ContainerState::Restarting,
            "created" => ContainerState::Created,
            _ => ContainerState::Unknown,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Restarting => "restarting",
            ContainerState::Created => "created",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Starting,
    #[default]
    None,
}

impl HealthState {
    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            "starting" => HealthState::Starting,
            _ => HealthState::None,
        }
    }
}

/// Read-only view of a container, as returned by list/inspect operations.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Container name with the leading `/` stripped.
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub health: HealthState,
    pub labels: HashMap<String, String>,
    /// Named volumes mounted into the container.
    pub volumes: Vec<String>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Capability surface over a container engine. All operations observe
/// cancellation; the streaming operations additionally take the token
/// explicitly so they can tear down their helper containers on cancel.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;
    async fn list_all_containers(&self) -> Result<Vec<ContainerInfo>>;
    async fn list_project_containers(&self, project: &str) -> Result<Vec<ContainerInfo>>;
    async fn list_containers_using_volume(&self, volume: &str) -> Result<Vec<ContainerInfo>>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;
    /// Volumes labelled with the project name, unioned with volumes whose
    /// name carries the `<project>_` prefix.
    async fn list_project_volumes(&self, project: &str) -> Result<Vec<String>>;
    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn pause_container(&self, id: &str) -> Result<()>;
    async fn unpause_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str) -> Result<()>;
    async fn start_container(&self, id: &str) -> Result<()>;
    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Run a one-shot command inside the container and capture its stdout.
    /// A nonzero exit fails with the exit code, stderr folded into the error.
    async fn exec(&self, id: &str, cmd: &[&str]) -> Result<Vec<u8>>;

    /// Stream an uncompressed tar of the volume's root contents to `writer`
    /// by running `tar -cf -` in a helper container mounting the volume.
    async fn backup_volume(
        &self,
        name: &str,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// The symmetric inverse: pipe `reader` into `tar -xf - -C /volume` in a
    /// helper container.
    async fn restore_volume(
        &self,
        name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Commit a container to an image reference, returning the image id.
    async fn commit_container(&self, id: &str, reference: &str) -> Result<String>;
    async fn save_image(&self, reference: &str, path: &Path) -> Result<()>;
    async fn load_image(&self, path: &Path) -> Result<()>;
    /// Image references matching a `repo:tag` filter pattern.
    async fn list_images(&self, reference_filter: &str) -> Result<Vec<String>>;
    async fn tag_image(&self, source: &str, target: &str) -> Result<()>;
    async fn remove_image(&self, id: &str) -> Result<()>;

    /// Last `tail` lines of a container's combined output.
    async fn container_logs(&self, id: &str, tail: usize) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_parse() {
        assert_eq!(ContainerState::parse("running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("paused"), ContainerState::Paused);
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("weird"), ContainerState::Unknown);
        assert_eq!(ContainerState::Running.to_string(), "running");
    }

    #[test]
    fn test_health_state_parse() {
        assert_eq!(HealthState::parse("healthy"), HealthState::Healthy);
        assert_eq!(HealthState::parse("unhealthy"), HealthState::Unhealthy);
        assert_eq!(HealthState::parse("starting"), HealthState::Starting);
        assert_eq!(HealthState::parse(""), HealthState::None);
    }
}
