//! Compose project discovery.
//!
//! Locates and parses a project manifest, qualifying named volumes with the
//! project prefix and collecting the env, secret and build files that belong
//! in a backup. A project can also be synthesized from a bare project name
//! when no directory is available (label-based discovery).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SnapError};

/// Manifest filenames probed in order.
const COMPOSE_CANDIDATES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// Build artifacts collected alongside the manifest when present.
const BUILD_CANDIDATES: &[&str] = &["Dockerfile", "Dockerfile.dev", "Dockerfile.prod", ".dockerignore"];

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, Service>,
    #[serde(default)]
    volumes: BTreeMap<String, Option<VolumeSpec>>,
    #[serde(default)]
    secrets: BTreeMap<String, SecretSpec>,
}

#[derive(Debug, Deserialize)]
struct Service {
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    env_file: Option<EnvFile>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvFile {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct VolumeSpec {
    #[serde(default)]
    #[allow(dead_code)]
    driver: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretSpec {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    external: bool,
}

/// A single volume declaration on a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub source: String,
    pub target: String,
    pub is_named: bool,
    pub service_name: String,
}

/// A discovered compose project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    /// Absent for standalone (label-discovered) stacks.
    pub compose_file: Option<PathBuf>,
    pub services: Vec<String>,
    pub volume_mounts: Vec<VolumeMount>,
    /// Named volumes, fully qualified with the project prefix.
    pub named_volumes: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub secret_files: Vec<PathBuf>,
    pub build_files: Vec<PathBuf>,
    pub is_standalone: bool,
}

impl Stack {
    /// Synthesize a minimal stack from a project name and its engine-side
    /// volume set, for projects backed up without a directory.
    pub fn standalone(name: &str, mut named_volumes: Vec<String>) -> Self {
        named_volumes.sort();
        Self {
            name: name.to_string(),
            compose_file: None,
            services: Vec::new(),
            volume_mounts: Vec::new(),
            named_volumes,
            env_files: Vec::new(),
            secret_files: Vec::new(),
            build_files: Vec::new(),
            is_standalone: true,
        }
    }
}

/// Locate the manifest in `dir`, probing the fixed candidate list in order.
pub fn find_compose_file(dir: &Path) -> Result<PathBuf> {
    for name in COMPOSE_CANDIDATES {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(SnapError::ComposeFileNotFound(dir.to_path_buf()))
}

/// Discover a stack from a project directory.
///
/// Discovery is deterministic: collections come out sorted, so two runs over
/// an unchanged directory yield equal stacks.
pub fn discover_stack(dir: &Path) -> Result<Stack> {
    let compose_path = find_compose_file(dir)?;
    let data = std::fs::read_to_string(&compose_path)?;
    let compose: ComposeFile = serde_yaml::from_str(&data)?;

    let abs_dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let project_name = abs_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut services: Vec<String> = compose.services.keys().cloned().collect();
    services.sort();

    let mut volume_mounts = Vec::new();
    for (service_name, service) in &compose.services {
        for spec in &service.volumes {
            volume_mounts.push(parse_volume_mount(spec, service_name));
        }
    }

    let mut named_volumes: Vec<String> = compose
        .volumes
        .keys()
        .map(|v| format!("{project_name}_{v}"))
        .collect();
    named_volumes.sort();

    // Env files: the project-level .env plus every per-service declaration,
    // deduplicated by absolute path.
    let mut env_candidates = vec![".env".to_string()];
    for service in compose.services.values() {
        match &service.env_file {
            Some(EnvFile::One(path)) => env_candidates.push(path.clone()),
            Some(EnvFile::Many(paths)) => env_candidates.extend(paths.iter().cloned()),
            None => {}
        }
    }

    let mut seen_env = BTreeSet::new();
    let mut env_files = Vec::new();
    for candidate in env_candidates {
        let path = dir.join(&candidate);
        if path.is_file() {
            let abs = path.canonicalize().unwrap_or_else(|_| path.clone());
            if seen_env.insert(abs) {
                env_files.push(path);
            }
        }
    }

    let mut secret_files = Vec::new();
    for spec in compose.secrets.values() {
        if spec.external {
            continue;
        }
        if let Some(file) = &spec.file {
            let path = dir.join(file);
            if path.is_file() {
                secret_files.push(path.canonicalize().unwrap_or(path));
            }
        }
    }
    secret_files.sort();

    let mut build_files = Vec::new();
    for name in BUILD_CANDIDATES {
        let path = dir.join(name);
        if path.is_file() {
            build_files.push(path.canonicalize().unwrap_or(path));
        }
    }

    Ok(Stack {
        name: project_name,
        compose_file: Some(compose_path),
        services,
        volume_mounts,
        named_volumes,
        env_files,
        secret_files,
        build_files,
        is_standalone: false,
    })
}

/// Parse a compose volume-mount string into source and target.
///
/// The split point is the first `:` that is not part of a Windows drive
/// letter. A trailing `:ro`/`:rw` access mode is stripped from the target.
/// Sources starting with `/`, `.` or `~` are bind mounts; everything else is
/// a named volume.
pub fn parse_volume_mount(spec: &str, service_name: &str) -> VolumeMount {
    let bytes = spec.as_bytes();
    let mut colon_idx = None;
    for (i, b) in bytes.iter().enumerate() {
        if *b == b':' {
            // C:\... style source paths keep their drive-letter colon.
            if i == 1 && bytes.len() > 2 && bytes[2] == b'\\' {
                continue;
            }
            colon_idx = Some(i);
            break;
        }
    }

    let Some(idx) = colon_idx else {
        // Anonymous form: the single token is both source and target.
        return VolumeMount {
            source: spec.to_string(),
            target: spec.to_string(),
            is_named: true,
            service_name: service_name.to_string(),
        };
    };

    let source = &spec[..idx];
    let mut target = &spec[idx + 1..];
    if let Some(mode_idx) = target.rfind(':') {
        let mode = &target[mode_idx + 1..];
        if mode == "ro" || mode == "rw" {
            target = &target[..mode_idx];
        }
    }

    let is_named = !source.starts_with('/') && !source.starts_with('.') && !source.starts_with('~');

    VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
        is_named,
        service_name: service_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const COMPOSE: &str = r#"
services:
  web:
    image: nginx:latest
    volumes:
      - data:/var/www
      - ./conf:/etc/nginx:ro
    env_file: web.env
  db:
    image: postgres:16
    volumes:
      - pgdata:/var/lib/postgresql/data
    env_file:
      - web.env
      - db.env
volumes:
  data:
  pgdata:
secrets:
  db_password:
    file: ./secrets/db_password.txt
  api_token:
    external: true
"#;

    fn write_project(dir: &Path) {
        fs::write(dir.join("docker-compose.yml"), COMPOSE).unwrap();
        fs::write(dir.join(".env"), "A=1\n").unwrap();
        fs::write(dir.join("web.env"), "B=2\n").unwrap();
        fs::write(dir.join("db.env"), "C=3\n").unwrap();
        fs::create_dir(dir.join("secrets")).unwrap();
        fs::write(dir.join("secrets/db_password.txt"), "hunter2\n").unwrap();
        fs::write(dir.join("Dockerfile"), "FROM nginx\n").unwrap();
    }

    #[test]
    fn test_find_compose_file_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("compose.yaml"), "services: {}\n").unwrap();
        fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let found = find_compose_file(dir.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }

    #[test]
    fn test_find_compose_file_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            find_compose_file(dir.path()),
            Err(SnapError::ComposeFileNotFound(_))
        ));
    }

    #[test]
    fn test_discover_stack() {
        let dir = TempDir::new().unwrap();
        write_project(dir.path());

        let stack = discover_stack(dir.path()).unwrap();
        let project = dir
            .path()
            .canonicalize()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        assert_eq!(stack.services, vec!["db", "web"]);
        assert_eq!(
            stack.named_volumes,
            vec![format!("{project}_data"), format!("{project}_pgdata")]
        );
        // .env, web.env, db.env; web.env is declared twice but deduplicated.
        assert_eq!(stack.env_files.len(), 3);
        assert_eq!(stack.secret_files.len(), 1);
        assert_eq!(stack.build_files.len(), 1);
        assert!(!stack.is_standalone);
    }

    #[test]
    fn test_discovery_idempotent() {
        let dir = TempDir::new().unwrap();
        write_project(dir.path());

        let first = discover_stack(dir.path()).unwrap();
        let second = discover_stack(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_standalone_stack() {
        let stack = Stack::standalone("demo", vec!["demo_b".into(), "demo_a".into()]);
        assert_eq!(stack.name, "demo");
        assert_eq!(stack.named_volumes, vec!["demo_a", "demo_b"]);
        assert!(stack.is_standalone);
        assert!(stack.compose_file.is_none());
    }

    #[test]
    fn test_parse_volume_mount_named() {
        let m = parse_volume_mount("data:/var/lib/data", "web");
        assert_eq!(m.source, "data");
        assert_eq!(m.target, "/var/lib/data");
        assert!(m.is_named);
    }

    #[test]
    fn test_parse_volume_mount_bind() {
        for source in ["./conf", "/etc/conf", "~/conf"] {
            let m = parse_volume_mount(&format!("{source}:/target"), "web");
            assert_eq!(m.source, source);
            assert!(!m.is_named, "{source} should be a bind mount");
        }
    }

    #[test]
    fn test_parse_volume_mount_mode_stripped() {
        let m = parse_volume_mount("data:/var/www:ro", "web");
        assert_eq!(m.target, "/var/www");
        let m = parse_volume_mount("data:/var/www:rw", "web");
        assert_eq!(m.target, "/var/www");
        // A colon that is not an access mode stays in the target.
        let m = parse_volume_mount("data:/var/www:z", "web");
        assert_eq!(m.target, "/var/www:z");
    }

    #[test]
    fn test_parse_volume_mount_windows_drive() {
        let m = parse_volume_mount(r"C:\data:/target", "web");
        assert_eq!(m.source, r"C:\data");
        assert_eq!(m.target, "/target");
        assert!(m.is_named); // does not start with /, . or ~
    }

    #[test]
    fn test_parse_volume_mount_anonymous() {
        let m = parse_volume_mount("/var/cache", "web");
        assert_eq!(m.source, "/var/cache");
        assert_eq!(m.target, "/var/cache");
    }
}
