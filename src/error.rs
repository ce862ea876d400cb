//! Typed errors for backup and restore operations.
//!
//! Errors are matchable sentinels (`SnapError::VolumeNotFound`, ...) that can
//! additionally be wrapped with the pipeline phase, the component that failed,
//! a retryability flag and a remediation hint via [`SnapError::in_phase`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Pipeline phase in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preflight,
    Pause,
    Dump,
    Archive,
    Upload,
    Restore,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Preflight => "preflight",
            Phase::Pause => "pause",
            Phase::Dump => "dump",
            Phase::Archive => "archive",
            Phase::Upload => "upload",
            Phase::Restore => "restore",
            Phase::Verify => "verify",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum SnapError {
    #[error("cannot connect to container runtime: {0}")]
    RuntimeUnreachable(String),

    #[error("encryption key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("stack directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("no compose file found in {0}")]
    ComposeFileNotFound(PathBuf),

    #[error("archive corrupted: {0}")]
    CorruptArchive(String),

    #[error("invalid encryption header")]
    InvalidHeader,

    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u8),

    #[error("authentication failed: backup may be corrupted or tampered")]
    AuthenticationFailed,

    #[error("storage access denied: {0}")]
    StorageAccessDenied(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("insufficient disk space: {0}")]
    DiskFull(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compose parse error: {0}")]
    ComposeParse(#[from] serde_yaml::Error),

    #[error("[{phase}] {component}: {source}")]
    Op {
        phase: Phase,
        component: String,
        #[source]
        source: Box<SnapError>,
        retryable: bool,
        suggestion: Option<String>,
    },
}

impl SnapError {
    /// Wrap this error with the phase and component it occurred in.
    pub fn in_phase(self, phase: Phase, component: &str) -> Self {
        let retryable = self.is_retryable();
        SnapError::Op {
            phase,
            component: component.to_string(),
            source: Box::new(self),
            retryable,
            suggestion: None,
        }
    }

    /// Attach a remediation hint. Only meaningful on an `Op` wrapper.
    pub fn with_suggestion(self, hint: &str) -> Self {
        match self {
            SnapError::Op {
                phase,
                component,
                source,
                retryable,
                ..
            } => SnapError::Op {
                phase,
                component,
                source,
                retryable,
                suggestion: Some(hint.to_string()),
            },
            other => other,
        }
    }

    /// Innermost error, unwrapping any `Op` layers.
    pub fn root(&self) -> &SnapError {
        match self {
            SnapError::Op { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), SnapError::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SnapError::Op { retryable, .. } => *retryable,
            SnapError::NetworkTimeout(_) => true,
            SnapError::Cancelled => false,
            other => crate::storage::retry::is_retryable_message(&other.to_string()),
        }
    }

    /// Phase of the outermost `Op` wrapper, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            SnapError::Op { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Recover a typed error that was tunnelled through the sync byte chain as
    /// an `std::io::Error` payload (see `crypto::DecryptReader`).
    pub fn from_chain_io(err: std::io::Error) -> SnapError {
        match err.get_ref().and_then(|e| e.downcast_ref::<SnapError>()) {
            Some(SnapError::AuthenticationFailed) => SnapError::AuthenticationFailed,
            Some(SnapError::UnsupportedVersion(v)) => SnapError::UnsupportedVersion(*v),
            Some(SnapError::InvalidHeader) => SnapError::InvalidHeader,
            Some(SnapError::CorruptArchive(msg)) => SnapError::CorruptArchive(msg.clone()),
            Some(SnapError::Cancelled) => SnapError::Cancelled,
            _ => SnapError::Io(err),
        }
    }

    /// Embed a typed error into an `std::io::Error` so it survives passage
    /// through `tar`/`flate2` reader stacks.
    pub fn into_chain_io(self) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, self)
    }
}

impl From<bollard::errors::Error> for SnapError {
    fn from(err: bollard::errors::Error) -> Self {
        SnapError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SnapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_wrapper_display() {
        let err = SnapError::VolumeNotFound("demo_data".into()).in_phase(Phase::Archive, "volume");
        let msg = err.to_string();
        assert!(msg.contains("[archive]"));
        assert!(msg.contains("demo_data"));
    }

    #[test]
    fn test_root_unwraps_nested_ops() {
        let err = SnapError::Cancelled
            .in_phase(Phase::Dump, "postgres")
            .in_phase(Phase::Archive, "pipeline");
        assert!(matches!(err.root(), SnapError::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_chain_io_round_trip() {
        let io = SnapError::AuthenticationFailed.into_chain_io();
        assert!(matches!(
            SnapError::from_chain_io(io),
            SnapError::AuthenticationFailed
        ));

        let io = SnapError::UnsupportedVersion(7).into_chain_io();
        assert!(matches!(
            SnapError::from_chain_io(io),
            SnapError::UnsupportedVersion(7)
        ));
    }

    #[test]
    fn test_cancellation_not_retryable() {
        assert!(!SnapError::Cancelled.is_retryable());
        assert!(SnapError::NetworkTimeout("dial".into()).is_retryable());
    }
}
