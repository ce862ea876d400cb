//! Pre-flight checks run before any backup work starts.
//!
//! Findings are classified by severity; only `Error` findings stop the
//! operation. Everything else is surfaced to the caller's log sink and the
//! backup proceeds.

use std::fmt;

use super::BackupOptions;
use crate::crypto::KEY_LEN;
use crate::runtime::ContainerRuntime;
use crate::utils::fmt::format_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn icon(&self) -> &'static str {
        match self {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Error => "❌",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct PreflightFinding {
    pub severity: Severity,
    pub message: String,
    pub fix: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PreflightReport {
    pub findings: Vec<PreflightFinding>,
    pub can_proceed: bool,
}

impl PreflightReport {
    fn error(&mut self, message: String, fix: &str) {
        self.findings.push(PreflightFinding {
            severity: Severity::Error,
            message,
            fix: Some(fix.to_string()),
        });
        self.can_proceed = false;
    }

    fn warning(&mut self, message: String, fix: &str) {
        self.findings.push(PreflightFinding {
            severity: Severity::Warning,
            message,
            fix: Some(fix.to_string()),
        });
    }

    fn info(&mut self, message: String, fix: &str) {
        self.findings.push(PreflightFinding {
            severity: Severity::Info,
            message,
            fix: Some(fix.to_string()),
        });
    }
}

/// Conservative estimate of staging space a backup needs.
///
/// TODO: replace the constant with engine disk-usage queries so small stacks
/// stop tripping the low-space warning on small hosts.
fn estimate_backup_size() -> u64 {
    10 * 1024 * 1024 * 1024
}

async fn available_temp_space() -> Option<u64> {
    let temp = std::env::temp_dir();
    let output = tokio::process::Command::new("df")
        .args(["-B1", &temp.to_string_lossy()])
        .output()
        .await
        .ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.trim().lines().nth(1)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    parts.get(3)?.parse().ok()
}

pub async fn preflight_checks(
    runtime: &dyn ContainerRuntime,
    opts: &BackupOptions,
) -> PreflightReport {
    let mut report = PreflightReport {
        findings: Vec::new(),
        can_proceed: true,
    };

    if let Err(e) = runtime.ping().await {
        report.error(
            format!("Container runtime not accessible: {e}"),
            "Ensure the engine is running and the endpoint is reachable",
        );
        return report;
    }

    let required = estimate_backup_size() * 2;
    if let Some(available) = available_temp_space().await {
        if available < required {
            report.warning(
                format!(
                    "Low disk space: {} available, backup may need {}",
                    format_bytes(available),
                    format_bytes(required)
                ),
                "Free up disk space or use a different temp directory",
            );
        } else if available < required * 2 {
            report.info(
                format!(
                    "Disk space is adequate but tight: {} available",
                    format_bytes(available)
                ),
                "Consider freeing up more space for safety",
            );
        }
    }

    if let Some(dir) = &opts.directory {
        if !dir.is_dir() {
            report.error(
                format!("Stack directory not found: {}", dir.display()),
                "Verify the directory path is correct",
            );
        }
    }

    if let Some(provider) = &opts.provider {
        if let Err(e) = provider.list("").await {
            report.warning(
                format!("Remote storage not reachable: {e}"),
                "Check your credentials and network connectivity",
            );
        }
    }

    if let Some(key) = &opts.encryption_key {
        if key.len() != KEY_LEN {
            report.error(
                format!(
                    "Invalid encryption key length: {} bytes (expected {KEY_LEN})",
                    key.len()
                ),
                "Use a 32-byte (256-bit) encryption key",
            );
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_icons() {
        assert_eq!(Severity::Error.icon(), "❌");
        assert_eq!(Severity::Warning.icon(), "⚠️");
        assert_eq!(Severity::Info.icon(), "ℹ️");
        assert_eq!(Severity::Warning.to_string(), "warning");
    }
}
