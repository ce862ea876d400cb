//! Bounded parallelism helpers for the backup pipeline.
//!
//! Volume capture is I/O-bound on the engine, so a small worker pool spills
//! several volumes concurrently while the archive append stays sequential.
//! When a multi-threaded gzip binary is on the host, an external process can
//! replace the in-process encoder at the same chain position.

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SnapError};
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Concurrent volume spill workers.
    pub max_workers: usize,
    /// Prefer an external `pigz` process over in-process gzip when present.
    pub use_pigz: bool,
    pub gzip_level: u32,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            max_workers: (cpus / 2).clamp(1, 4),
            use_pigz: true,
            gzip_level: 6,
        }
    }
}

/// A volume captured into a spill file, ready for sequential archive append.
/// The spill file deletes itself when the `TempPath` drops.
pub struct VolumeSpill {
    pub volume: String,
    pub file: TempPath,
    pub size: u64,
}

async fn spill_one(
    runtime: &dyn ContainerRuntime,
    volume: &str,
    cancel: &CancellationToken,
) -> Result<VolumeSpill> {
    let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    runtime.backup_volume(volume, &mut file, cancel).await?;
    file.flush().await?;
    let size = file.metadata().await?.len();

    Ok(VolumeSpill {
        volume: volume.to_string(),
        file: path,
        size,
    })
}

/// Progress event for a volume spill worker.
#[derive(Debug, Clone, Copy)]
pub enum VolumeProgress<'a> {
    Started {
        volume: &'a str,
        completed: usize,
        total: usize,
    },
    Finished {
        volume: &'a str,
        completed: usize,
        total: usize,
    },
}

/// Spill each volume through a bounded worker pool. Results come back in
/// input order; per-volume failures are reported, not fatal.
pub async fn spill_volumes(
    runtime: Arc<dyn ContainerRuntime>,
    volumes: &[String],
    cfg: &ParallelConfig,
    cancel: &CancellationToken,
    progress: impl for<'a> Fn(VolumeProgress<'a>) + Send + Sync + 'static,
) -> Vec<(String, Result<VolumeSpill>)> {
    let total = volumes.len();
    let semaphore = Arc::new(Semaphore::new(cfg.max_workers.max(1)));
    let progress = Arc::new(progress);
    let completed = Arc::new(Mutex::new(0usize));

    let mut handles = Vec::with_capacity(total);
    for volume in volumes.iter().cloned() {
        let runtime = runtime.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        let completed = completed.clone();

        handles.push(tokio::spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => return (volume, Err(SnapError::Cancelled)),
            };
            if cancel.is_cancelled() {
                return (volume, Err(SnapError::Cancelled));
            }

            {
                let done = completed.lock().expect("progress lock poisoned");
                progress(VolumeProgress::Started {
                    volume: &volume,
                    completed: *done,
                    total,
                });
            }

            let result = spill_one(runtime.as_ref(), &volume, &cancel).await;

            {
                let mut done = completed.lock().expect("progress lock poisoned");
                *done += 1;
                progress(VolumeProgress::Finished {
                    volume: &volume,
                    completed: *done,
                    total,
                });
            }

            (volume, result)
        }));
    }

    let mut results = Vec::with_capacity(total);
    for (idx, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(entry) => results.push(entry),
            Err(e) => results.push((
                volumes[idx].clone(),
                Err(SnapError::Runtime(format!("volume backup task failed: {e}"))),
            )),
        }
    }
    results
}

/// True when a multi-threaded gzip binary is available on the host.
pub fn pigz_available() -> bool {
    Command::new("pigz")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// External `pigz` process standing in for the in-process gzip encoder.
///
/// Bytes written go to the child's stdin; a copier thread drains its stdout
/// into the next chain stage. `finish` closes stdin, checks the exit status
/// and hands the inner writer back.
pub struct PigzWriter<W: Write + Send + 'static> {
    child: Child,
    stdin: Option<ChildStdin>,
    copier: Option<std::thread::JoinHandle<io::Result<W>>>,
}

impl<W: Write + Send + 'static> PigzWriter<W> {
    pub fn spawn(inner: W, level: u32, threads: usize) -> io::Result<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            threads
        };

        let mut child = Command::new("pigz")
            .arg("-c")
            .arg(format!("-{level}"))
            .arg("-p")
            .arg(threads.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("pigz stdin unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("pigz stdout unavailable"))?;

        let copier = std::thread::spawn(move || {
            let mut inner = inner;
            io::copy(&mut stdout, &mut inner)?;
            Ok(inner)
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            copier: Some(copier),
        })
    }

    pub fn finish(mut self) -> io::Result<W> {
        drop(self.stdin.take());

        let status = self.child.wait()?;
        if !status.success() {
            return Err(io::Error::other(format!("pigz exited with {status}")));
        }

        match self.copier.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("pigz copier thread panicked"))?,
            None => Err(io::Error::other("pigz copier already taken")),
        }
    }
}

impl<W: Write + Send + 'static> Write for PigzWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Err(io::Error::other("pigz stdin closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stdin {
            Some(stdin) => stdin.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_bounds() {
        let cfg = ParallelConfig::default();
        assert!(cfg.max_workers >= 1);
        assert!(cfg.max_workers <= 4);
        assert_eq!(cfg.gzip_level, 6);
    }
}
