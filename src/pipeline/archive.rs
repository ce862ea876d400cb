//! Archive assembly: a blocking writer task owning the byte chain.
//!
//! Application bytes flow `tar -> gzip (or pigz) -> AEAD envelope -> sink`,
//! where the sink is either a local file or a byte pipe feeding the upload
//! task. Entries arrive over a channel, so the async orchestrator never
//! touches the sync chain directly. tar needs member sizes up front, which
//! is why streaming sources are spilled to temp files first.
//!
//! On failure the chain never finalizes: a piped sink is poisoned so the
//! upload fails, and a file sink is unlinked. No partial archive is ever
//! observable.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempPath;
use tokio::sync::mpsc;

use super::parallel::{pigz_available, ParallelConfig, PigzWriter};
use super::pipe::{CountingWriter, PipeWriter};
use crate::crypto::{EncryptWriter, EncryptionKey};
use crate::error::{Result, SnapError};

/// One archive member.
pub enum ArchiveEntry {
    Bytes { name: String, data: Vec<u8> },
    /// A spill file copied into the archive and deleted afterwards.
    Spill {
        name: String,
        file: TempPath,
        size: u64,
    },
}

enum WriterMsg {
    Entry(ArchiveEntry),
    Abort(String),
}

/// Where the finished archive bytes go.
pub enum ArchiveTarget {
    File(PathBuf),
    Pipe(PipeWriter),
}

/// Handle to the blocking archive writer task.
pub struct ArchiveWriter {
    tx: mpsc::Sender<WriterMsg>,
    task: tokio::task::JoinHandle<io::Result<u64>>,
}

impl ArchiveWriter {
    pub fn spawn(
        target: ArchiveTarget,
        key: Option<EncryptionKey>,
        cfg: ParallelConfig,
    ) -> ArchiveWriter {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::task::spawn_blocking(move || run_writer(rx, target, key, cfg));
        ArchiveWriter { tx, task }
    }

    /// Queue a member for the archive. Members are written in send order.
    pub async fn append(&self, entry: ArchiveEntry) -> Result<()> {
        self.tx
            .send(WriterMsg::Entry(entry))
            .await
            .map_err(|_| SnapError::CorruptArchive("archive writer terminated early".into()))
    }

    /// Finalize the chain and return the number of bytes that reached the
    /// sink.
    pub async fn finish(self) -> Result<u64> {
        let ArchiveWriter { tx, task } = self;
        drop(tx);
        match task.await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(e)) => Err(SnapError::from_chain_io(e)),
            Err(e) => Err(SnapError::Runtime(format!("archive writer panicked: {e}"))),
        }
    }

    /// Tear the archive down without finalizing it.
    pub async fn abort(self, reason: &str) {
        let ArchiveWriter { tx, task } = self;
        let _ = tx.send(WriterMsg::Abort(reason.to_string())).await;
        drop(tx);
        let _ = task.await;
    }
}

fn run_writer(
    rx: mpsc::Receiver<WriterMsg>,
    target: ArchiveTarget,
    key: Option<EncryptionKey>,
    cfg: ParallelConfig,
) -> io::Result<u64> {
    match target {
        ArchiveTarget::File(path) => {
            let file = std::fs::File::create(&path)?;
            match write_chain(rx, Box::new(file), key.as_ref(), &cfg) {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    let _ = std::fs::remove_file(&path);
                    Err(e)
                }
            }
        }
        ArchiveTarget::Pipe(writer) => {
            let poison = writer.clone_handle();
            match write_chain(rx, Box::new(writer), key.as_ref(), &cfg) {
                Ok(bytes) => Ok(bytes),
                Err(e) => {
                    poison.fail(io::Error::new(e.kind(), e.to_string()));
                    Err(e)
                }
            }
        }
    }
}

type Sink = CountingWriter<Box<dyn Write + Send>>;

enum Sealed {
    Plain(Sink),
    Aead(Box<EncryptWriter<Sink>>),
}

impl Sealed {
    fn finish(self) -> io::Result<Sink> {
        match self {
            Sealed::Plain(w) => Ok(w),
            Sealed::Aead(w) => w.finish(),
        }
    }
}

impl Write for Sealed {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sealed::Plain(w) => w.write(buf),
            Sealed::Aead(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sealed::Plain(w) => w.flush(),
            Sealed::Aead(w) => w.flush(),
        }
    }
}

enum Compressor {
    Gzip(GzEncoder<Sealed>),
    Pigz(PigzWriter<Sealed>),
}

impl Compressor {
    fn finish(self) -> io::Result<Sealed> {
        match self {
            Compressor::Gzip(w) => w.finish(),
            Compressor::Pigz(w) => w.finish(),
        }
    }
}

impl Write for Compressor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Gzip(w) => w.write(buf),
            Compressor::Pigz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Gzip(w) => w.flush(),
            Compressor::Pigz(w) => w.flush(),
        }
    }
}

fn write_chain(
    mut rx: mpsc::Receiver<WriterMsg>,
    sink: Box<dyn Write + Send>,
    key: Option<&EncryptionKey>,
    cfg: &ParallelConfig,
) -> io::Result<u64> {
    let (counting, count) = CountingWriter::new(sink);

    let sealed = match key {
        Some(key) => Sealed::Aead(Box::new(EncryptWriter::new(key, counting)?)),
        None => Sealed::Plain(counting),
    };

    let compressor = if cfg.use_pigz && pigz_available() {
        Compressor::Pigz(PigzWriter::spawn(sealed, cfg.gzip_level, 0)?)
    } else {
        Compressor::Gzip(GzEncoder::new(sealed, Compression::new(cfg.gzip_level)))
    };

    let mut builder = tar::Builder::new(compressor);

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            WriterMsg::Entry(ArchiveEntry::Bytes { name, data }) => {
                append_member(&mut builder, &name, data.len() as u64, data.as_slice())?;
            }
            WriterMsg::Entry(ArchiveEntry::Spill { name, file, size }) => {
                let spill = std::fs::File::open(&file)?;
                append_member(&mut builder, &name, size, spill)?;
                drop(file); // spill file removed here
            }
            WriterMsg::Abort(reason) => {
                return Err(io::Error::other(reason));
            }
        }
    }

    let compressor = builder.into_inner()?;
    let sealed = compressor.finish()?;
    let mut counting = sealed.finish()?;
    counting.flush()?;

    Ok(count.load(Ordering::Relaxed))
}

fn append_member<W: Write, R: io::Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    size: u64,
    data: R,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    );
    builder.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;

    fn plain_cfg() -> ParallelConfig {
        ParallelConfig {
            use_pigz: false,
            ..Default::default()
        }
    }

    fn read_members(path: &std::path::Path) -> Vec<(String, Vec<u8>)> {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut members = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            members.push((name, data));
        }
        members
    }

    #[tokio::test]
    async fn test_members_written_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tar.gz");

        let writer = ArchiveWriter::spawn(ArchiveTarget::File(path.clone()), None, plain_cfg());
        writer
            .append(ArchiveEntry::Bytes {
                name: "docker-compose.yml".into(),
                data: b"services: {}\n".to_vec(),
            })
            .await
            .unwrap();
        writer
            .append(ArchiveEntry::Bytes {
                name: "volumes/demo_data.tar".into(),
                data: vec![0u8; 1024],
            })
            .await
            .unwrap();
        writer
            .append(ArchiveEntry::Bytes {
                name: "metadata.json".into(),
                data: b"{}".to_vec(),
            })
            .await
            .unwrap();
        let bytes = writer.finish().await.unwrap();
        assert!(bytes > 0);
        assert_eq!(bytes, std::fs::metadata(&path).unwrap().len());

        let members = read_members(&path);
        let names: Vec<&str> = members.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec!["docker-compose.yml", "volumes/demo_data.tar", "metadata.json"]
        );
        assert_eq!(members[0].1, b"services: {}\n");
    }

    #[tokio::test]
    async fn test_spill_entry_copied_and_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tar.gz");

        let mut spill = tempfile::NamedTempFile::new().unwrap();
        spill.write_all(b"volume payload").unwrap();
        let spill_path_buf = spill.path().to_path_buf();
        let (_, temp_path) = spill.into_parts();

        let writer = ArchiveWriter::spawn(ArchiveTarget::File(path.clone()), None, plain_cfg());
        writer
            .append(ArchiveEntry::Spill {
                name: "volumes/demo_data.tar".into(),
                file: temp_path,
                size: 14,
            })
            .await
            .unwrap();
        writer.finish().await.unwrap();

        assert!(!spill_path_buf.exists(), "spill file should be deleted");
        let members = read_members(&path);
        assert_eq!(members[0].1, b"volume payload");
    }

    #[tokio::test]
    async fn test_abort_unlinks_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tar.gz");

        let writer = ArchiveWriter::spawn(ArchiveTarget::File(path.clone()), None, plain_cfg());
        writer
            .append(ArchiveEntry::Bytes {
                name: "docker-compose.yml".into(),
                data: b"services: {}\n".to_vec(),
            })
            .await
            .unwrap();
        writer.abort("volume backup failed").await;

        assert!(!path.exists(), "aborted archive should not be observable");
    }

    #[tokio::test]
    async fn test_encrypted_archive_starts_with_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tar.gz.enc");
        let key = EncryptionKey::from_bytes(&[0x11; 32]).unwrap();

        let writer =
            ArchiveWriter::spawn(ArchiveTarget::File(path.clone()), Some(key), plain_cfg());
        writer
            .append(ArchiveEntry::Bytes {
                name: "metadata.json".into(),
                data: b"{}".to_vec(),
            })
            .await
            .unwrap();
        writer.finish().await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..5], b"SSNAP");
        assert_eq!(bytes[5], 0x02);
    }
}
