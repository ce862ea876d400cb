//! Streaming encryption envelope for backup archives.
//!
//! The envelope is a framed AES-256-GCM stream: a fixed header (magic,
//! version, nonce prefix) followed by length-prefixed authenticated chunks
//! and a zero-length terminator frame. Per-chunk framing gives truncation
//! detection, streaming decryption and bounded memory at ~16 bytes of tag
//! overhead per 64 KiB chunk.
//!
//! Wire layout:
//!
//! ```text
//! "SSNAP" | version (1) | nonce prefix (12)
//! [ len: u32 BE | ciphertext+tag ]*
//! len = 0 (terminator)
//! ```
//!
//! Chunk nonces are `nonce_prefix[0..4] || counter: u64 BE`, counter starting
//! at 0. Archives written by old releases are raw AES-256-CTR with the first
//! block as IV; the reader falls back to that format when the magic is
//! absent. Writers always produce the framed form.

pub mod recovery;

use std::io::{self, Read, Write};

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SnapError;

/// Magic bytes identifying a framed envelope.
pub const MAGIC: &[u8; 5] = b"SSNAP";
/// Legacy CTR format marker (never written inside a framed header).
pub const VERSION_CTR: u8 = 0x01;
/// Current framed AEAD format.
pub const VERSION_GCM: u8 = 0x02;
/// Plaintext chunk size. Trades per-chunk tag overhead against syscall count.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Size of the raw data key in bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 12;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Raw 32-byte data key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    /// Creates a key from raw bytes. The length must be exactly 32 bytes and
    /// the key must not be all zeros.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapError> {
        if bytes.len() != KEY_LEN {
            return Err(SnapError::InvalidKeyLength(bytes.len()));
        }
        if bytes.iter().all(|b| *b == 0) {
            return Err(SnapError::InvalidKey("key cannot be all zeros".into()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, SnapError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SnapError::InvalidKey(format!("invalid hex key: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { bytes: key }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Writer half of the envelope. Buffers plaintext into 64 KiB chunks and
/// seals each with its own derived nonce. [`EncryptWriter::finish`] must be
/// called to flush the final partial chunk and the terminator frame.
pub struct EncryptWriter<W: Write> {
    cipher: Aes256Gcm,
    prefix: [u8; 4],
    counter: u64,
    buf: Vec<u8>,
    inner: W,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(key: &EncryptionKey, mut inner: W) -> io::Result<Self> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        inner.write_all(MAGIC)?;
        inner.write_all(&[VERSION_GCM])?;
        inner.write_all(&nonce)?;

        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&nonce[..4]);

        Ok(Self {
            cipher,
            prefix,
            counter: 0,
            buf: Vec::with_capacity(CHUNK_SIZE),
            inner,
        })
    }

    fn seal_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), chunk)
            .map_err(|_| io::Error::other("encryption failed"))?;

        self.inner
            .write_all(&(ciphertext.len() as u32).to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        Ok(())
    }

    /// Flush the final partial chunk, write the terminator frame and return
    /// the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.seal_chunk(&chunk)?;
        }
        self.inner.write_all(&0u32.to_be_bytes())?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= CHUNK_SIZE {
            let rest = self.buf.split_off(CHUNK_SIZE);
            let chunk = std::mem::replace(&mut self.buf, rest);
            self.seal_chunk(&chunk)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial chunks stay buffered until finish(); flushing them early
        // would commit a short frame mid-stream.
        self.inner.flush()
    }
}

enum DecryptInner<R: Read> {
    Gcm {
        cipher: Aes256Gcm,
        prefix: [u8; 4],
        counter: u64,
        r: R,
        buf: Vec<u8>,
        pos: usize,
        eof: bool,
    },
    LegacyCtr {
        cipher: Aes256Ctr,
        r: R,
    },
}

/// Reader half of the envelope. Detects the framed format by magic and falls
/// back to legacy CTR decryption otherwise.
pub struct DecryptReader<R: Read> {
    inner: DecryptInner<R>,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(key: &EncryptionKey, mut r: R) -> io::Result<Self> {
        let mut peek = [0u8; 6];
        let n = read_up_to(&mut r, &mut peek)?;

        if n >= 5 && &peek[..5] == MAGIC {
            let version = peek[5];
            if version != VERSION_GCM {
                return Err(SnapError::UnsupportedVersion(version).into_chain_io());
            }

            let mut nonce = [0u8; NONCE_LEN];
            r.read_exact(&mut nonce)
                .map_err(|_| SnapError::InvalidHeader.into_chain_io())?;

            let mut prefix = [0u8; 4];
            prefix.copy_from_slice(&nonce[..4]);

            return Ok(Self {
                inner: DecryptInner::Gcm {
                    cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes())),
                    prefix,
                    counter: 0,
                    r,
                    buf: Vec::new(),
                    pos: 0,
                    eof: false,
                },
            });
        }

        // Legacy stream: the first block-size bytes are the CTR IV.
        let mut iv = [0u8; 16];
        iv[..n].copy_from_slice(&peek[..n]);
        if n < 16 {
            r.read_exact(&mut iv[n..])
                .map_err(|_| SnapError::InvalidHeader.into_chain_io())?;
        }

        let cipher = Aes256Ctr::new(key.as_bytes().into(), &iv.into());
        Ok(Self {
            inner: DecryptInner::LegacyCtr { cipher, r },
        })
    }
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            DecryptInner::Gcm {
                cipher,
                prefix,
                counter,
                r,
                buf,
                pos,
                eof,
            } => {
                if *pos < buf.len() {
                    let n = (buf.len() - *pos).min(out.len());
                    out[..n].copy_from_slice(&buf[*pos..*pos + n]);
                    *pos += n;
                    return Ok(n);
                }
                if *eof {
                    return Ok(0);
                }

                let mut len_buf = [0u8; 4];
                if let Err(e) = r.read_exact(&mut len_buf) {
                    // EOF before the zero-length terminator means the stream
                    // was cut short.
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        return Err(SnapError::CorruptArchive(
                            "encrypted stream truncated before terminator".into(),
                        )
                        .into_chain_io());
                    }
                    return Err(e);
                }

                let chunk_len = u32::from_be_bytes(len_buf) as usize;
                if chunk_len == 0 {
                    *eof = true;
                    return Ok(0);
                }

                let mut ciphertext = vec![0u8; chunk_len];
                r.read_exact(&mut ciphertext).map_err(|e| {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        SnapError::CorruptArchive("encrypted chunk truncated".into())
                            .into_chain_io()
                    } else {
                        e
                    }
                })?;

                let mut nonce = [0u8; NONCE_LEN];
                nonce[..4].copy_from_slice(prefix);
                nonce[4..].copy_from_slice(&counter.to_be_bytes());
                *counter += 1;

                let plaintext = cipher
                    .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                    .map_err(|_| SnapError::AuthenticationFailed.into_chain_io())?;

                let n = plaintext.len().min(out.len());
                out[..n].copy_from_slice(&plaintext[..n]);
                if n < plaintext.len() {
                    *buf = plaintext;
                    *pos = n;
                } else {
                    buf.clear();
                    *pos = 0;
                }
                Ok(n)
            }
            DecryptInner::LegacyCtr { cipher, r } => {
                let n = r.read(out)?;
                cipher.apply_keystream(&mut out[..n]);
                Ok(n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SnapError;

    fn test_key() -> EncryptionKey {
        EncryptionKey::from_bytes(&[0x11u8; 32]).unwrap()
    }

    fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> Vec<u8> {
        let mut w = EncryptWriter::new(key, Vec::new()).unwrap();
        w.write_all(plaintext).unwrap();
        w.finish().unwrap()
    }

    fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let mut r = DecryptReader::new(key, ciphertext)?;
        let mut out = Vec::new();
        r.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_key_validation() {
        assert!(matches!(
            EncryptionKey::from_bytes(&[1u8; 16]),
            Err(SnapError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            EncryptionKey::from_bytes(&[0u8; 32]),
            Err(SnapError::InvalidKey(_))
        ));
        let key = EncryptionKey::generate();
        let round = EncryptionKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.as_bytes(), round.as_bytes());
    }

    #[test]
    fn test_round_trip_small() {
        let key = test_key();
        let ct = encrypt(&key, b"abc");
        assert_eq!(&ct[..5], MAGIC);
        assert_eq!(ct[5], VERSION_GCM);
        assert_eq!(decrypt(&key, &ct).unwrap(), b"abc");
    }

    #[test]
    fn test_round_trip_empty() {
        let key = test_key();
        let ct = encrypt(&key, b"");
        // Header plus a bare terminator frame.
        assert_eq!(ct.len(), 5 + 1 + 12 + 4);
        assert_eq!(decrypt(&key, &ct).unwrap(), b"");
    }

    #[test]
    fn test_round_trip_multi_chunk() {
        let key = test_key();
        let plaintext: Vec<u8> = (0..(CHUNK_SIZE * 2 + 1234))
            .map(|i| (i % 251) as u8)
            .collect();
        let ct = encrypt(&key, &plaintext);
        assert_eq!(decrypt(&key, &ct).unwrap(), plaintext);
    }

    #[test]
    fn test_tamper_fails_authentication() {
        let key = test_key();
        let mut ct = encrypt(&key, b"important data");
        // Flip one bit inside the first frame body (after the 18-byte header
        // and the 4-byte length prefix).
        let idx = 5 + 1 + 12 + 4 + 3;
        ct[idx] ^= 0x01;
        let err = decrypt(&key, &ct).unwrap_err();
        assert!(matches!(
            SnapError::from_chain_io(err),
            SnapError::AuthenticationFailed
        ));
    }

    #[test]
    fn test_truncation_fails() {
        let key = test_key();
        let ct = encrypt(&key, b"some data worth keeping");
        // Drop the terminator and part of the last frame.
        let err = decrypt(&key, &ct[..ct.len() - 6]).unwrap_err();
        assert!(matches!(
            SnapError::from_chain_io(err),
            SnapError::CorruptArchive(_)
        ));
    }

    #[test]
    fn test_missing_terminator_fails() {
        let key = test_key();
        let ct = encrypt(&key, b"payload");
        let err = decrypt(&key, &ct[..ct.len() - 4]).unwrap_err();
        assert!(matches!(
            SnapError::from_chain_io(err),
            SnapError::CorruptArchive(_)
        ));
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let key = test_key();
        let mut ct = encrypt(&key, b"abc");
        ct[5] = 0x03;
        let err = decrypt(&key, &ct).unwrap_err();
        assert!(matches!(
            SnapError::from_chain_io(err),
            SnapError::UnsupportedVersion(3)
        ));
    }

    #[test]
    fn test_legacy_ctr_fallback() {
        let key = test_key();
        let plaintext = b"legacy archive contents".to_vec();

        // Build a legacy stream by hand: IV followed by CTR ciphertext.
        let iv = [0x42u8; 16];
        let mut body = plaintext.clone();
        let mut cipher = Aes256Ctr::new(key.as_bytes().into(), &iv.into());
        cipher.apply_keystream(&mut body);

        let mut stream = iv.to_vec();
        stream.extend_from_slice(&body);

        assert_eq!(decrypt(&key, &stream).unwrap(), plaintext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = test_key();
        let other = EncryptionKey::from_bytes(&[0x22u8; 32]).unwrap();
        let ct = encrypt(&key, b"secret");
        let err = decrypt(&other, &ct).unwrap_err();
        assert!(matches!(
            SnapError::from_chain_io(err),
            SnapError::AuthenticationFailed
        ));
    }
}
