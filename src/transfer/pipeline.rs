//! Transform pipeline: optional gzip and AES-256-GCM stages around a byte
//! stream.
//!
//! Uploads are sealed as `plain -> gzip -> encrypt`, so downloads are opened
//! in the reverse order: `raw -> decrypt -> gunzip -> destination`. The order
//! is fixed; opening with the stages swapped would not undo the sealing.
//!
//! Encrypted payloads start with `salt (16 B) || nonce prefix (8 B)`, followed
//! by frames of `header (4 B) || ciphertext`. The header holds the ciphertext
//! length with the top bit marking the final frame, and is bound to the frame
//! as associated data. Frame `n` uses `prefix || n` (big-endian u32) as its
//! nonce, so reordered or missing frames fail to open. Each
//! stage holds at most one frame in memory.

use crate::transfer::transport::{ByteStream, TransportError};
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use bytes::Bytes;
use flate2::{
    Compression,
    write::{GzDecoder, GzEncoder},
};
use futures::{StreamExt, future, stream::BoxStream};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::{fmt, io, io::Write};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const NONCE_PREFIX_LEN: usize = 8;
const SALT_LEN: usize = 16;
const HEADER_LEN: usize = SALT_LEN + NONCE_PREFIX_LEN;
const FRAME_HEADER_LEN: usize = 4;
const TAG_LEN: usize = 16;
const FRAME_PLAINTEXT_LEN: usize = 64 * 1024;
const FINAL_FRAME: u32 = 1 << 31;
const PBKDF2_ROUNDS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("corrupt compressed data: {0}")]
    Decompress(#[source] io::Error),
    #[error("compression failed: {0}")]
    Compress(#[source] io::Error),
    #[error("encrypted payload ends before its final frame")]
    Truncated,
    #[error("decryption failed: data corrupt or wrong key")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

#[derive(Clone, PartialEq, Eq)]
enum Secret {
    Key([u8; 32]),
    Passphrase(String),
}

/// Symmetric key input: raw 256-bit key bytes, or a passphrase stretched with
/// PBKDF2-HMAC-SHA256 over the salt stored in each sealed object's header.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(Secret);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Secret::Key(bytes))
    }

    pub fn from_passphrase(passphrase: impl Into<String>) -> Self {
        Self(Secret::Passphrase(passphrase.into()))
    }

    /// Cipher for an object sealed under `salt`. Raw keys ignore the salt.
    fn cipher(&self, salt: &[u8]) -> Aes256Gcm {
        match &self.0 {
            Secret::Key(key) => Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            Secret::Passphrase(passphrase) => {
                let mut key = [0u8; 32];
                pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
                Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
            }
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

fn frame_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// One streaming transform. `push` may hold input back; `finish` releases
/// whatever is left.
trait Stage: Send {
    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError>;
    fn finish(&mut self) -> Result<Vec<u8>, PipelineError>;
}

struct Gunzip(GzDecoder<Vec<u8>>);

impl Stage for Gunzip {
    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        self.0.write_all(input).map_err(PipelineError::Decompress)?;
        Ok(std::mem::take(self.0.get_mut()))
    }

    fn finish(&mut self) -> Result<Vec<u8>, PipelineError> {
        self.0.try_finish().map_err(PipelineError::Decompress)?;
        Ok(std::mem::take(self.0.get_mut()))
    }
}

struct Gzip(GzEncoder<Vec<u8>>);

impl Stage for Gzip {
    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        self.0.write_all(input).map_err(PipelineError::Compress)?;
        Ok(std::mem::take(self.0.get_mut()))
    }

    fn finish(&mut self) -> Result<Vec<u8>, PipelineError> {
        self.0.try_finish().map_err(PipelineError::Compress)?;
        Ok(std::mem::take(self.0.get_mut()))
    }
}

/// Opens frames as soon as each one is complete; holds at most one frame.
struct Decrypt {
    key: KeyMaterial,
    cipher: Option<Aes256Gcm>,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    buffer: Vec<u8>,
    sealed_off: bool,
}

impl Decrypt {
    fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            cipher: None,
            prefix: [0; NONCE_PREFIX_LEN],
            counter: 0,
            buffer: Vec::new(),
            sealed_off: false,
        }
    }

    fn open_ready_frames(&mut self) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        let mut offset = 0;

        if self.cipher.is_none() {
            if self.buffer.len() < HEADER_LEN {
                return Ok(out);
            }
            let (salt, prefix) = self.buffer[..HEADER_LEN].split_at(SALT_LEN);
            self.prefix.copy_from_slice(prefix);
            self.cipher = Some(self.key.cipher(salt));
            offset = HEADER_LEN;
        }

        loop {
            let available = &self.buffer[offset..];
            if available.is_empty() {
                break;
            }
            if self.sealed_off {
                // bytes after the final frame
                return Err(PipelineError::Decrypt);
            }
            if available.len() < FRAME_HEADER_LEN {
                break;
            }
            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&available[..FRAME_HEADER_LEN]);
            let word = u32::from_be_bytes(header);
            let len = (word & !FINAL_FRAME) as usize;
            if !(TAG_LEN..=FRAME_PLAINTEXT_LEN + TAG_LEN).contains(&len) {
                return Err(PipelineError::Decrypt);
            }
            if available.len() < FRAME_HEADER_LEN + len {
                break;
            }

            let cipher = self.cipher.as_ref().ok_or(PipelineError::Decrypt)?;
            let nonce = frame_nonce(&self.prefix, self.counter);
            let plain = cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &available[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len],
                        aad: &header,
                    },
                )
                .map_err(|_| PipelineError::Decrypt)?;
            self.counter = self.counter.checked_add(1).ok_or(PipelineError::Decrypt)?;
            self.sealed_off = word & FINAL_FRAME != 0;
            out.extend_from_slice(&plain);
            offset += FRAME_HEADER_LEN + len;
        }

        self.buffer.drain(..offset);
        Ok(out)
    }
}

impl Stage for Decrypt {
    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        self.buffer.extend_from_slice(input);
        self.open_ready_frames()
    }

    fn finish(&mut self) -> Result<Vec<u8>, PipelineError> {
        let out = self.open_ready_frames()?;
        if !self.sealed_off {
            return Err(PipelineError::Truncated);
        }
        Ok(out)
    }
}

/// Seals plaintext into frames of `FRAME_PLAINTEXT_LEN` bytes.
struct Encrypt {
    key: KeyMaterial,
    cipher: Option<Aes256Gcm>,
    prefix: [u8; NONCE_PREFIX_LEN],
    counter: u32,
    pending: Vec<u8>,
}

impl Encrypt {
    fn new(key: KeyMaterial) -> Self {
        Self {
            key,
            cipher: None,
            prefix: [0; NONCE_PREFIX_LEN],
            counter: 0,
            pending: Vec::new(),
        }
    }

    /// Pick salt and nonce prefix, and write the header, on first use.
    fn write_header(&mut self, out: &mut Vec<u8>) {
        if self.cipher.is_some() {
            return;
        }
        let salt: [u8; SALT_LEN] = rand::random();
        self.prefix = rand::random();
        self.cipher = Some(self.key.cipher(&salt));
        out.extend_from_slice(&salt);
        out.extend_from_slice(&self.prefix);
    }

    fn seal_frame(
        &mut self,
        plaintext: &[u8],
        last: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), PipelineError> {
        let cipher = self.cipher.as_ref().ok_or(PipelineError::Encrypt)?;
        let len = u32::try_from(plaintext.len() + TAG_LEN).map_err(|_| PipelineError::Encrypt)?;
        let header = if last { len | FINAL_FRAME } else { len }.to_be_bytes();
        let nonce = frame_nonce(&self.prefix, self.counter);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| PipelineError::Encrypt)?;
        self.counter = self.counter.checked_add(1).ok_or(PipelineError::Encrypt)?;
        out.extend_from_slice(&header);
        out.extend_from_slice(&ciphertext);
        Ok(())
    }
}

impl Stage for Encrypt {
    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        self.write_header(&mut out);
        self.pending.extend_from_slice(input);
        while self.pending.len() > FRAME_PLAINTEXT_LEN {
            let rest = self.pending.split_off(FRAME_PLAINTEXT_LEN);
            let frame = std::mem::replace(&mut self.pending, rest);
            self.seal_frame(&frame, false, &mut out)?;
        }
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        self.write_header(&mut out);
        let frame = std::mem::take(&mut self.pending);
        self.seal_frame(&frame, true, &mut out)?;
        Ok(out)
    }
}

/// Strictly sequenced stages for one item.
#[derive(Default)]
pub struct TransformChain {
    stages: Vec<Box<dyn Stage>>,
}

impl TransformChain {
    /// Download order: decrypt, then decompress.
    pub fn opening(decompress: bool, decrypt: Option<KeyMaterial>) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        if let Some(key) = decrypt {
            stages.push(Box::new(Decrypt::new(key)));
        }
        if decompress {
            stages.push(Box::new(Gunzip(GzDecoder::new(Vec::new()))));
        }
        Self { stages }
    }

    /// Upload order: compress, then encrypt.
    pub fn sealing(compress: bool, encrypt: Option<KeyMaterial>) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        if compress {
            stages.push(Box::new(Gzip(GzEncoder::new(Vec::new(), Compression::default()))));
        }
        if let Some(key) = encrypt {
            stages.push(Box::new(Encrypt::new(key)));
        }
        Self { stages }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        self.run_from(0, input.to_vec())
    }

    /// Finish every stage in order, feeding each stage's tail through the
    /// stages after it.
    pub fn finish(&mut self) -> Result<Vec<u8>, PipelineError> {
        let mut out = Vec::new();
        for idx in 0..self.stages.len() {
            let tail = self.stages[idx].finish()?;
            out.extend(self.run_from(idx + 1, tail)?);
        }
        Ok(out)
    }

    fn run_from(&mut self, start: usize, mut data: Vec<u8>) -> Result<Vec<u8>, PipelineError> {
        for stage in &mut self.stages[start..] {
            if data.is_empty() {
                break;
            }
            data = stage.push(&data)?;
        }
        Ok(data)
    }

    /// Whole-buffer convenience for callers that already hold the bytes.
    pub fn apply(mut self, input: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let mut out = self.push(input)?;
        out.extend(self.finish()?);
        Ok(out)
    }
}

/// Error surfaced by an opened download stream.
#[derive(Debug, Error)]
pub enum StreamFault {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Corrupt(#[from] PipelineError),
}

pub type OpenedStream = BoxStream<'static, Result<Bytes, StreamFault>>;

/// Wrap a raw download stream with the requested decrypt/decompress stages.
pub fn wrap(raw: ByteStream, decompress: bool, decrypt: Option<KeyMaterial>) -> OpenedStream {
    let raw = raw.map(|chunk| chunk.map_err(StreamFault::from)).boxed();
    transform(raw, TransformChain::opening(decompress, decrypt), StreamFault::Corrupt)
}

/// Wrap plain upload bytes with the requested compress/encrypt stages.
pub fn seal(
    plain: BoxStream<'static, io::Result<Bytes>>,
    compress: bool,
    encrypt: Option<KeyMaterial>,
) -> ByteStream {
    let plain = plain.map(|chunk| chunk.map_err(TransportError::from)).boxed();
    transform(plain, TransformChain::sealing(compress, encrypt), |err| {
        TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
    })
}

fn transform<E>(
    raw: BoxStream<'static, Result<Bytes, E>>,
    chain: TransformChain,
    lift: fn(PipelineError) -> E,
) -> BoxStream<'static, Result<Bytes, E>>
where
    E: Send + 'static,
{
    if chain.is_empty() {
        return raw;
    }

    futures::stream::unfold((raw, Some(chain)), move |(mut raw, mut chain)| async move {
        let stages = chain.as_mut()?;
        let produced = match raw.next().await {
            Some(Ok(chunk)) => stages.push(&chunk).map(Bytes::from).map_err(lift),
            Some(Err(err)) => Err(err),
            None => {
                let tail = stages.finish().map(Bytes::from).map_err(lift);
                chain = None;
                tail
            }
        };
        if produced.is_err() {
            chain = None;
        }
        Some((produced, (raw, chain)))
    })
    .filter(|chunk| future::ready(!matches!(chunk, Ok(bytes) if bytes.is_empty())))
    .boxed()
}
