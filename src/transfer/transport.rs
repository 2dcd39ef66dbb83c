//! The "execute signed request" capability.
//!
//! The engine never speaks HTTP itself. It hands a signed URL and the
//! granted object to a [`SignedRequestExecutor`] and gets bytes back (or
//! hands bytes over). Executors classify their own failures as retryable or
//! not; the engine only acts on that classification.

use crate::models::object::ObjectRef;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;

/// Raw object bytes as they travel to or from the storage service.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Server-side or network trouble worth another attempt (5xx, timeout,
    /// reset connection).
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The request itself was refused (4xx); retrying cannot help.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Build an error from an HTTP status, classifying 5xx as transient.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            TransportError::Transient(format!("{status}: {message}"))
        } else {
            TransportError::Rejected { status, message }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Transient(_) => true,
            TransportError::Rejected { .. } => false,
            TransportError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }
}

/// Performs signed requests against the storage service.
///
/// An executor instance is shared by all workers of a batch, but each call
/// owns its request and body exclusively.
#[async_trait]
pub trait SignedRequestExecutor: Send + Sync {
    /// Start a download. Errors inside the returned stream are transport
    /// failures too.
    async fn get(&self, signed_url: &str, object: &ObjectRef) -> Result<ByteStream, TransportError>;

    /// Upload `body` and return the number of bytes the service stored.
    async fn put(
        &self,
        signed_url: &str,
        object: &ObjectRef,
        body: ByteStream,
    ) -> Result<u64, TransportError>;
}
