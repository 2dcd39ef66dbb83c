//! Transfer items: a signed grant paired with a local endpoint.

use crate::{
    models::{grant::SignedGrant, object::ObjectRef},
    transfer::pipeline::KeyMaterial,
};
use bytes::Bytes;
use std::path::PathBuf;

/// Where upload bytes come from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub enum Endpoint {
    Download {
        destination: PathBuf,
        decompress: bool,
        decrypt: Option<KeyMaterial>,
    },
    Upload {
        source: UploadSource,
        compress: bool,
        encrypt: Option<KeyMaterial>,
        /// Declared content length, when the caller knows it.
        size: Option<u64>,
    },
}

/// One authorized transfer. Owned by a single worker while it runs.
#[derive(Debug, Clone)]
pub struct TransferItem {
    grant: SignedGrant,
    endpoint: Endpoint,
}

impl TransferItem {
    /// Download the granted object into `destination`.
    pub fn download(grant: SignedGrant, destination: impl Into<PathBuf>) -> Self {
        Self {
            grant,
            endpoint: Endpoint::Download {
                destination: destination.into(),
                decompress: false,
                decrypt: None,
            },
        }
    }

    /// Upload in-memory content to the granted object.
    pub fn upload_bytes(grant: SignedGrant, content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let size = Some(content.len() as u64);
        Self {
            grant,
            endpoint: Endpoint::Upload {
                source: UploadSource::Memory(content),
                compress: false,
                encrypt: None,
                size,
            },
        }
    }

    /// Upload a local file to the granted object.
    pub fn upload_file(grant: SignedGrant, path: impl Into<PathBuf>, size: Option<u64>) -> Self {
        Self {
            grant,
            endpoint: Endpoint::Upload {
                source: UploadSource::File(path.into()),
                compress: false,
                encrypt: None,
                size,
            },
        }
    }

    /// Gunzip downloads / gzip uploads.
    pub fn compressed(mut self, on: bool) -> Self {
        match &mut self.endpoint {
            Endpoint::Download { decompress, .. } => *decompress = on,
            Endpoint::Upload { compress, .. } => *compress = on,
        }
        self
    }

    /// Decrypt downloads / encrypt uploads with `key`.
    pub fn encrypted(mut self, key: KeyMaterial) -> Self {
        match &mut self.endpoint {
            Endpoint::Download { decrypt, .. } => *decrypt = Some(key),
            Endpoint::Upload { encrypt, .. } => *encrypt = Some(key),
        }
        self
    }

    pub fn grant(&self) -> &SignedGrant {
        &self.grant
    }

    /// The object this item acts on: always the granted one.
    pub fn object(&self) -> &ObjectRef {
        self.grant.granted()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Bytes this item is expected to move, if known before it runs.
    pub fn expected_size(&self) -> Option<u64> {
        match &self.endpoint {
            Endpoint::Upload { size, .. } => *size,
            Endpoint::Download { .. } => self
                .object()
                .metadata()
                .get("content-length")
                .and_then(|v| v.parse().ok()),
        }
    }
}
