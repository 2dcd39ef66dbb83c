//! LocalStore: a [`SignedRequestExecutor`] backed by a local directory.
//!
//! Every request must carry a URL signed by the same [`UrlSigner`] the
//! gatekeeper uses; unsigned, tampered or expired URLs are rejected as 403.
//! Payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`, with object metadata and the
//! MD5 etag kept in a `.meta.json` sidecar next to each payload.

use crate::{
    models::object::{ObjectRef, OperationKind},
    services::signer::{SignatureError, UrlSigner},
    transfer::transport::{ByteStream, SignedRequestExecutor, TransportError},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// What the store remembers about a payload besides its bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub size_bytes: u64,
    pub etag: String,
    pub metadata: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct LocalStore {
    signer: UrlSigner,
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new(signer: UrlSigner, base_path: impl Into<PathBuf>) -> Self {
        Self {
            signer,
            base_path: base_path.into(),
        }
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(bucket/key) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified payload path. Parent directories may not exist yet.
    fn object_path(&self, object: &ObjectRef) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(object.bucket(), object.key());
        let mut path = self.base_path.clone();
        path.push(object.bucket());
        path.push(shard_a);
        path.push(shard_b);
        path.push(object.key());
        path
    }

    fn meta_path(payload: &Path) -> PathBuf {
        let mut name = payload.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    fn authorize(
        &self,
        kind: OperationKind,
        signed_url: &str,
        object: &ObjectRef,
    ) -> Result<(), TransportError> {
        if object.validate().is_err() {
            return Err(TransportError::from_status(400, "invalid object reference"));
        }
        self.signer
            .verify(kind, signed_url, object, Utc::now())
            .map_err(|err: SignatureError| TransportError::from_status(403, err.to_string()))
    }

    /// Metadata of a stored object, if present.
    pub async fn stat(&self, object: &ObjectRef) -> io::Result<Option<StoredObject>> {
        let meta_path = Self::meta_path(&self.object_path(object));
        match fs::read(&meta_path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|err| io::Error::new(ErrorKind::InvalidData, err)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Read a stored payload directly, bypassing signature checks.
    pub async fn read(&self, object: &ObjectRef) -> io::Result<Vec<u8>> {
        fs::read(self.object_path(object)).await
    }
}

#[async_trait]
impl SignedRequestExecutor for LocalStore {
    async fn get(&self, signed_url: &str, object: &ObjectRef) -> Result<ByteStream, TransportError> {
        self.authorize(OperationKind::Get, signed_url, object)?;

        let file_path = self.object_path(object);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                TransportError::from_status(404, format!("{} not found", object))
            } else {
                TransportError::Io(err)
            }
        })?;
        debug!("serving {} from {}", object, file_path.display());

        Ok(ReaderStream::new(file).map_err(TransportError::Io).boxed())
    }

    /// Stream-upload an object to disk and write its metadata sidecar.
    ///
    /// Bytes land in a temp file first and are renamed into place once fully
    /// written and synced; the temp file is removed on any error.
    async fn put(
        &self,
        signed_url: &str,
        object: &ObjectRef,
        mut body: ByteStream,
    ) -> Result<u64, TransportError> {
        self.authorize(OperationKind::Put, signed_url, object)?;

        let file_path = self.object_path(object);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            TransportError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            };
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransportError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransportError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransportError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransportError::Io(err));
            }
        }

        let stored = StoredObject {
            bucket: object.bucket().to_string(),
            key: object.key().to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            metadata: object.metadata().clone(),
            last_modified: Utc::now(),
        };
        let meta = serde_json::to_vec(&stored)
            .map_err(|err| TransportError::Io(io::Error::other(err)))?;
        fs::write(Self::meta_path(&file_path), meta).await?;
        debug!("stored {} ({} bytes, etag {})", object, size_bytes, stored.etag);

        Ok(size_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    fn store(dir: &Path) -> LocalStore {
        let signer = UrlSigner::new("secret", "http://store.local/", Duration::from_secs(60)).unwrap();
        LocalStore::new(signer, dir)
    }

    fn body(parts: &[&'static str]) -> ByteStream {
        let chunks: Vec<Result<Bytes, TransportError>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn put_then_get_with_signed_urls() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let object = ObjectRef::new("bucket", "docs/a.txt").with_metadata("owner", "ana");

        let put_url = store.signer.sign(OperationKind::Put, &object, Utc::now()).unwrap();
        let stored = store.put(&put_url, &object, body(&["hello ", "world"])).await.unwrap();
        assert_eq!(stored, 11);

        let stat = store.stat(&object).await.unwrap().unwrap();
        assert_eq!(stat.etag, format!("{:x}", md5::compute(b"hello world")));
        assert_eq!(stat.metadata.get("owner").map(String::as_str), Some("ana"));

        let get_url = store.signer.sign(OperationKind::Get, &object, Utc::now()).unwrap();
        let parts: Vec<Bytes> = store.get(&get_url, &object).await.unwrap().try_collect().await.unwrap();
        assert_eq!(parts.concat(), b"hello world");
    }

    #[tokio::test]
    async fn rejects_urls_for_other_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let object = ObjectRef::new("bucket", "a.txt");
        let url = store.signer.sign(OperationKind::Put, &object, Utc::now()).unwrap();

        let err = store
            .put(&url, &ObjectRef::new("bucket", "b.txt"), body(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected { status: 403, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn missing_object_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let object = ObjectRef::new("bucket", "nope");
        let url = store.signer.sign(OperationKind::Get, &object, Utc::now()).unwrap();

        match store.get(&url, &object).await {
            Err(TransportError::Rejected { status, .. }) => assert_eq!(status, 404),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected a missing object"),
        }
    }

    #[tokio::test]
    async fn failed_upload_leaves_no_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let object = ObjectRef::new("bucket", "broken.bin");
        let url = store.signer.sign(OperationKind::Put, &object, Utc::now()).unwrap();

        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(TransportError::Transient("connection reset".into())),
        ])
        .boxed();
        assert!(store.put(&url, &object, failing).await.is_err());
        assert!(store.read(&object).await.is_err());
        assert!(store.stat(&object).await.unwrap().is_none());
    }
}
