//! Object references and the operations a client proposes against them.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_METADATA_NAME_LEN: usize = 128;
const MAX_METADATA_VALUE_LEN: usize = 2048;

/// Reasons an object reference is rejected before policy ever sees it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectRefError {
    #[error("bucket name is missing")]
    MissingBucket,
    #[error("object key is missing")]
    MissingKey,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: &'static str },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("metadata `{name}` invalid: {reason}")]
    InvalidMetadata { name: String, reason: &'static str },
}

/// Identifies a single object in the storage service.
///
/// Metadata is kept in key order so that signatures computed over it are
/// stable regardless of how the caller assembled the map.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    bucket: String,
    key: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Return a copy of this reference with one more metadata entry.
    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Return a copy of this reference pointing at a different key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Check the bucket, key and metadata against the storage naming rules.
    pub fn validate(&self) -> Result<(), ObjectRefError> {
        ensure_bucket_name_safe(&self.bucket)?;
        ensure_key_safe(&self.key)?;
        self.metadata
            .iter()
            .try_for_each(|(name, value)| ensure_metadata_safe(name, value))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Direction of a proposed transfer.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Get,
    Put,
}

impl OperationKind {
    /// HTTP verb used when the operation is signed.
    pub fn method(self) -> &'static str {
        match self {
            OperationKind::Get => "GET",
            OperationKind::Put => "PUT",
        }
    }

    /// Signature type recorded on the resulting grant.
    pub fn signature_type(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::Put => "put",
        }
    }
}

/// An operation awaiting authorization.
///
/// Bucket and key are optional on the wire so that a client that forgets one
/// still receives a declined grant rather than a parse failure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProposedOperation {
    pub kind: OperationKind,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ProposedOperation {
    pub fn get(object: ObjectRef) -> Self {
        Self::from_object(OperationKind::Get, object)
    }

    pub fn put(object: ObjectRef) -> Self {
        Self::from_object(OperationKind::Put, object)
    }

    pub fn from_object(kind: OperationKind, object: ObjectRef) -> Self {
        Self {
            kind,
            bucket: Some(object.bucket),
            key: Some(object.key),
            metadata: object.metadata,
        }
    }

    /// Best-effort view of what was requested, used for audit records even
    /// when the request is malformed.
    pub fn requested_object(&self) -> ObjectRef {
        ObjectRef {
            bucket: self.bucket.clone().unwrap_or_default(),
            key: self.key.clone().unwrap_or_default(),
            metadata: self.metadata.clone(),
        }
    }

    /// Turn the request into a validated object reference.
    ///
    /// Metadata names are case-insensitive on the wire and lowercased here;
    /// two names that differ only in case are rejected.
    pub fn object(&self) -> Result<ObjectRef, ObjectRefError> {
        let bucket = match self.bucket.as_deref() {
            Some(b) if !b.is_empty() => b,
            _ => return Err(ObjectRefError::MissingBucket),
        };
        let key = match self.key.as_deref() {
            Some(k) if !k.is_empty() => k,
            _ => return Err(ObjectRefError::MissingKey),
        };
        let mut metadata = BTreeMap::new();
        for (name, value) in &self.metadata {
            let lowered = name.to_ascii_lowercase();
            if metadata.insert(lowered, value.clone()).is_some() {
                return Err(ObjectRefError::InvalidMetadata {
                    name: name.clone(),
                    reason: "duplicates another name ignoring case",
                });
            }
        }
        let object = ObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
            metadata,
        };
        object.validate()?;
        Ok(object)
    }
}

/// Reject keys that would escape the bucket or confuse path handling.
pub(crate) fn ensure_key_safe(key: &str) -> Result<(), ObjectRefError> {
    if key.is_empty() {
        return Err(ObjectRefError::MissingKey);
    }
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(ObjectRefError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(ObjectRefError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(ObjectRefError::InvalidObjectKey);
    }
    Ok(())
}

/// Metadata ends up in signed canonical strings one `name:value` line per
/// entry, so names are restricted to a lowercase token alphabet and values
/// may not carry control characters.
pub(crate) fn ensure_metadata_safe(name: &str, value: &str) -> Result<(), ObjectRefError> {
    let invalid = |reason| ObjectRefError::InvalidMetadata {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() || name.len() > MAX_METADATA_NAME_LEN {
        return Err(invalid("name must be between 1 and 128 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(invalid(
            "name may only use lowercase letters, digits, hyphens, underscores and dots",
        ));
    }
    if value.len() > MAX_METADATA_VALUE_LEN {
        return Err(invalid("value longer than 2048 bytes"));
    }
    if value.chars().any(char::is_control) {
        return Err(invalid("value contains control characters"));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub(crate) fn ensure_bucket_name_safe(name: &str) -> Result<(), ObjectRefError> {
    let invalid = |reason| ObjectRefError::InvalidBucketName {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(ObjectRefError::MissingBucket);
    }
    if name.trim() != name {
        return Err(invalid("cannot begin or end with whitespace"));
    }
    if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_ordered_by_name() {
        let object = ObjectRef::new("photos", "a.jpg")
            .with_metadata("zeta", "1")
            .with_metadata("alpha", "2");
        let names: Vec<_> = object.metadata().keys().cloned().collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn rejects_bad_bucket_names() {
        for name in ["ab", "Upper", "-lead", "trail.", "a..b", "192.168.1.1"] {
            let err = ObjectRef::new(name, "k").validate().unwrap_err();
            assert!(
                matches!(err, ObjectRefError::InvalidBucketName { .. }),
                "{name} should be rejected"
            );
        }
        assert!(ObjectRef::new("my-bucket.v2", "k").validate().is_ok());
    }

    #[test]
    fn rejects_traversal_keys() {
        for key in ["/abs", "a/../b", "tab\there", "back\\slash"] {
            assert_eq!(
                ObjectRef::new("bucket", key).validate(),
                Err(ObjectRefError::InvalidObjectKey)
            );
        }
    }

    #[test]
    fn proposed_operation_requires_bucket_and_key() {
        let mut op = ProposedOperation::put(ObjectRef::new("bucket", "key"));
        assert!(op.object().is_ok());

        op.key = Some(String::new());
        assert_eq!(op.object(), Err(ObjectRefError::MissingKey));

        op.bucket = None;
        assert_eq!(op.object(), Err(ObjectRefError::MissingBucket));
    }

    #[test]
    fn rejects_metadata_that_could_forge_canonical_lines() {
        let cases = [
            ("owner", "ana\nx-amz-meta-role:admin"),
            ("owner", "tab\there"),
            ("Owner", "ana"),
            ("own:er", "ana"),
            ("", "ana"),
        ];
        for (name, value) in cases {
            let err = ObjectRef::new("bucket", "k")
                .with_metadata(name, value)
                .validate()
                .unwrap_err();
            assert!(
                matches!(err, ObjectRefError::InvalidMetadata { .. }),
                "{name:?}={value:?} should be rejected"
            );
        }
        assert!(
            ObjectRef::new("bucket", "k")
                .with_metadata("content-type", "image/jpeg; q=0.9")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn proposed_metadata_names_are_lowercased() {
        let mut op = ProposedOperation::put(ObjectRef::new("bucket", "key"));
        op.metadata.insert("Content-Type".into(), "text/plain".into());
        let object = op.object().unwrap();
        assert_eq!(
            object.metadata().get("content-type").map(String::as_str),
            Some("text/plain")
        );

        op.metadata.insert("content-type".into(), "text/html".into());
        assert!(matches!(
            op.object(),
            Err(ObjectRefError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn operation_kind_wire_format() {
        let json = serde_json::to_string(&OperationKind::Put).unwrap();
        assert_eq!(json, "\"PUT\"");
        assert_eq!(OperationKind::Get.signature_type(), "get");
    }
}
