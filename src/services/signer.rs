//! Query-string URL signing.
//!
//! A signed URL looks like
//! `{endpoint}/{bucket}/{key}?X-Gk-Expires={unix}&X-Gk-Signature={sig}` where
//! `sig` is the unpadded base64url HMAC-SHA256 of the canonical string:
//!
//! ```text
//! METHOD\nEXPIRES\n/bucket/key\n[x-amz-meta-name:value\n ...]
//! ```
//!
//! Metadata lines are only part of the canonical string for uploads, since
//! that is the only direction in which the client sends metadata. Objects are
//! validated before signing or verifying, so metadata names are already
//! lowercase tokens and values hold no line breaks.

use crate::models::object::{ObjectRef, ObjectRefError, OperationKind};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

pub const EXPIRES_PARAM: &str = "X-Gk-Expires";
pub const SIGNATURE_PARAM: &str = "X-Gk-Signature";

/// Longest lifetime a signed URL may be issued with (seven days).
pub const MAX_URL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("endpoint `{0}` cannot carry object paths")]
    InvalidEndpoint(String),
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("malformed signed url: {0}")]
    MalformedUrl(String),
    #[error("signed url does not address {0}")]
    ObjectMismatch(String),
    #[error("signed url expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("signature mismatch")]
    BadSignature,
    #[error("url lifetime must be at most {MAX_URL_TTL_SECS} seconds")]
    TtlOutOfRange,
    #[error("cannot sign {0}")]
    InvalidObject(#[from] ObjectRefError),
}

/// Produces and checks time-scoped signed URLs for one storage endpoint.
#[derive(Clone)]
pub struct UrlSigner {
    keyed: HmacSha256,
    endpoint: Url,
    ttl: Duration,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner")
            .field("endpoint", &self.endpoint.as_str())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(
        secret: impl AsRef<[u8]>,
        endpoint: &str,
        ttl: std::time::Duration,
    ) -> Result<Self, SignatureError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignatureError::EmptySecret);
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::EmptySecret)?;
        let endpoint =
            Url::parse(endpoint).map_err(|_| SignatureError::InvalidEndpoint(endpoint.into()))?;
        if endpoint.cannot_be_a_base() {
            return Err(SignatureError::InvalidEndpoint(endpoint.to_string()));
        }
        if ttl.as_secs() > MAX_URL_TTL_SECS {
            return Err(SignatureError::TtlOutOfRange);
        }
        let ttl = Duration::from_std(ttl).map_err(|_| SignatureError::TtlOutOfRange)?;
        Ok(Self {
            keyed,
            endpoint,
            ttl,
        })
    }

    /// How long a freshly signed URL stays valid.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign `object` for `kind`, valid until `now + ttl`.
    pub fn sign(
        &self,
        kind: OperationKind,
        object: &ObjectRef,
        now: DateTime<Utc>,
    ) -> Result<String, SignatureError> {
        object.validate()?;
        let expires = now
            .checked_add_signed(self.ttl)
            .ok_or(SignatureError::TtlOutOfRange)?
            .timestamp();
        let signature = URL_SAFE_NO_PAD.encode(self.mac(kind, object, expires).finalize().into_bytes());

        let mut url = self.object_url(object)?;
        url.query_pairs_mut()
            .append_pair(EXPIRES_PARAM, &expires.to_string())
            .append_pair(SIGNATURE_PARAM, &signature);
        Ok(url.into())
    }

    /// Check that `signed_url` authorizes `kind` on `object` at `now`.
    pub fn verify(
        &self,
        kind: OperationKind,
        signed_url: &str,
        object: &ObjectRef,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        object.validate()?;
        let url =
            Url::parse(signed_url).map_err(|err| SignatureError::MalformedUrl(err.to_string()))?;

        let expected = self.object_url(object)?;
        if url.origin() != expected.origin() || url.path() != expected.path() {
            return Err(SignatureError::ObjectMismatch(object.to_string()));
        }

        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                EXPIRES_PARAM => expires = Some(value.into_owned()),
                SIGNATURE_PARAM => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let expires: i64 = expires
            .ok_or_else(|| SignatureError::MalformedUrl(format!("missing {EXPIRES_PARAM}")))?
            .parse()
            .map_err(|_| SignatureError::MalformedUrl(format!("bad {EXPIRES_PARAM}")))?;
        let signature = signature
            .ok_or_else(|| SignatureError::MalformedUrl(format!("missing {SIGNATURE_PARAM}")))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature.as_bytes())
            .map_err(|_| SignatureError::BadSignature)?;

        self.mac(kind, object, expires)
            .verify_slice(&signature)
            .map_err(|_| SignatureError::BadSignature)?;

        if now.timestamp() > expires {
            let at = DateTime::from_timestamp(expires, 0).unwrap_or(now);
            return Err(SignatureError::Expired(at));
        }
        Ok(())
    }

    fn object_url(&self, object: &ObjectRef) -> Result<Url, SignatureError> {
        let mut url = self.endpoint.clone();
        url.set_query(None);
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SignatureError::InvalidEndpoint(self.endpoint.to_string()))?;
            segments.pop_if_empty();
            segments.push(object.bucket());
            segments.extend(object.key().split('/'));
        }
        Ok(url)
    }

    fn mac(&self, kind: OperationKind, object: &ObjectRef, expires: i64) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(canonical_string(kind, object, expires).as_bytes());
        mac
    }
}

fn canonical_string(kind: OperationKind, object: &ObjectRef, expires: i64) -> String {
    let mut canonical = format!(
        "{}\n{}\n/{}/{}\n",
        kind.method(),
        expires,
        object.bucket(),
        object.key()
    );
    if kind == OperationKind::Put {
        for (name, value) in object.metadata() {
            canonical.push_str(&format!("x-amz-meta-{}:{}\n", name, value));
        }
    }
    canonical
}
