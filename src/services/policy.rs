//! Authorization policy: the decision function the gatekeeper consults.

use crate::models::{
    message::ClientInfo,
    object::{ObjectRef, ObjectRefError, OperationKind},
};
use std::collections::{BTreeMap, BTreeSet};

/// Result of applying policy to one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Allowed, possibly against a rewritten object.
    Allow { object: ObjectRef },
    Deny { reason: String },
}

/// Context the policy sees alongside the object.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    pub kind: OperationKind,
    pub client: &'a ClientInfo,
    /// Position of the operation in its batch, starting at 0.
    pub position: usize,
}

/// Decides whether an operation may proceed.
///
/// Implementations must be cheap and side-effect free; the gatekeeper calls
/// them once per operation while building a response.
pub trait Policy: Send + Sync {
    fn decide(&self, object: ObjectRef, ctx: PolicyContext<'_>) -> Decision;
}

impl<F> Policy for F
where
    F: Fn(ObjectRef, PolicyContext<'_>) -> Decision + Send + Sync,
{
    fn decide(&self, object: ObjectRef, ctx: PolicyContext<'_>) -> Decision {
        self(object, ctx)
    }
}

/// Configuration-driven policy.
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    /// Buckets clients may address. Empty means any bucket.
    pub allowed_buckets: BTreeSet<String>,
    /// Prefix every granted key must carry; missing prefixes are added.
    pub key_prefix: Option<String>,
    /// Maximum operations authorized per request.
    pub max_operations: usize,
    /// Maximum metadata entries on a single object.
    pub max_metadata_entries: usize,
    pub allowed_operations: BTreeSet<OperationKind>,
    /// Metadata stamped onto every granted object.
    pub forced_metadata: BTreeMap<String, String>,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self {
            allowed_buckets: BTreeSet::new(),
            key_prefix: None,
            max_operations: 1000,
            max_metadata_entries: 32,
            allowed_operations: [OperationKind::Get, OperationKind::Put].into_iter().collect(),
            forced_metadata: BTreeMap::new(),
        }
    }
}

impl Policy for DefaultPolicy {
    fn decide(&self, object: ObjectRef, ctx: PolicyContext<'_>) -> Decision {
        let deny = |reason: &str| Decision::Deny {
            reason: reason.to_string(),
        };

        if !self.allowed_operations.contains(&ctx.kind) {
            return deny("operation not permitted");
        }
        if ctx.position >= self.max_operations {
            return deny("quota exceeded");
        }
        if !self.allowed_buckets.is_empty() && !self.allowed_buckets.contains(object.bucket()) {
            return deny("bucket not permitted");
        }
        if object.metadata().len() > self.max_metadata_entries {
            return deny("too many metadata entries");
        }

        let mut granted = match &self.key_prefix {
            Some(prefix) if !object.key().starts_with(prefix.as_str()) => {
                let key = format!("{}{}", prefix, object.key());
                object.with_key(key)
            }
            _ => object,
        };
        for (name, value) in &self.forced_metadata {
            granted = granted.with_metadata(name.clone(), value.clone());
        }
        match granted.validate() {
            Ok(()) => {}
            Err(ObjectRefError::InvalidMetadata { .. }) => {
                return deny("metadata violates naming policy");
            }
            Err(_) => return deny("key violates naming policy"),
        }

        Decision::Allow { object: granted }
    }
}
