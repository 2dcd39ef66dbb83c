//! Gatekeeper: evaluates proposed operations and answers each one with a
//! signed or declined [`AccessGrant`].
//!
//! The gatekeeper holds no mutable state of its own. Every decision gets a
//! fresh transaction id from the configured [`TransactionIdProvider`] so the
//! decision can be correlated in audit logs, including malformed requests.

use crate::{
    models::{
        grant::AccessGrant,
        message::{ClientInfo, GatekeeperRequest, GatekeeperResponse},
        object::ProposedOperation,
    },
    services::{
        policy::{Decision, Policy, PolicyContext},
        signer::UrlSigner,
    },
};
use chrono::Utc;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const INVALID_REQUEST: &str = "invalid request";

/// Source of per-decision transaction identifiers.
///
/// Called once per proposed operation, possibly from many request handlers at
/// once, so implementations must hand out distinct values across threads.
pub trait TransactionIdProvider: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random (v4) UUIDs. The default provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidTransactionIdProvider;

impl TransactionIdProvider for UuidTransactionIdProvider {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// `{prefix}{n}` with a process-local counter, for deployments that want
/// readable, ordered identifiers.
#[derive(Debug, Default)]
pub struct SequentialTransactionIdProvider {
    prefix: String,
    next: AtomicU64,
}

impl SequentialTransactionIdProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl TransactionIdProvider for SequentialTransactionIdProvider {
    fn next_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", self.prefix, n)
    }
}

/// Policy engine issuing time-limited signed URLs.
#[derive(Clone)]
pub struct Gatekeeper {
    ids: Arc<dyn TransactionIdProvider>,
    policy: Arc<dyn Policy>,
    signer: UrlSigner,
}

impl Gatekeeper {
    pub fn new(
        ids: Arc<dyn TransactionIdProvider>,
        policy: Arc<dyn Policy>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            ids,
            policy,
            signer,
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Answer a wire request.
    pub fn handle(&self, request: &GatekeeperRequest) -> GatekeeperResponse {
        GatekeeperResponse {
            grants: self.evaluate(&request.operations, &request.client),
        }
    }

    /// Evaluate a batch: exactly one grant per operation, in input order.
    pub fn evaluate(&self, batch: &[ProposedOperation], client: &ClientInfo) -> Vec<AccessGrant> {
        let grants: Vec<_> = batch
            .iter()
            .enumerate()
            .map(|(position, op)| self.evaluate_one(position, op, client))
            .collect();

        let signed = grants.iter().filter(|g| g.is_signed()).count();
        debug!(
            "evaluated {} operations for {:?}: {} signed, {} declined",
            grants.len(),
            client.remote_address,
            signed,
            grants.len() - signed
        );
        grants
    }

    fn evaluate_one(
        &self,
        position: usize,
        op: &ProposedOperation,
        client: &ClientInfo,
    ) -> AccessGrant {
        let transaction_id = self.ids.next_id();
        let signature_type = op.kind.signature_type();
        let requested = op.requested_object();

        let object = match op.object() {
            Ok(object) => object,
            Err(err) => {
                debug!(%transaction_id, "declining malformed operation: {}", err);
                return AccessGrant::declined(
                    transaction_id,
                    signature_type,
                    requested,
                    INVALID_REQUEST,
                );
            }
        };

        let ctx = PolicyContext {
            kind: op.kind,
            client,
            position,
        };
        match self.policy.decide(object, ctx) {
            Decision::Allow { object } => match self.signer.sign(op.kind, &object, Utc::now()) {
                Ok(url) => {
                    debug!(%transaction_id, "signed {} {}", op.kind.method(), object);
                    AccessGrant::signed(transaction_id, signature_type, requested, object, url)
                }
                Err(err) => {
                    warn!(%transaction_id, "failed to sign {}: {}", object, err);
                    AccessGrant::declined(
                        transaction_id,
                        signature_type,
                        requested,
                        "signing failed",
                    )
                }
            },
            Decision::Deny { reason } => {
                debug!(%transaction_id, "declined {}: {}", requested, reason);
                AccessGrant::declined(transaction_id, signature_type, requested, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::object::{ObjectRef, OperationKind},
        services::policy::DefaultPolicy,
    };
    use std::{collections::HashSet, time::Duration};

    fn signer() -> UrlSigner {
        UrlSigner::new("secret", "http://storage.local/", Duration::from_secs(60)).unwrap()
    }

    fn gatekeeper(policy: impl Policy + 'static) -> Gatekeeper {
        Gatekeeper::new(
            Arc::new(SequentialTransactionIdProvider::new("tx-")),
            Arc::new(policy),
            signer(),
        )
    }

    #[test]
    fn one_grant_per_operation_in_order() {
        let gk = gatekeeper(DefaultPolicy::default());
        let ops = vec![
            ProposedOperation::put(ObjectRef::new("bucket", "a")),
            ProposedOperation {
                kind: OperationKind::Put,
                bucket: None,
                key: Some("b".into()),
                metadata: Default::default(),
            },
            ProposedOperation::get(ObjectRef::new("bucket", "c")),
        ];

        let grants = gk.evaluate(&ops, &ClientInfo::default());
        assert_eq!(grants.len(), 3);
        let ids: Vec<_> = grants.iter().map(|g| g.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["tx-1", "tx-2", "tx-3"]);

        assert!(grants[0].is_signed());
        assert_eq!(grants[1].decline_reason(), Some(INVALID_REQUEST));
        assert!(grants[2].is_signed());
        assert_eq!(grants[2].signature_type, "get");
        for grant in &grants {
            assert!(grant.signed_url().is_some() != grant.decline_reason().is_some());
        }
    }

    #[test]
    fn policy_decline_is_not_an_error() {
        let gk = gatekeeper(|object: ObjectRef, ctx: PolicyContext<'_>| {
            if ctx.position == 1 {
                Decision::Deny {
                    reason: "policy violation".into(),
                }
            } else {
                Decision::Allow { object }
            }
        });
        let ops: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|k| ProposedOperation::put(ObjectRef::new("bucket", *k)))
            .collect();

        let grants = gk.evaluate(&ops, &ClientInfo::default());
        let signed: Vec<_> = grants.iter().map(AccessGrant::is_signed).collect();
        assert_eq!(signed, vec![true, false, true]);
        assert_eq!(grants[1].decline_reason(), Some("policy violation"));
    }

    #[test]
    fn signed_url_covers_rewritten_object() {
        let gk = gatekeeper(DefaultPolicy {
            key_prefix: Some("incoming/".into()),
            ..Default::default()
        });
        let grants = gk.evaluate(
            &[ProposedOperation::put(ObjectRef::new("bucket", "report.pdf"))],
            &ClientInfo::default(),
        );
        let grant = &grants[0];
        assert_eq!(grant.requested.key(), "report.pdf");
        assert_eq!(grant.granted.key(), "incoming/report.pdf");

        let url = grant.signed_url().unwrap();
        assert!(url.contains("/bucket/incoming/report.pdf?"));
        assert!(
            gk.signer()
                .verify(OperationKind::Put, url, &grant.granted, Utc::now())
                .is_ok()
        );
    }

    #[test]
    fn unsafe_metadata_is_an_invalid_request() {
        let gk = gatekeeper(DefaultPolicy::default());
        let mut injected = ProposedOperation::put(ObjectRef::new("bucket", "a"));
        injected
            .metadata
            .insert("owner".into(), "ana\nx-amz-meta-role:admin".into());
        let mut mixed_case = ProposedOperation::put(ObjectRef::new("bucket", "b"));
        mixed_case.metadata.insert("Owner".into(), "ana".into());
        mixed_case.metadata.insert("owner".into(), "eve".into());
        let mut shouted = ProposedOperation::put(ObjectRef::new("bucket", "c"));
        shouted.metadata.insert("Owner".into(), "ana".into());

        let grants = gk.evaluate(&[injected, mixed_case, shouted], &ClientInfo::default());
        assert_eq!(grants[0].decline_reason(), Some(INVALID_REQUEST));
        assert_eq!(grants[1].decline_reason(), Some(INVALID_REQUEST));

        let granted = &grants[2].granted;
        assert_eq!(granted.metadata().get("owner").map(String::as_str), Some("ana"));
        assert!(
            gk.signer()
                .verify(OperationKind::Put, grants[2].signed_url().unwrap(), granted, Utc::now())
                .is_ok()
        );
    }

    #[test]
    fn uuid_provider_has_no_duplicates_under_concurrency() {
        let provider = Arc::new(UuidTransactionIdProvider);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = Arc::clone(&provider);
                std::thread::spawn(move || {
                    (0..12_500).map(|_| provider.next_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate transaction id");
            }
        }
        assert_eq!(seen.len(), 100_000);
    }

    #[test]
    fn sequential_provider_has_no_duplicates_under_concurrency() {
        let provider = Arc::new(SequentialTransactionIdProvider::new("gk-"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let provider = Arc::clone(&provider);
                std::thread::spawn(move || {
                    (0..25_000).map(|_| provider.next_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            seen.extend(handle.join().unwrap());
        }
        assert_eq!(seen.len(), 100_000);
    }
}
