//! The outcome of one authorization decision.

use crate::models::object::ObjectRef;
use serde::{Deserialize, Serialize};

/// Signed or declined, never both and never neither.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GrantOutcome {
    Signed { signed_url: String },
    Declined { decline_reason: String },
}

/// One gatekeeper decision for one proposed operation.
///
/// `granted` is the object the signature actually covers. Policy may rename
/// it, so transfers must always address `granted` rather than `requested`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AccessGrant {
    pub transaction_id: String,
    pub signature_type: String,
    pub requested: ObjectRef,
    pub granted: ObjectRef,
    #[serde(flatten)]
    pub outcome: GrantOutcome,
}

impl AccessGrant {
    pub fn signed(
        transaction_id: String,
        signature_type: &str,
        requested: ObjectRef,
        granted: ObjectRef,
        signed_url: String,
    ) -> Self {
        Self {
            transaction_id,
            signature_type: signature_type.to_string(),
            requested,
            granted,
            outcome: GrantOutcome::Signed { signed_url },
        }
    }

    /// A declined grant echoes the requested object as the granted one.
    pub fn declined(
        transaction_id: String,
        signature_type: &str,
        requested: ObjectRef,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            transaction_id,
            signature_type: signature_type.to_string(),
            granted: requested.clone(),
            requested,
            outcome: GrantOutcome::Declined {
                decline_reason: reason.into(),
            },
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self.outcome, GrantOutcome::Signed { .. })
    }

    pub fn signed_url(&self) -> Option<&str> {
        match &self.outcome {
            GrantOutcome::Signed { signed_url } => Some(signed_url),
            GrantOutcome::Declined { .. } => None,
        }
    }

    pub fn decline_reason(&self) -> Option<&str> {
        match &self.outcome {
            GrantOutcome::Declined { decline_reason } => Some(decline_reason),
            GrantOutcome::Signed { .. } => None,
        }
    }

    /// Narrow to a [`SignedGrant`], handing the grant back if it was declined.
    pub fn into_signed(self) -> Result<SignedGrant, AccessGrant> {
        match self.outcome {
            GrantOutcome::Signed { signed_url } => Ok(SignedGrant {
                transaction_id: self.transaction_id,
                signature_type: self.signature_type,
                requested: self.requested,
                granted: self.granted,
                signed_url,
            }),
            GrantOutcome::Declined { .. } => Err(self),
        }
    }
}

/// A grant known to carry a signed URL. Only obtainable through
/// [`AccessGrant::into_signed`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedGrant {
    transaction_id: String,
    signature_type: String,
    requested: ObjectRef,
    granted: ObjectRef,
    signed_url: String,
}

impl SignedGrant {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn signature_type(&self) -> &str {
        &self.signature_type
    }

    pub fn requested(&self) -> &ObjectRef {
        &self.requested
    }

    pub fn granted(&self) -> &ObjectRef {
        &self.granted
    }

    pub fn signed_url(&self) -> &str {
        &self.signed_url
    }
}

impl From<SignedGrant> for AccessGrant {
    fn from(grant: SignedGrant) -> Self {
        AccessGrant::signed(
            grant.transaction_id,
            &grant.signature_type,
            grant.requested,
            grant.granted,
            grant.signed_url,
        )
    }
}

/// Split gatekeeper output into the grants the engine can run and the
/// declines the caller reports on its own.
pub fn split_grants(grants: Vec<AccessGrant>) -> (Vec<SignedGrant>, Vec<AccessGrant>) {
    let mut signed = Vec::new();
    let mut declined = Vec::new();
    for grant in grants {
        match grant.into_signed() {
            Ok(grant) => signed.push(grant),
            Err(grant) => declined.push(grant),
        }
    }
    (signed, declined)
}

/// Flat per-request record handed to the downstream audit serializer.
///
/// Carries the original object reference, the outcome, and for signed
/// requests the resulting object reference and URL.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RequestRecord {
    pub transaction_id: String,
    pub signature_type: String,
    pub signed: bool,
    pub request_object: ObjectRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_object: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
}

impl From<&AccessGrant> for RequestRecord {
    fn from(grant: &AccessGrant) -> Self {
        let signed = grant.is_signed();
        Self {
            transaction_id: grant.transaction_id.clone(),
            signature_type: grant.signature_type.clone(),
            signed,
            request_object: grant.requested.clone(),
            signed_object: signed.then(|| grant.granted.clone()),
            signed_url: grant.signed_url().map(str::to_string),
            decline_reason: grant.decline_reason().map(str::to_string),
        }
    }
}
