//! Gatekeeper request/response documents exchanged with clients.

use crate::models::{grant::AccessGrant, object::ProposedOperation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What the gatekeeper knows about the caller.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    /// Remote address as seen by the gatekeeper service.
    #[serde(default)]
    pub remote_address: Option<String>,

    /// User agent reported by the client.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Client identity, if the application supplies one.
    #[serde(default)]
    pub identity: Option<String>,

    /// Application properties (user inputs and application parameters).
    #[serde(default)]
    pub application_properties: BTreeMap<String, String>,

    /// Message-level properties carried alongside the request.
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
}

/// A batch of operations submitted for authorization.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct GatekeeperRequest {
    #[serde(default)]
    pub client: ClientInfo,
    pub operations: Vec<ProposedOperation>,
}

/// One grant per submitted operation, in submission order.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GatekeeperResponse {
    pub grants: Vec<AccessGrant>,
}
