pub mod gatekeeper;
pub mod local_store;
pub mod policy;
pub mod signer;
