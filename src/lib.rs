//! Gatekeeper authorization for object storage and a concurrent engine that
//! carries out the transfers it grants.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod transfer;
