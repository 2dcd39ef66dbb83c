pub mod gatekeeper_handlers;
pub mod health_handlers;
