//! HTTP handlers.

pub mod catalog;
pub mod circuit_breakers;
pub mod deliveries;
pub mod events;
pub mod ingest;
