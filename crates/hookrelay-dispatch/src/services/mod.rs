//! Pipeline services: ingestion, matching, dispatch and operator actions.

pub mod catalog_service;
pub mod delivery_service;
pub mod event_processing;
pub mod ingest_service;
pub mod operator_service;
pub mod token_service;

pub use catalog_service::{CatalogService, NewEndpoint, NewSource, NewSubscription};
pub use delivery_service::{DeliveryService, DispatchOutcome};
pub use event_processing::EventProcessor;
pub use ingest_service::{IngestOutcome, IngestService};
pub use operator_service::{BatchReport, BreakerConfigUpdate, OperatorService};
pub use token_service::{TokenError, TokenService};
