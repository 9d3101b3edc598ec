//! Domain records persisted by the [`Store`](crate::store::Store).

mod delivery;
mod endpoint;
mod event;
mod project;
mod source;
mod subscription;

pub use delivery::{
    DeliveryAttempt, DeliveryFilter, DeliveryMetadata, DeliveryStatus, EventDelivery,
};
pub use endpoint::{
    Endpoint, EndpointAuth, EndpointSecret, EndpointStatus, OAuth2Config, OAuth2Grant,
};
pub use event::{Event, EventStatus, InboundRequest, EVENT_TYPE_HEADER, WILDCARD_EVENT_TYPE};
pub use project::{Project, SignatureConfig};
pub use source::{CustomResponse, HmacConfig, Source, SourceType, VerifierConfig};
pub use subscription::{AlertConfig, RetryConfig, Subscription, SubscriptionFilter};
