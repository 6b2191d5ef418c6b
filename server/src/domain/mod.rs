//! Domain layer: the resilient message pipeline

pub mod breaker;
pub mod events;
pub mod gateway;
pub mod ingest;
pub mod presence;
pub mod rooms;
pub mod status;
pub mod workers;

pub use breaker::{BreakerState, CircuitBreaker};
pub use gateway::{GatewayError, MessageStoreGateway};
pub use ingest::{IngestError, IngestOutcome, IngestService, SendMessageRequest};
pub use presence::PresenceRegistry;
pub use rooms::{RoomError, RoomRegistry};
pub use status::{StatusError, StatusTracker};
