//! The webhook-driven conversation pipeline.

pub mod automation;
pub mod coordinator;
pub mod dispatch;
pub mod normalizer;
pub mod resolver;
pub mod retrieval;

pub use coordinator::{EventOutcome, PipelineCoordinator, Stage};
pub use normalizer::{GatewayEvent, InboundEvent, WebhookEnvelope};
