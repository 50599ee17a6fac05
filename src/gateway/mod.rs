//! Outbound messaging gateway abstraction.

pub mod http;

pub use http::HttpGateway;

use async_trait::async_trait;

use crate::error::GatewayError;

/// The chat-transport service that delivers messages on the pipeline's
/// behalf (a WhatsApp session bridge). The pipeline only needs text send;
/// instance lifecycle stays on the gateway side.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a text message to a phone number through the given instance.
    async fn send_text(
        &self,
        instance_id: &str,
        phone: &str,
        text: &str,
    ) -> Result<(), GatewayError>;
}
