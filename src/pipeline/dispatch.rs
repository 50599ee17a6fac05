//! Reply dispatch — gateway send plus outbound persistence.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::gateway::Gateway;
use crate::store::Store;
use crate::store::models::{
    Conversation, DeliveryStatus, Message, MessageKind, NewMessage,
};

/// Sends reply text through the gateway and records the outcome.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn Gateway>) -> Self {
        Self { store, gateway }
    }

    /// Send `text` to `phone` and persist the outbound bot message.
    ///
    /// On gateway failure nothing is persisted and no retry happens here;
    /// redelivery belongs to the gateway's own queuing. `metadata` records
    /// why the reply was sent (claiming rule or RAG sources).
    pub async fn send(
        &self,
        conversation: &Conversation,
        instance_id: &str,
        phone: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<Message, PipelineError> {
        self.gateway
            .send_text(instance_id, phone, text)
            .await
            .map_err(PipelineError::Dispatch)?;

        let now = Utc::now();
        let message = self
            .store
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_phone: None,
                recipient_phone: Some(phone.to_string()),
                body: text.to_string(),
                kind: MessageKind::Text,
                status: DeliveryStatus::Sent,
                from_bot: true,
                metadata,
                timestamp: now,
            })
            .await
            .map_err(|source| PipelineError::Store {
                stage: "dispatch_persist",
                source,
            })?;

        if let Err(e) = self
            .store
            .advance_conversation_last_message(&conversation.id, now)
            .await
        {
            warn!(
                conversation_id = %conversation.id,
                error = %e,
                "Failed to advance last_message_at after dispatch"
            );
        }

        info!(
            conversation_id = %conversation.id,
            phone = %phone,
            chars = text.len(),
            "Reply dispatched"
        );
        Ok(message)
    }
}
