//! Pipeline coordinator — sequences one webhook event through the stages.
//!
//! Stage order: normalize → identity → conversation → persist inbound →
//! automation → (claimed? done : retrieval → dispatch). Everything after
//! the inbound message is persisted is best-effort: a failure ends the
//! event with a recorded error and never rolls the message back. The
//! already-persisted record is picked up naturally when the next event
//! re-triggers resolution, so no half-finished run is ever resumed.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{LlmConfig, RagConfig};
use crate::error::PipelineError;
use crate::gateway::Gateway;
use crate::llm::provider::{CompletionModel, EmbeddingModel};
use crate::pipeline::automation::AutomationEngine;
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::normalizer::{self, GatewayEvent, InboundEvent, WebhookEnvelope};
use crate::pipeline::resolver::{ConversationResolver, IdentityResolver};
use crate::pipeline::retrieval::{RagReply, RetrievalOrchestrator};
use crate::store::Store;
use crate::store::models::{Conversation, DeliveryStatus, NewMessage};

/// Processing stages, used for logging and failure audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Normalized,
    Identified,
    ConversationResolved,
    MessagePersisted,
    AutomationEvaluated,
    Retrieving,
    Responding,
    Dispatched,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Identified => "identified",
            Self::ConversationResolved => "conversation_resolved",
            Self::MessagePersisted => "message_persisted",
            Self::AutomationEvaluated => "automation_evaluated",
            Self::Retrieving => "retrieving",
            Self::Responding => "responding",
            Self::Dispatched => "dispatched",
        }
    }
}

/// Terminal outcome of one webhook event.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    /// Normalization failed; nothing was persisted.
    Dropped { reason: String },
    /// Echo of a bot-sent message; not processed.
    BotEchoIgnored,
    /// A non-message event updated instance state.
    StateSynced,
    /// An automation rule fully handled the event.
    Claimed { rule_id: String },
    /// The RAG fallback produced and dispatched a reply.
    Replied { confidence: f32, sources: usize },
    /// The event ended with a recorded error after the inbound message
    /// was persisted (or while resolving identity/conversation).
    Failed { stage: &'static str, detail: String },
}

/// Owns the lifecycle of a single event's processing.
pub struct PipelineCoordinator {
    store: Arc<dyn Store>,
    identity: IdentityResolver,
    conversations: ConversationResolver,
    automation: AutomationEngine,
    retrieval: RetrievalOrchestrator,
    dispatcher: Arc<Dispatcher>,
    skew_tolerance: Duration,
}

impl PipelineCoordinator {
    /// Wire the coordinator from its injected dependencies.
    pub fn new(
        store: Arc<dyn Store>,
        completion: Arc<dyn CompletionModel>,
        embedding: Arc<dyn EmbeddingModel>,
        gateway: Arc<dyn Gateway>,
        rag: RagConfig,
        llm: &LlmConfig,
        skew_tolerance_secs: i64,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), gateway));
        Self {
            identity: IdentityResolver::new(store.clone()),
            conversations: ConversationResolver::new(store.clone()),
            automation: AutomationEngine::new(store.clone(), dispatcher.clone()),
            retrieval: RetrievalOrchestrator::new(
                store.clone(),
                completion,
                embedding,
                rag,
                llm.temperature,
                llm.max_tokens,
            ),
            dispatcher,
            store,
            skew_tolerance: Duration::seconds(skew_tolerance_secs.max(0)),
        }
    }

    /// Process one webhook envelope to a terminal outcome.
    ///
    /// Never returns an error: every failure is logged, recorded where a
    /// conversation exists, and folded into the outcome.
    pub async fn process(&self, envelope: &WebhookEnvelope) -> EventOutcome {
        let event = match normalizer::normalize(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(event_kind = %envelope.event, error = %e, "Dropping malformed event");
                self.record_error(None, Stage::Normalized, &e.to_string())
                    .await;
                return EventOutcome::Dropped {
                    reason: e.to_string(),
                };
            }
        };

        match event {
            GatewayEvent::Message(message) => self.process_message(message).await,
            GatewayEvent::Status { instance_id, state } => {
                if let Err(e) = self.store.upsert_instance_status(&instance_id, &state).await {
                    warn!(instance_id = %instance_id, error = %e, "Instance status sync failed");
                }
                EventOutcome::StateSynced
            }
            GatewayEvent::Qr { instance_id, code } => {
                if let Err(e) = self.store.set_instance_qr(&instance_id, &code).await {
                    warn!(instance_id = %instance_id, error = %e, "Instance QR sync failed");
                }
                EventOutcome::StateSynced
            }
            GatewayEvent::Disconnect {
                instance_id,
                reason,
            } => {
                info!(
                    instance_id = %instance_id,
                    reason = reason.as_deref().unwrap_or("unknown"),
                    "Instance disconnected"
                );
                if let Err(e) = self
                    .store
                    .upsert_instance_status(&instance_id, "disconnected")
                    .await
                {
                    warn!(instance_id = %instance_id, error = %e, "Instance status sync failed");
                }
                EventOutcome::StateSynced
            }
        }
    }

    /// Run an inbound chat message through the conversation pipeline.
    async fn process_message(&self, event: InboundEvent) -> EventOutcome {
        if event.from_bot {
            debug!(phone = %event.from_phone, "Ignoring bot echo");
            return EventOutcome::BotEchoIgnored;
        }

        info!(
            phone = %event.from_phone,
            instance_id = %event.instance_id,
            kind = event.kind.as_str(),
            "Processing inbound message"
        );

        // Identity
        let contact = match self.identity.resolve(&event).await {
            Ok(contact) => contact,
            Err(e) => return self.fail(None, Stage::Identified, e).await,
        };

        // Conversation
        let conversation = match self.conversations.resolve(&contact).await {
            Ok(conversation) => conversation,
            Err(e) => return self.fail(None, Stage::ConversationResolved, e).await,
        };

        // Persist the inbound message (with the skew clamp)
        let timestamp = self.clamp_timestamp(&conversation, &event);
        let persisted = self
            .store
            .create_message(NewMessage {
                conversation_id: conversation.id.clone(),
                sender_phone: Some(event.from_phone.clone()),
                recipient_phone: event.to_phone.clone(),
                body: event.body.clone(),
                kind: event.kind,
                status: DeliveryStatus::Delivered,
                from_bot: false,
                metadata: provider_metadata(&event),
                timestamp,
            })
            .await;
        if let Err(source) = persisted {
            return self
                .fail(
                    Some(&conversation),
                    Stage::MessagePersisted,
                    PipelineError::Store {
                        stage: "message_persist",
                        source,
                    },
                )
                .await;
        }

        if let Err(e) = self
            .store
            .advance_conversation_last_message(&conversation.id, timestamp)
            .await
        {
            warn!(
                conversation_id = %conversation.id,
                error = %e,
                "Failed to advance last_message_at"
            );
        }

        // Everything below is best-effort: the inbound message is durable.
        let message_count = match self.store.count_messages(&conversation.id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Message count failed, first-message rules will not fire"
                );
                0
            }
        };

        // Automation
        let outcome = match self
            .automation
            .evaluate(&event, &conversation, message_count)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // The engine degrades internally; this is a belt-and-braces
                // path that still falls through to RAG.
                warn!(error = %e, "Automation evaluation errored, falling through to RAG");
                crate::pipeline::automation::ActionOutcome {
                    claimed: false,
                    rule_id: None,
                    action: None,
                }
            }
        };
        if outcome.claimed {
            return EventOutcome::Claimed {
                rule_id: outcome.rule_id.unwrap_or_default(),
            };
        }

        // Retrieval
        let reply = match self.retrieval.respond(&conversation, &event.body).await {
            Ok(reply) => reply,
            Err(e) => return self.fail(Some(&conversation), Stage::Retrieving, e).await,
        };

        // Dispatch
        self.dispatch_reply(&conversation, &event, reply).await
    }

    async fn dispatch_reply(
        &self,
        conversation: &Conversation,
        event: &InboundEvent,
        reply: RagReply,
    ) -> EventOutcome {
        let source_count = reply.sources.len();
        let metadata = serde_json::json!({
            "rag": {
                "confidence": reply.confidence,
                "sources": reply.sources,
            }
        });

        match self
            .dispatcher
            .send(
                conversation,
                &event.instance_id,
                &event.from_phone,
                &reply.answer,
                metadata,
            )
            .await
        {
            Ok(_) => EventOutcome::Replied {
                confidence: reply.confidence,
                sources: source_count,
            },
            Err(e) => self.fail(Some(conversation), Stage::Dispatched, e).await,
        }
    }

    /// Clamp an inbound timestamp so it never precedes the conversation's
    /// `last_message_at` by more than the skew tolerance.
    fn clamp_timestamp(
        &self,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> chrono::DateTime<chrono::Utc> {
        match conversation.last_message_at {
            Some(last) => {
                let floor = last - self.skew_tolerance;
                if event.timestamp < floor {
                    debug!(
                        conversation_id = %conversation.id,
                        event_ts = %event.timestamp,
                        floor = %floor,
                        "Clamping out-of-order message timestamp"
                    );
                    floor
                } else {
                    event.timestamp
                }
            }
            None => event.timestamp,
        }
    }

    /// Terminal failure: log, record for operators, fold into the outcome.
    async fn fail(
        &self,
        conversation: Option<&Conversation>,
        stage: Stage,
        err: PipelineError,
    ) -> EventOutcome {
        error!(stage = stage.as_str(), error = %err, "Pipeline stage failed");
        self.record_error(conversation.map(|c| c.id.as_str()), stage, &err.to_string())
            .await;
        EventOutcome::Failed {
            stage: stage.as_str(),
            detail: err.to_string(),
        }
    }

    async fn record_error(&self, conversation_id: Option<&str>, stage: Stage, detail: &str) {
        if let Err(e) = self
            .store
            .record_pipeline_error(conversation_id, stage.as_str(), detail)
            .await
        {
            warn!(error = %e, "Failed to record pipeline error");
        }
    }
}

fn provider_metadata(event: &InboundEvent) -> serde_json::Value {
    let mut meta = serde_json::Map::new();
    if let Some(id) = &event.provider_message_id {
        meta.insert("provider_message_id".into(), id.clone().into());
    }
    if let Some(name) = &event.sender_name {
        meta.insert("push_name".into(), name.clone().into());
    }
    serde_json::Value::Object(meta)
}
