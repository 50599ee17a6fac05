//! Automation rule evaluation.
//!
//! Rules run in a stable order (ascending priority, then id) and stop at
//! the first trigger match: one event executes at most one action, so a
//! rule set can never produce duplicate replies. Evaluation is read-only
//! with respect to other rules.
//!
//! A failure anywhere in this stage degrades to the RAG fallback instead
//! of swallowing the user's message.

use std::sync::Arc;

use chrono::NaiveTime;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::pipeline::dispatch::Dispatcher;
use crate::pipeline::normalizer::InboundEvent;
use crate::store::Store;
use crate::store::models::{
    AutomationRule, Conversation, ConversationStatus, ConversationUpdate, Priority, RuleAction,
    Trigger, parse_clock,
};

/// Result of automation evaluation for one event.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    /// True when a rule matched and fully handled the event.
    pub claimed: bool,
    /// The claiming rule, when claimed.
    pub rule_id: Option<String>,
    /// Label of the executed action, when claimed.
    pub action: Option<&'static str>,
}

impl ActionOutcome {
    fn unclaimed() -> Self {
        Self {
            claimed: false,
            rule_id: None,
            action: None,
        }
    }
}

/// Check one trigger against the event/conversation state.
///
/// `now` is the wall-clock time used by `Time` windows, passed in so
/// tests can pin it.
pub fn trigger_matches(
    trigger: &Trigger,
    event: &InboundEvent,
    conversation: &Conversation,
    message_count: u64,
    now: NaiveTime,
) -> bool {
    match trigger {
        Trigger::Keyword { keywords } => {
            let body = event.body.to_lowercase();
            keywords.iter().any(|kw| body.contains(&kw.to_lowercase()))
        }
        Trigger::FirstMessage => message_count == 1,
        Trigger::Sentiment { sentiment } => conversation.sentiment == Some(*sentiment),
        Trigger::Time { start, end } => {
            // Bounds were validated at decode time
            let (Some(start), Some(end)) = (parse_clock(start), parse_clock(end)) else {
                return false;
            };
            if start <= end {
                now >= start && now <= end
            } else {
                // Wrap-around window, e.g. 22:00..06:00
                now >= start || now <= end
            }
        }
    }
}

/// Evaluates active rules against inbound events, first-match-wins.
pub struct AutomationEngine {
    store: Arc<dyn Store>,
    dispatcher: Arc<Dispatcher>,
}

impl AutomationEngine {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Evaluate the event against all active rules.
    ///
    /// `message_count` includes the just-persisted inbound message.
    pub async fn evaluate(
        &self,
        event: &InboundEvent,
        conversation: &Conversation,
        message_count: u64,
    ) -> Result<ActionOutcome, PipelineError> {
        let rules = match self.store.get_active_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Rule fetch failed, falling through to RAG");
                return Ok(ActionOutcome::unclaimed());
            }
        };

        let now = chrono::Utc::now().time();
        for rule in &rules {
            if !trigger_matches(&rule.trigger, event, conversation, message_count, now) {
                continue;
            }

            debug!(
                rule_id = %rule.id,
                rule_name = %rule.name,
                action = rule.action.label(),
                "Rule matched"
            );

            return match self.execute(rule, event, conversation).await {
                Ok(()) => {
                    info!(
                        rule_id = %rule.id,
                        action = rule.action.label(),
                        conversation_id = %conversation.id,
                        "Automation claimed event"
                    );
                    Ok(ActionOutcome {
                        claimed: true,
                        rule_id: Some(rule.id.clone()),
                        action: Some(rule.action.label()),
                    })
                }
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        error = %e,
                        "Rule action failed, falling through to RAG"
                    );
                    Ok(ActionOutcome::unclaimed())
                }
            };
        }

        Ok(ActionOutcome::unclaimed())
    }

    /// Execute exactly one action for a matched rule.
    async fn execute(
        &self,
        rule: &AutomationRule,
        event: &InboundEvent,
        conversation: &Conversation,
    ) -> Result<(), PipelineError> {
        match &rule.action {
            RuleAction::SendMessage { text } => {
                self.dispatcher
                    .send(
                        conversation,
                        &event.instance_id,
                        &event.from_phone,
                        text,
                        serde_json::json!({
                            "rule_id": rule.id,
                            "rule_name": rule.name,
                        }),
                    )
                    .await?;
                Ok(())
            }
            RuleAction::TransferAgent { agent } => self
                .store
                .update_conversation(
                    &conversation.id,
                    ConversationUpdate {
                        assigned_agent: Some(agent.clone()),
                        status: Some(ConversationStatus::Pending),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| PipelineError::Automation(format!("transfer_agent: {e}"))),
            RuleAction::AddTag { tag } => self
                .store
                .update_conversation(
                    &conversation.id,
                    ConversationUpdate {
                        add_tag: Some(tag.clone()),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| PipelineError::Automation(format!("add_tag: {e}"))),
            RuleAction::CreateTicket { subject } => self
                .store
                .update_conversation(
                    &conversation.id,
                    ConversationUpdate {
                        add_tag: Some("ticket".to_string()),
                        priority: Some(Priority::High),
                        summary: subject.clone(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| PipelineError::Automation(format!("create_ticket: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::gateway::Gateway;
    use crate::store::LibSqlStore;
    use crate::store::models::{MessageKind, NewContact, NewRule, Sentiment};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingGateway {
        sends: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Gateway for RecordingGateway {
        async fn send_text(
            &self,
            _instance_id: &str,
            phone: &str,
            text: &str,
        ) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::SendFailed {
                    phone: phone.to_string(),
                    reason: "down".into(),
                });
            }
            self.sends.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        engine: AutomationEngine,
        gateway: Arc<RecordingGateway>,
        conversation: Conversation,
    }

    async fn fixture(fail_gateway: bool) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let gateway = Arc::new(RecordingGateway {
            sends: Mutex::new(Vec::new()),
            fail: fail_gateway,
        });
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), gateway.clone()));
        let engine = AutomationEngine::new(store.clone(), dispatcher);

        let contact = store
            .create_contact(NewContact {
                phone: "+5511999990000".into(),
                display_name: "Maria".into(),
                tags: vec![],
            })
            .await
            .unwrap();
        let conversation = store.create_conversation(&contact.id).await.unwrap();

        Fixture {
            store,
            engine,
            gateway,
            conversation,
        }
    }

    fn event(body: &str) -> InboundEvent {
        InboundEvent {
            instance_id: "inst-1".into(),
            from_phone: "+5511999990000".into(),
            to_phone: None,
            body: body.into(),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
            provider_message_id: None,
            from_bot: false,
            sender_name: None,
        }
    }

    fn conv_with_sentiment(base: &Conversation, sentiment: Sentiment) -> Conversation {
        let mut c = base.clone();
        c.sentiment = Some(sentiment);
        c
    }

    // ── Trigger matching ────────────────────────────────────────────

    #[test]
    fn keyword_match_is_case_insensitive_substring() {
        let now = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let conv = Conversation {
            id: "c".into(),
            contact_id: "x".into(),
            status: ConversationStatus::Active,
            priority: Priority::Medium,
            tags: vec![],
            summary: None,
            sentiment: None,
            assigned_agent: None,
            last_message_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let trigger = Trigger::Keyword {
            keywords: vec!["PREÇO".into(), "horário".into()],
        };

        assert!(trigger_matches(
            &trigger,
            &event("qual o preço do plano?"),
            &conv,
            3,
            now
        ));
        assert!(!trigger_matches(&trigger, &event("olá"), &conv, 3, now));
    }

    #[test]
    fn first_message_matches_only_count_one() {
        let now = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let conv = conv_stub();
        assert!(trigger_matches(
            &Trigger::FirstMessage,
            &event("oi"),
            &conv,
            1,
            now
        ));
        assert!(!trigger_matches(
            &Trigger::FirstMessage,
            &event("oi"),
            &conv,
            2,
            now
        ));
    }

    #[test]
    fn sentiment_matches_conversation_label() {
        let now = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let base = conv_stub();
        let trigger = Trigger::Sentiment {
            sentiment: Sentiment::Negative,
        };
        assert!(!trigger_matches(&trigger, &event("x"), &base, 2, now));
        assert!(trigger_matches(
            &trigger,
            &event("x"),
            &conv_with_sentiment(&base, Sentiment::Negative),
            2,
            now
        ));
    }

    #[test]
    fn time_window_plain_and_wraparound() {
        let conv = conv_stub();
        let business = Trigger::Time {
            start: "09:00".into(),
            end: "18:00".into(),
        };
        let overnight = Trigger::Time {
            start: "22:00".into(),
            end: "06:00".into(),
        };
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let midnight = NaiveTime::from_hms_opt(0, 30, 0).unwrap();

        assert!(trigger_matches(&business, &event("x"), &conv, 2, noon));
        assert!(!trigger_matches(&business, &event("x"), &conv, 2, midnight));
        assert!(!trigger_matches(&overnight, &event("x"), &conv, 2, noon));
        assert!(trigger_matches(&overnight, &event("x"), &conv, 2, midnight));
    }

    fn conv_stub() -> Conversation {
        Conversation {
            id: "c".into(),
            contact_id: "x".into(),
            status: ConversationStatus::Active,
            priority: Priority::Medium,
            tags: vec![],
            summary: None,
            sentiment: None,
            assigned_agent: None,
            last_message_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // ── Engine evaluation ───────────────────────────────────────────

    #[tokio::test]
    async fn no_rules_returns_unclaimed() {
        let f = fixture(false).await;
        let outcome = f
            .engine
            .evaluate(&event("oi"), &f.conversation, 1)
            .await
            .unwrap();
        assert!(!outcome.claimed);
    }

    #[tokio::test]
    async fn first_message_rule_sends_welcome() {
        let f = fixture(false).await;
        f.store
            .create_rule(NewRule {
                name: "welcome".into(),
                active: true,
                priority: 0,
                trigger: Trigger::FirstMessage,
                action: RuleAction::SendMessage {
                    text: "Bem-vindo!".into(),
                },
            })
            .await
            .unwrap();

        let outcome = f
            .engine
            .evaluate(&event("oi"), &f.conversation, 1)
            .await
            .unwrap();
        assert!(outcome.claimed);
        assert_eq!(outcome.action, Some("send_message"));
        assert_eq!(*f.gateway.sends.lock().unwrap(), vec!["Bem-vindo!"]);
    }

    #[tokio::test]
    async fn first_match_wins_in_priority_order() {
        let f = fixture(false).await;
        f.store
            .create_rule(NewRule {
                name: "low-priority".into(),
                active: true,
                priority: 50,
                trigger: Trigger::Keyword {
                    keywords: vec!["oi".into()],
                },
                action: RuleAction::SendMessage {
                    text: "second".into(),
                },
            })
            .await
            .unwrap();
        f.store
            .create_rule(NewRule {
                name: "high-priority".into(),
                active: true,
                priority: 1,
                trigger: Trigger::Keyword {
                    keywords: vec!["oi".into()],
                },
                action: RuleAction::SendMessage {
                    text: "first".into(),
                },
            })
            .await
            .unwrap();

        let outcome = f
            .engine
            .evaluate(&event("oi"), &f.conversation, 2)
            .await
            .unwrap();
        assert!(outcome.claimed);
        // Only the priority-1 rule acted
        assert_eq!(*f.gateway.sends.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn evaluation_is_deterministic() {
        let f = fixture(false).await;
        f.store
            .create_rule(NewRule {
                name: "a".into(),
                active: true,
                priority: 10,
                trigger: Trigger::Keyword {
                    keywords: vec!["ajuda".into()],
                },
                action: RuleAction::AddTag { tag: "help".into() },
            })
            .await
            .unwrap();
        f.store
            .create_rule(NewRule {
                name: "b".into(),
                active: true,
                priority: 10,
                trigger: Trigger::Keyword {
                    keywords: vec!["ajuda".into()],
                },
                action: RuleAction::AddTag { tag: "other".into() },
            })
            .await
            .unwrap();

        let first = f
            .engine
            .evaluate(&event("preciso de ajuda"), &f.conversation, 2)
            .await
            .unwrap();
        for _ in 0..3 {
            let again = f
                .engine
                .evaluate(&event("preciso de ajuda"), &f.conversation, 2)
                .await
                .unwrap();
            assert_eq!(again.rule_id, first.rule_id);
        }
    }

    #[tokio::test]
    async fn transfer_agent_mutates_conversation_without_reply() {
        let f = fixture(false).await;
        f.store
            .create_rule(NewRule {
                name: "handoff".into(),
                active: true,
                priority: 0,
                trigger: Trigger::Keyword {
                    keywords: vec!["humano".into()],
                },
                action: RuleAction::TransferAgent {
                    agent: "ana".into(),
                },
            })
            .await
            .unwrap();

        let outcome = f
            .engine
            .evaluate(&event("quero falar com um humano"), &f.conversation, 2)
            .await
            .unwrap();
        assert!(outcome.claimed);
        assert!(f.gateway.sends.lock().unwrap().is_empty());

        let conv = f
            .store
            .get_open_conversation(&f.conversation.contact_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conv.assigned_agent.as_deref(), Some("ana"));
        assert_eq!(conv.status, ConversationStatus::Pending);
    }

    #[tokio::test]
    async fn create_ticket_tags_and_raises_priority() {
        let f = fixture(false).await;
        f.store
            .create_rule(NewRule {
                name: "ticket".into(),
                active: true,
                priority: 0,
                trigger: Trigger::Keyword {
                    keywords: vec!["reclamação".into()],
                },
                action: RuleAction::CreateTicket {
                    subject: Some("Reclamação".into()),
                },
            })
            .await
            .unwrap();

        let outcome = f
            .engine
            .evaluate(&event("quero abrir uma reclamação"), &f.conversation, 2)
            .await
            .unwrap();
        assert!(outcome.claimed);

        let conv = f
            .store
            .get_open_conversation(&f.conversation.contact_id)
            .await
            .unwrap()
            .unwrap();
        assert!(conv.tags.contains(&"ticket".to_string()));
        assert_eq!(conv.priority, Priority::High);
        assert_eq!(conv.summary.as_deref(), Some("Reclamação"));
    }

    #[tokio::test]
    async fn action_failure_degrades_to_unclaimed() {
        let f = fixture(true).await;
        f.store
            .create_rule(NewRule {
                name: "welcome".into(),
                active: true,
                priority: 0,
                trigger: Trigger::FirstMessage,
                action: RuleAction::SendMessage {
                    text: "Bem-vindo!".into(),
                },
            })
            .await
            .unwrap();

        let outcome = f
            .engine
            .evaluate(&event("oi"), &f.conversation, 1)
            .await
            .unwrap();
        // The gateway is down: the rule matched but could not act, so the
        // event falls through to RAG instead of being dropped.
        assert!(!outcome.claimed);
    }
}
