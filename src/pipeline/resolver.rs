//! Identity and conversation resolution.
//!
//! Both resolvers are safe under concurrent events for the same contact:
//! creation races are resolved by store-level uniqueness (contact phone,
//! open-conversation partial index) plus a re-read, not by locking.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::normalizer::InboundEvent;
use crate::store::Store;
use crate::store::models::{Contact, Conversation, NewContact};

/// Default tag applied to contacts created by this channel.
const CHANNEL_TAG: &str = "whatsapp";

/// Fallback display name: `"Contact " + last4(phone)`.
fn fallback_display_name(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let last4: String = digits
        .iter()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("Contact {last4}")
}

/// Maps a phone number to a durable `Contact`, creating one if absent.
pub struct IdentityResolver {
    store: Arc<dyn Store>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the event's sender to a contact.
    ///
    /// On hit, the presence touch (online + last-seen) is best-effort: a
    /// store error there is logged and swallowed. Only lookup/create
    /// failure is fatal for the event.
    pub async fn resolve(&self, event: &InboundEvent) -> Result<Contact, PipelineError> {
        let existing = self
            .store
            .get_contact_by_phone(&event.from_phone)
            .await
            .map_err(|source| PipelineError::Store {
                stage: "identity_lookup",
                source,
            })?;

        if let Some(contact) = existing {
            if let Err(e) = self
                .store
                .update_contact_presence(&contact.id, true, Utc::now())
                .await
            {
                warn!(
                    contact_id = %contact.id,
                    error = %e,
                    "Presence update failed, continuing"
                );
            }
            return Ok(contact);
        }

        let display_name = event
            .sender_name
            .clone()
            .unwrap_or_else(|| fallback_display_name(&event.from_phone));

        match self
            .store
            .create_contact(NewContact {
                phone: event.from_phone.clone(),
                display_name,
                tags: vec![CHANNEL_TAG.to_string()],
            })
            .await
        {
            Ok(contact) => {
                debug!(contact_id = %contact.id, phone = %contact.phone, "Contact created");
                Ok(contact)
            }
            // A concurrent event created the contact first; use theirs.
            Err(DatabaseError::Constraint(_)) => self
                .store
                .get_contact_by_phone(&event.from_phone)
                .await
                .map_err(|source| PipelineError::Store {
                    stage: "identity_lookup",
                    source,
                })?
                .ok_or(PipelineError::Store {
                    stage: "identity_create",
                    source: DatabaseError::NotFound {
                        entity: "contact".into(),
                        id: event.from_phone.clone(),
                    },
                }),
            Err(source) => Err(PipelineError::Store {
                stage: "identity_create",
                source,
            }),
        }
    }
}

/// Maps a contact to its single open conversation, creating one if absent.
pub struct ConversationResolver {
    store: Arc<dyn Store>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Resolve the contact's open conversation.
    pub async fn resolve(&self, contact: &Contact) -> Result<Conversation, PipelineError> {
        if let Some(conversation) = self
            .store
            .get_open_conversation(&contact.id)
            .await
            .map_err(|source| PipelineError::Store {
                stage: "conversation_lookup",
                source,
            })?
        {
            return Ok(conversation);
        }

        // Conditional insert; the store hands back whichever open row won.
        let conversation = self
            .store
            .create_conversation(&contact.id)
            .await
            .map_err(|source| PipelineError::Store {
                stage: "conversation_create",
                source,
            })?;
        debug!(
            conversation_id = %conversation.id,
            contact_id = %contact.id,
            "Conversation opened"
        );
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use crate::store::models::MessageKind;

    fn event(phone: &str, name: Option<&str>) -> InboundEvent {
        InboundEvent {
            instance_id: "inst-1".into(),
            from_phone: phone.into(),
            to_phone: None,
            body: "oi".into(),
            kind: MessageKind::Text,
            timestamp: Utc::now(),
            provider_message_id: None,
            from_bot: false,
            sender_name: name.map(String::from),
        }
    }

    #[test]
    fn fallback_name_uses_last_four_digits() {
        assert_eq!(fallback_display_name("+5511999990123"), "Contact 0123");
        assert_eq!(fallback_display_name("123"), "Contact 123");
    }

    #[tokio::test]
    async fn unknown_phone_creates_contact_with_channel_tag() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let resolver = IdentityResolver::new(store.clone());

        let contact = resolver
            .resolve(&event("+5511999990000", Some("Maria")))
            .await
            .unwrap();
        assert_eq!(contact.display_name, "Maria");
        assert_eq!(contact.tags, vec!["whatsapp".to_string()]);
        assert!(contact.online);
    }

    #[tokio::test]
    async fn unknown_phone_without_name_gets_suffix_fallback() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let resolver = IdentityResolver::new(store);

        let contact = resolver
            .resolve(&event("+5511999990123", None))
            .await
            .unwrap();
        assert_eq!(contact.display_name, "Contact 0123");
    }

    #[tokio::test]
    async fn repeat_event_reuses_contact() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let resolver = IdentityResolver::new(store.clone());

        let first = resolver.resolve(&event("+5511999990000", None)).await.unwrap();
        let second = resolver
            .resolve(&event("+5511999990000", Some("Renamed")))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        // Display name is set at creation, not rewritten per event
        assert_eq!(second.display_name, first.display_name);
    }

    #[tokio::test]
    async fn conversation_resolver_creates_then_reuses() {
        let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let identity = IdentityResolver::new(store.clone());
        let conversations = ConversationResolver::new(store.clone());

        let contact = identity.resolve(&event("+5511999990000", None)).await.unwrap();
        let conv1 = conversations.resolve(&contact).await.unwrap();
        let conv2 = conversations.resolve(&contact).await.unwrap();
        assert_eq!(conv1.id, conv2.id);
    }
}
