//! Unified `Store` trait — single async interface for all persistence.
//!
//! Every method is a single statement (or a small idempotent pair); no
//! transactions span calls, so the pipeline tolerates partial completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::store::models::{
    AutomationRule, Contact, Conversation, ConversationUpdate, KnowledgeEntry, Message,
    NewContact, NewKnowledgeEntry, NewMessage, NewRagQueryLog, NewRule, PipelineErrorRecord,
    RagQueryLog,
};

/// Backend-agnostic persistence trait for the conversation pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Contacts ────────────────────────────────────────────────────

    /// Look up a contact by phone number.
    async fn get_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Insert a new contact. Returns the stored record.
    async fn create_contact(&self, contact: NewContact) -> Result<Contact, DatabaseError>;

    /// Mark a contact online and bump its last-seen timestamp.
    async fn update_contact_presence(
        &self,
        contact_id: &str,
        online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// The contact's open conversation (`active`/`pending`): most recently
    /// updated first, breaking ties by most recently created.
    async fn get_open_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError>;

    /// Conditionally create an open conversation for the contact.
    ///
    /// A partial unique index on open conversations makes this safe under
    /// concurrent events: the losing insert is a no-op and the caller
    /// re-selects.
    async fn create_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Conversation, DatabaseError>;

    /// Apply a partial update to a conversation.
    async fn update_conversation(
        &self,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> Result<(), DatabaseError>;

    /// Advance `last_message_at` to `ts` if it is newer than the stored
    /// value. Never rewinds.
    async fn advance_conversation_last_message(
        &self,
        conversation_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. Messages are immutable once persisted.
    async fn create_message(&self, message: NewMessage) -> Result<Message, DatabaseError>;

    /// Number of messages in a conversation.
    async fn count_messages(&self, conversation_id: &str) -> Result<u64, DatabaseError>;

    // ── Automation rules ────────────────────────────────────────────

    /// All active rules, ordered `(priority ASC, id ASC)` for deterministic
    /// evaluation. Rows whose config fails to decode are skipped with a
    /// warning (startup validation already surfaced them).
    async fn get_active_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError>;

    /// Decode every rule row (active or not) and return the failures as
    /// `(rule_id, error)` pairs. Run at startup.
    async fn validate_rules(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    /// Insert a rule (tooling and tests; the pipeline only reads rules).
    async fn create_rule(&self, rule: NewRule) -> Result<AutomationRule, DatabaseError>;

    // ── Knowledge base ──────────────────────────────────────────────

    /// All active knowledge entries, embedding included when present.
    async fn get_active_knowledge_entries(&self) -> Result<Vec<KnowledgeEntry>, DatabaseError>;

    /// Insert a knowledge entry (tooling and tests).
    async fn create_knowledge_entry(
        &self,
        entry: NewKnowledgeEntry,
    ) -> Result<KnowledgeEntry, DatabaseError>;

    // ── Audit ───────────────────────────────────────────────────────

    /// Record one retrieval-augmented reply. Write-only for the pipeline.
    async fn create_rag_query_log(&self, log: NewRagQueryLog) -> Result<(), DatabaseError>;

    /// RAG audit rows for a conversation, newest first (operator surface;
    /// never called from the pipeline).
    async fn list_rag_query_logs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RagQueryLog>, DatabaseError>;

    /// Record a pipeline failure for operator visibility.
    async fn record_pipeline_error(
        &self,
        conversation_id: Option<&str>,
        stage: &str,
        detail: &str,
    ) -> Result<(), DatabaseError>;

    /// Recorded pipeline failures, newest first (operator surface).
    async fn list_pipeline_errors(
        &self,
        limit: usize,
    ) -> Result<Vec<PipelineErrorRecord>, DatabaseError>;

    // ── Instance state mirror ───────────────────────────────────────

    /// Upsert the connection status of a gateway instance.
    async fn upsert_instance_status(
        &self,
        instance_id: &str,
        status: &str,
    ) -> Result<(), DatabaseError>;

    /// Store the latest pairing QR code for a gateway instance.
    async fn set_instance_qr(&self, instance_id: &str, qr: &str) -> Result<(), DatabaseError>;
}
