//! Domain records persisted by the store.
//!
//! Rule trigger/action payloads are typed unions decoded from the
//! `*_type` + `*_config` column pairs, so a bad config row is caught at
//! decode time instead of deep inside event handling.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

// ── Contact ─────────────────────────────────────────────────────────

/// A durable contact record, keyed by phone number.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub phone: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub online: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a contact on first inbound event.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub phone: String,
    pub display_name: String,
    pub tags: Vec<String>,
}

// ── Conversation ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Pending,
    Resolved,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "resolved" => Self::Resolved,
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }

    /// Open = still owned by the pipeline (not resolved/archived).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

/// A support conversation. A contact has at most one open conversation
/// at a time, enforced by a partial unique index at the store layer.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub priority: Priority,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub assigned_agent: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update for a conversation. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub status: Option<ConversationStatus>,
    pub priority: Option<Priority>,
    pub add_tag: Option<String>,
    pub summary: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub assigned_agent: Option<String>,
}

// ── Message ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    /// Parse a provider `type` string. Unknown kinds are rejected so the
    /// normalizer can drop the event as malformed.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" => Self::Failed,
            _ => Self::Sent,
        }
    }
}

/// A persisted chat message. Immutable once inserted.
///
/// Direction is encoded in the phone pair: inbound rows have
/// `sender_phone = Some(contact)` and `recipient_phone = None`; bot-origin
/// outbound rows the reverse.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_phone: Option<String>,
    pub recipient_phone: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub from_bot: bool,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_phone: Option<String>,
    pub recipient_phone: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub status: DeliveryStatus,
    pub from_bot: bool,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ── Automation rules ────────────────────────────────────────────────

/// What fires a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Case-insensitive substring match of any keyword against the body.
    Keyword { keywords: Vec<String> },
    /// Matches iff this is the conversation's first message.
    FirstMessage,
    /// Matches the conversation's current sentiment label.
    Sentiment { sentiment: Sentiment },
    /// Matches when the wall clock falls inside `[start, end]` (HH:MM,
    /// wrap-around windows supported).
    Time { start: String, end: String },
}

/// What a matched rule does. Only `SendMessage` produces a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    SendMessage { text: String },
    TransferAgent { agent: String },
    AddTag { tag: String },
    CreateTicket { subject: Option<String> },
}

impl RuleAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendMessage { .. } => "send_message",
            Self::TransferAgent { .. } => "transfer_agent",
            Self::AddTag { .. } => "add_tag",
            Self::CreateTicket { .. } => "create_ticket",
        }
    }
}

/// Parse an `HH:MM` clock string.
pub fn parse_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

#[derive(Deserialize)]
struct KeywordConfig {
    keywords: Vec<String>,
}

#[derive(Deserialize)]
struct SentimentConfig {
    sentiment: String,
}

#[derive(Deserialize)]
struct TimeConfig {
    start: String,
    end: String,
}

#[derive(Deserialize)]
struct SendMessageConfig {
    text: String,
}

#[derive(Deserialize)]
struct TransferAgentConfig {
    agent: String,
}

#[derive(Deserialize)]
struct AddTagConfig {
    tag: String,
}

#[derive(Deserialize, Default)]
struct CreateTicketConfig {
    #[serde(default)]
    subject: Option<String>,
}

impl Trigger {
    /// Decode from the `trigger_type` / `trigger_config` column pair.
    pub fn decode(kind: &str, config: &str) -> std::result::Result<Self, String> {
        match kind {
            "keyword" => {
                let c: KeywordConfig = serde_json::from_str(config)
                    .map_err(|e| format!("keyword config: {e}"))?;
                if c.keywords.is_empty() {
                    return Err("keyword trigger requires at least one keyword".into());
                }
                Ok(Self::Keyword {
                    keywords: c.keywords,
                })
            }
            "first_message" => Ok(Self::FirstMessage),
            "sentiment" => {
                let c: SentimentConfig = serde_json::from_str(config)
                    .map_err(|e| format!("sentiment config: {e}"))?;
                let sentiment = Sentiment::parse(&c.sentiment)
                    .ok_or_else(|| format!("unknown sentiment label '{}'", c.sentiment))?;
                Ok(Self::Sentiment { sentiment })
            }
            "time" => {
                let c: TimeConfig =
                    serde_json::from_str(config).map_err(|e| format!("time config: {e}"))?;
                if parse_clock(&c.start).is_none() || parse_clock(&c.end).is_none() {
                    return Err(format!(
                        "time trigger requires HH:MM bounds, got '{}'..'{}'",
                        c.start, c.end
                    ));
                }
                Ok(Self::Time {
                    start: c.start,
                    end: c.end,
                })
            }
            other => Err(format!("unknown trigger type '{other}'")),
        }
    }
}

impl RuleAction {
    /// Decode from the `action_type` / `action_config` column pair.
    pub fn decode(kind: &str, config: &str) -> std::result::Result<Self, String> {
        match kind {
            "send_message" => {
                let c: SendMessageConfig = serde_json::from_str(config)
                    .map_err(|e| format!("send_message config: {e}"))?;
                if c.text.trim().is_empty() {
                    return Err("send_message action requires non-empty text".into());
                }
                Ok(Self::SendMessage { text: c.text })
            }
            "transfer_agent" => {
                let c: TransferAgentConfig = serde_json::from_str(config)
                    .map_err(|e| format!("transfer_agent config: {e}"))?;
                Ok(Self::TransferAgent { agent: c.agent })
            }
            "add_tag" => {
                let c: AddTagConfig =
                    serde_json::from_str(config).map_err(|e| format!("add_tag config: {e}"))?;
                Ok(Self::AddTag { tag: c.tag })
            }
            "create_ticket" => {
                let c: CreateTicketConfig = serde_json::from_str(config)
                    .map_err(|e| format!("create_ticket config: {e}"))?;
                Ok(Self::CreateTicket { subject: c.subject })
            }
            other => Err(format!("unknown action type '{other}'")),
        }
    }
}

/// An automation rule with decoded trigger/action payloads.
#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Evaluation order: ascending priority, then ascending id.
    pub priority: i64,
    pub trigger: Trigger,
    pub action: RuleAction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a rule (tooling and tests; the pipeline only reads).
#[derive(Debug, Clone)]
pub struct NewRule {
    pub name: String,
    pub active: bool,
    pub priority: i64,
    pub trigger: Trigger,
    pub action: RuleAction,
}

impl NewRule {
    /// Split the typed trigger into its `(type, config)` column pair.
    pub fn trigger_parts(&self) -> (&'static str, String) {
        match &self.trigger {
            Trigger::Keyword { keywords } => (
                "keyword",
                serde_json::json!({ "keywords": keywords }).to_string(),
            ),
            Trigger::FirstMessage => ("first_message", "{}".to_string()),
            Trigger::Sentiment { sentiment } => (
                "sentiment",
                serde_json::json!({ "sentiment": sentiment.as_str() }).to_string(),
            ),
            Trigger::Time { start, end } => (
                "time",
                serde_json::json!({ "start": start, "end": end }).to_string(),
            ),
        }
    }

    /// Split the typed action into its `(type, config)` column pair.
    pub fn action_parts(&self) -> (&'static str, String) {
        match &self.action {
            RuleAction::SendMessage { text } => (
                "send_message",
                serde_json::json!({ "text": text }).to_string(),
            ),
            RuleAction::TransferAgent { agent } => (
                "transfer_agent",
                serde_json::json!({ "agent": agent }).to_string(),
            ),
            RuleAction::AddTag { tag } => {
                ("add_tag", serde_json::json!({ "tag": tag }).to_string())
            }
            RuleAction::CreateTicket { subject } => (
                "create_ticket",
                serde_json::json!({ "subject": subject }).to_string(),
            ),
        }
    }
}

// ── Knowledge base ──────────────────────────────────────────────────

/// A knowledge-base entry. Entries without an embedding are excluded
/// from retrieval.
#[derive(Debug, Clone)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for inserting a knowledge entry (tooling and tests).
#[derive(Debug, Clone)]
pub struct NewKnowledgeEntry {
    pub title: String,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub active: bool,
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ── RAG audit ───────────────────────────────────────────────────────

/// A cited knowledge entry with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagSource {
    pub entry_id: String,
    pub similarity: f32,
}

/// Audit row for one retrieval-augmented reply. Write-only from the
/// pipeline's perspective.
#[derive(Debug, Clone)]
pub struct NewRagQueryLog {
    pub conversation_id: String,
    pub query: String,
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub latency_ms: i64,
}

/// A stored RAG audit row (operator surface).
#[derive(Debug, Clone)]
pub struct RagQueryLog {
    pub id: String,
    pub conversation_id: String,
    pub query: String,
    pub answer: String,
    pub sources: Vec<RagSource>,
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// A stored pipeline failure row (operator surface).
#[derive(Debug, Clone)]
pub struct PipelineErrorRecord {
    pub id: String,
    pub conversation_id: Option<String>,
    pub stage: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}
