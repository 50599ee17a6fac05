//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! RFC 3339 text with fixed millisecond precision so that SQL string
//! comparison agrees with chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::models::{
    AutomationRule, Contact, Conversation, ConversationStatus, ConversationUpdate,
    DeliveryStatus, KnowledgeEntry, Message, MessageKind, NewContact, NewKnowledgeEntry,
    NewMessage, NewRagQueryLog, NewRule, PipelineErrorRecord, Priority, RagQueryLog, RuleAction,
    Sentiment, Trigger, blob_to_vec, vec_to_blob,
};
use crate::store::traits::Store;

/// libSQL store backend.
///
/// Holds a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: RFC 3339 UTC, fixed millisecond precision.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to a libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Parse a JSON string-array column, tolerating bad data.
fn parse_tags(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn tags_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

/// Map a libsql execute error, surfacing uniqueness violations separately
/// so resolution races can be told apart from real failures.
fn map_exec_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const CONTACT_COLUMNS: &str =
    "id, phone, display_name, avatar_url, online, last_seen_at, tags, notes, created_at, updated_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let online: i64 = row.get(4)?;
    let last_seen_str: Option<String> = row.get(5).ok();
    let tags_str: String = row.get(6)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    Ok(Contact {
        id: row.get(0)?,
        phone: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3).ok(),
        online: online != 0,
        last_seen_at: parse_optional_datetime(&last_seen_str),
        tags: parse_tags(&tags_str),
        notes: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const CONVERSATION_COLUMNS: &str = "id, contact_id, status, priority, tags, summary, sentiment, \
     assigned_agent, last_message_at, created_at, updated_at";

fn row_to_conversation(row: &libsql::Row) -> Result<Conversation, libsql::Error> {
    let status_str: String = row.get(2)?;
    let priority_str: String = row.get(3)?;
    let tags_str: String = row.get(4)?;
    let sentiment_str: Option<String> = row.get(6).ok();
    let last_msg_str: Option<String> = row.get(8).ok();
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(Conversation {
        id: row.get(0)?,
        contact_id: row.get(1)?,
        status: ConversationStatus::parse(&status_str),
        priority: Priority::parse(&priority_str),
        tags: parse_tags(&tags_str),
        summary: row.get(5).ok(),
        sentiment: sentiment_str.as_deref().and_then(Sentiment::parse),
        assigned_agent: row.get(7).ok(),
        last_message_at: parse_optional_datetime(&last_msg_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_phone, recipient_phone, body, kind, \
     status, from_bot, metadata, timestamp, created_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, libsql::Error> {
    let kind_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;
    let from_bot: i64 = row.get(7)?;
    let metadata_str: String = row.get(8)?;
    let ts_str: String = row.get(9)?;
    let created_str: String = row.get(10)?;

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_phone: row.get(2).ok(),
        recipient_phone: row.get(3).ok(),
        body: row.get(4)?,
        kind: MessageKind::parse(&kind_str).unwrap_or(MessageKind::Text),
        status: DeliveryStatus::parse(&status_str),
        from_bot: from_bot != 0,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        timestamp: parse_datetime(&ts_str),
        created_at: parse_datetime(&created_str),
    })
}

const RULE_COLUMNS: &str = "id, name, active, priority, trigger_type, trigger_config, \
     action_type, action_config, created_at, updated_at";

/// Decode a rule row into a typed `AutomationRule`, or a description of
/// why its config is invalid.
fn row_to_rule(row: &libsql::Row) -> Result<Result<AutomationRule, (String, String)>, libsql::Error>
{
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let active: i64 = row.get(2)?;
    let priority: i64 = row.get(3)?;
    let trigger_type: String = row.get(4)?;
    let trigger_config: String = row.get(5)?;
    let action_type: String = row.get(6)?;
    let action_config: String = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;

    let trigger = match Trigger::decode(&trigger_type, &trigger_config) {
        Ok(t) => t,
        Err(e) => return Ok(Err((id, e))),
    };
    let action = match RuleAction::decode(&action_type, &action_config) {
        Ok(a) => a,
        Err(e) => return Ok(Err((id, e))),
    };

    Ok(Ok(AutomationRule {
        id,
        name,
        active: active != 0,
        priority,
        trigger,
        action,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    }))
}

const KNOWLEDGE_COLUMNS: &str =
    "id, title, content, category, tags, embedding, active, created_at, updated_at";

fn row_to_knowledge(row: &libsql::Row) -> Result<KnowledgeEntry, libsql::Error> {
    let tags_str: String = row.get(4)?;
    let embedding_blob: Option<Vec<u8>> = row.get(5).ok();
    let active: i64 = row.get(6)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(KnowledgeEntry {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3).ok(),
        tags: parse_tags(&tags_str),
        embedding: embedding_blob.map(|b| blob_to_vec(&b)),
        active: active != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn get_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ?1"),
                params![phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact_by_phone: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact_by_phone: {e}")))?
        {
            Some(row) => Ok(Some(row_to_contact(&row).map_err(|e| {
                DatabaseError::Serialization(format!("contact row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn create_contact(&self, contact: NewContact) -> Result<Contact, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = fmt_ts(now);

        self.conn()
            .execute(
                "INSERT INTO contacts (id, phone, display_name, online, last_seen_at, tags,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?4, ?4)",
                params![
                    id.clone(),
                    contact.phone.clone(),
                    contact.display_name.clone(),
                    now_str,
                    tags_json(&contact.tags),
                ],
            )
            .await
            .map_err(|e| map_exec_err("create_contact", e))?;

        Ok(Contact {
            id,
            phone: contact.phone,
            display_name: contact.display_name,
            avatar_url: None,
            online: true,
            last_seen_at: Some(now),
            tags: contact.tags,
            notes: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_contact_presence(
        &self,
        contact_id: &str,
        online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE contacts SET online = ?2, last_seen_at = ?3, updated_at = ?3
                 WHERE id = ?1",
                params![contact_id, online as i64, fmt_ts(last_seen_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_contact_presence: {e}")))?;
        Ok(())
    }

    async fn get_open_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE contact_id = ?1 AND status IN ('active', 'pending')
                     ORDER BY updated_at DESC, created_at DESC, id DESC
                     LIMIT 1"
                ),
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_open_conversation: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_open_conversation: {e}")))?
        {
            Some(row) => Ok(Some(row_to_conversation(&row).map_err(|e| {
                DatabaseError::Serialization(format!("conversation row: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn create_conversation(
        &self,
        contact_id: &str,
    ) -> Result<Conversation, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now_str = fmt_ts(Utc::now());

        // The partial unique index on open conversations makes this a
        // conditional insert: a concurrent winner turns ours into a no-op.
        self.conn()
            .execute(
                "INSERT INTO conversations (id, contact_id, status, priority, tags,
                    created_at, updated_at)
                 VALUES (?1, ?2, 'active', 'medium', '[]', ?3, ?3)
                 ON CONFLICT DO NOTHING",
                params![id, contact_id, now_str],
            )
            .await
            .map_err(|e| map_exec_err("create_conversation", e))?;

        self.get_open_conversation(contact_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "conversation".into(),
                id: contact_id.into(),
            })
    }

    async fn update_conversation(
        &self,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let now_str = fmt_ts(Utc::now());

        if let Some(status) = update.status {
            conn.execute(
                "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, status.as_str(), now_str.clone()],
            )
            .await
            .map_err(|e| map_exec_err("update_conversation(status)", e))?;
        }
        if let Some(priority) = update.priority {
            conn.execute(
                "UPDATE conversations SET priority = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, priority.as_str(), now_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation(priority): {e}")))?;
        }
        if let Some(summary) = update.summary {
            conn.execute(
                "UPDATE conversations SET summary = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, summary, now_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation(summary): {e}")))?;
        }
        if let Some(sentiment) = update.sentiment {
            conn.execute(
                "UPDATE conversations SET sentiment = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, sentiment.as_str(), now_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation(sentiment): {e}")))?;
        }
        if let Some(agent) = update.assigned_agent {
            conn.execute(
                "UPDATE conversations SET assigned_agent = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, agent, now_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation(agent): {e}")))?;
        }
        if let Some(tag) = update.add_tag {
            // Read-modify-write; a lost concurrent tag append is acceptable.
            let mut rows = conn
                .query(
                    "SELECT tags FROM conversations WHERE id = ?1",
                    params![conversation_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("update_conversation(tags): {e}")))?;
            let row = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("update_conversation(tags): {e}")))?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: conversation_id.into(),
                })?;
            let tags_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Serialization(format!("tags column: {e}")))?;
            let mut tags = parse_tags(&tags_str);
            if !tags.contains(&tag) {
                tags.push(tag);
                conn.execute(
                    "UPDATE conversations SET tags = ?2, updated_at = ?3 WHERE id = ?1",
                    params![conversation_id, tags_json(&tags), now_str],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("update_conversation(tags): {e}")))?;
            }
        }

        Ok(())
    }

    async fn advance_conversation_last_message(
        &self,
        conversation_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // Monotone: only moves forward. String comparison is safe because
        // fmt_ts produces fixed-width lexicographically ordered text.
        self.conn()
            .execute(
                "UPDATE conversations SET
                    last_message_at = CASE
                        WHEN last_message_at IS NULL OR last_message_at < ?2 THEN ?2
                        ELSE last_message_at
                    END,
                    updated_at = ?3
                 WHERE id = ?1",
                params![conversation_id, fmt_ts(ts), fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| {
                DatabaseError::Query(format!("advance_conversation_last_message: {e}"))
            })?;
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<Message, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let metadata_str = message.metadata.to_string();

        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, sender_phone, recipient_phone,
                    body, kind, status, from_bot, metadata, timestamp, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    id.clone(),
                    message.conversation_id.clone(),
                    opt_text(message.sender_phone.as_deref()),
                    opt_text(message.recipient_phone.as_deref()),
                    message.body.clone(),
                    message.kind.as_str(),
                    message.status.as_str(),
                    message.from_bot as i64,
                    metadata_str,
                    fmt_ts(message.timestamp),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| map_exec_err("create_message", e))?;

        Ok(Message {
            id,
            conversation_id: message.conversation_id,
            sender_phone: message.sender_phone,
            recipient_phone: message.recipient_phone,
            body: message.body,
            kind: message.kind,
            status: message.status,
            from_bot: message.from_bot,
            metadata: message.metadata,
            timestamp: message.timestamp,
            created_at: now,
        })
    }

    async fn count_messages(&self, conversation_id: &str) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_messages: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_messages: {e}")))?
            .ok_or_else(|| DatabaseError::Query("count_messages: empty result".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Serialization(format!("count column: {e}")))?;
        Ok(count.max(0) as u64)
    }

    async fn get_active_rules(&self) -> Result<Vec<AutomationRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM automation_rules
                     WHERE active = 1
                     ORDER BY priority ASC, id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_rules: {e}")))?
        {
            match row_to_rule(&row)
                .map_err(|e| DatabaseError::Serialization(format!("rule row: {e}")))?
            {
                Ok(rule) => rules.push(rule),
                Err((id, reason)) => {
                    warn!(rule_id = %id, reason = %reason, "Skipping rule with invalid config");
                }
            }
        }
        Ok(rules)
    }

    async fn validate_rules(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM automation_rules ORDER BY id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("validate_rules: {e}")))?;

        let mut invalid = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("validate_rules: {e}")))?
        {
            if let Err(pair) = row_to_rule(&row)
                .map_err(|e| DatabaseError::Serialization(format!("rule row: {e}")))?
            {
                invalid.push(pair);
            }
        }
        Ok(invalid)
    }

    async fn create_rule(&self, rule: NewRule) -> Result<AutomationRule, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let (trigger_type, trigger_config) = rule.trigger_parts();
        let (action_type, action_config) = rule.action_parts();

        self.conn()
            .execute(
                "INSERT INTO automation_rules (id, name, active, priority, trigger_type,
                    trigger_config, action_type, action_config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id.clone(),
                    rule.name.clone(),
                    rule.active as i64,
                    rule.priority,
                    trigger_type,
                    trigger_config,
                    action_type,
                    action_config,
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| map_exec_err("create_rule", e))?;

        Ok(AutomationRule {
            id,
            name: rule.name,
            active: rule.active,
            priority: rule.priority,
            trigger: rule.trigger,
            action: rule.action,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_active_knowledge_entries(&self) -> Result<Vec<KnowledgeEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {KNOWLEDGE_COLUMNS} FROM knowledge_entries WHERE active = 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_knowledge_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_knowledge_entries: {e}")))?
        {
            entries.push(
                row_to_knowledge(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("knowledge row: {e}")))?,
            );
        }
        Ok(entries)
    }

    async fn create_knowledge_entry(
        &self,
        entry: NewKnowledgeEntry,
    ) -> Result<KnowledgeEntry, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let embedding_value = match &entry.embedding {
            Some(v) => libsql::Value::Blob(vec_to_blob(v)),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO knowledge_entries (id, title, content, category, tags,
                    embedding, active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.clone(),
                    entry.title.clone(),
                    entry.content.clone(),
                    opt_text(entry.category.as_deref()),
                    tags_json(&entry.tags),
                    embedding_value,
                    entry.active as i64,
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| map_exec_err("create_knowledge_entry", e))?;

        Ok(KnowledgeEntry {
            id,
            title: entry.title,
            content: entry.content,
            category: entry.category,
            tags: entry.tags,
            embedding: entry.embedding,
            active: entry.active,
            created_at: now,
            updated_at: now,
        })
    }

    async fn create_rag_query_log(&self, log: NewRagQueryLog) -> Result<(), DatabaseError> {
        let sources_json = serde_json::to_string(&log.sources)
            .map_err(|e| DatabaseError::Serialization(format!("rag sources: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO rag_query_logs (id, conversation_id, query, answer, sources,
                    latency_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    log.conversation_id,
                    log.query,
                    log.answer,
                    sources_json,
                    log.latency_ms,
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_rag_query_log: {e}")))?;
        Ok(())
    }

    async fn list_rag_query_logs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RagQueryLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, query, answer, sources, latency_ms, created_at
                 FROM rag_query_logs WHERE conversation_id = ?1
                 ORDER BY created_at DESC",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rag_query_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rag_query_logs: {e}")))?
        {
            let sources_str: String = row
                .get(4)
                .map_err(|e| DatabaseError::Serialization(format!("sources column: {e}")))?;
            let created_str: String = row
                .get(6)
                .map_err(|e| DatabaseError::Serialization(format!("created_at column: {e}")))?;
            logs.push(RagQueryLog {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Serialization(format!("id column: {e}")))?,
                conversation_id: row
                    .get(1)
                    .map_err(|e| DatabaseError::Serialization(format!("conversation: {e}")))?,
                query: row
                    .get(2)
                    .map_err(|e| DatabaseError::Serialization(format!("query column: {e}")))?,
                answer: row
                    .get(3)
                    .map_err(|e| DatabaseError::Serialization(format!("answer column: {e}")))?,
                sources: serde_json::from_str(&sources_str).unwrap_or_default(),
                latency_ms: row
                    .get(5)
                    .map_err(|e| DatabaseError::Serialization(format!("latency column: {e}")))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(logs)
    }

    async fn record_pipeline_error(
        &self,
        conversation_id: Option<&str>,
        stage: &str,
        detail: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO pipeline_errors (id, conversation_id, stage, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    opt_text(conversation_id),
                    stage,
                    detail,
                    fmt_ts(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_pipeline_error: {e}")))?;
        Ok(())
    }

    async fn list_pipeline_errors(
        &self,
        limit: usize,
    ) -> Result<Vec<PipelineErrorRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, conversation_id, stage, detail, created_at FROM pipeline_errors
                 ORDER BY created_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pipeline_errors: {e}")))?;

        let mut errors = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pipeline_errors: {e}")))?
        {
            let created_str: String = row
                .get(4)
                .map_err(|e| DatabaseError::Serialization(format!("created_at column: {e}")))?;
            errors.push(PipelineErrorRecord {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Serialization(format!("id column: {e}")))?,
                conversation_id: row.get(1).ok(),
                stage: row
                    .get(2)
                    .map_err(|e| DatabaseError::Serialization(format!("stage column: {e}")))?,
                detail: row
                    .get(3)
                    .map_err(|e| DatabaseError::Serialization(format!("detail column: {e}")))?,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(errors)
    }

    async fn upsert_instance_status(
        &self,
        instance_id: &str,
        status: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO instances (id, status, last_event_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET status = ?2, last_event_at = ?3",
                params![instance_id, status, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_instance_status: {e}")))?;
        Ok(())
    }

    async fn set_instance_qr(&self, instance_id: &str, qr: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO instances (id, status, qr_code, last_event_at)
                 VALUES (?1, 'pairing', ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET qr_code = ?2, last_event_at = ?3",
                params![instance_id, qr, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_instance_qr: {e}")))?;
        Ok(())
    }
}
