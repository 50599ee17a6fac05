//! Event normalization — raw gateway payloads into canonical events.
//!
//! The bridge posts an envelope of `{ event, instanceId, data }` where
//! `data` is an untyped provider payload. Only `message` events enter the
//! conversation pipeline; `status`/`qr`/`disconnect` become state-sync
//! events. A payload missing `from`/`body`/`type` (or with an unknown
//! `type`) is malformed: logged and dropped, never retried.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::store::models::MessageKind;

/// Raw webhook envelope posted by the bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub event: String,
    #[serde(rename = "instanceId")]
    pub instance_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A canonical inbound chat message.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub instance_id: String,
    pub from_phone: String,
    /// `None` means the bot side of the conversation.
    pub to_phone: Option<String>,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    pub provider_message_id: Option<String>,
    /// Echo of a message the bot itself sent.
    pub from_bot: bool,
    /// Provider-supplied profile name, when present.
    pub sender_name: Option<String>,
}

/// A normalized gateway event.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Enters the conversation pipeline.
    Message(InboundEvent),
    /// Instance connection state changed.
    Status { instance_id: String, state: String },
    /// New pairing QR code.
    Qr { instance_id: String, code: String },
    /// Session dropped.
    Disconnect {
        instance_id: String,
        reason: Option<String>,
    },
}

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9]{6,15}$").expect("phone regex"));

fn str_field(data: &serde_json::Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

/// Parse the envelope into a typed gateway event.
pub fn normalize(envelope: &WebhookEnvelope) -> Result<GatewayEvent, PipelineError> {
    match envelope.event.as_str() {
        "message" => normalize_message(envelope).map(GatewayEvent::Message),
        "status" => Ok(GatewayEvent::Status {
            instance_id: envelope.instance_id.clone(),
            state: str_field(&envelope.data, "state")
                .or_else(|| str_field(&envelope.data, "status"))
                .unwrap_or_else(|| "unknown".to_string()),
        }),
        "qr" => {
            let code = str_field(&envelope.data, "qr")
                .or_else(|| str_field(&envelope.data, "code"))
                .ok_or_else(|| {
                    PipelineError::MalformedEvent("qr event without a code".into())
                })?;
            Ok(GatewayEvent::Qr {
                instance_id: envelope.instance_id.clone(),
                code,
            })
        }
        "disconnect" => Ok(GatewayEvent::Disconnect {
            instance_id: envelope.instance_id.clone(),
            reason: str_field(&envelope.data, "reason"),
        }),
        other => Err(PipelineError::MalformedEvent(format!(
            "unknown event kind '{other}'"
        ))),
    }
}

fn normalize_message(envelope: &WebhookEnvelope) -> Result<InboundEvent, PipelineError> {
    let data = &envelope.data;

    let from_phone = str_field(data, "from")
        .ok_or_else(|| PipelineError::MalformedEvent("message without 'from'".into()))?;
    if !PHONE_RE.is_match(&from_phone) {
        return Err(PipelineError::MalformedEvent(format!(
            "'from' is not a phone number: '{from_phone}'"
        )));
    }

    let body = str_field(data, "body")
        .ok_or_else(|| PipelineError::MalformedEvent("message without 'body'".into()))?;

    let kind_str = str_field(data, "type")
        .ok_or_else(|| PipelineError::MalformedEvent("message without 'type'".into()))?;
    let kind = MessageKind::parse(&kind_str).ok_or_else(|| {
        PipelineError::MalformedEvent(format!("unknown message type '{kind_str}'"))
    })?;

    // The bridge uses a "bot" sentinel when the counterpart is our side
    let to_phone = str_field(data, "to").filter(|t| t != "bot");

    let timestamp = data
        .get("timestamp")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Ok(InboundEvent {
        instance_id: envelope.instance_id.clone(),
        from_phone,
        to_phone,
        body,
        kind,
        timestamp,
        provider_message_id: str_field(data, "id")
            .or_else(|| str_field(data, "messageId")),
        from_bot: data
            .get("fromMe")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        sender_name: str_field(data, "pushName"),
    })
}
