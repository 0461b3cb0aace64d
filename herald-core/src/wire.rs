//! JSON wire codec for Herald messages.
//!
//! The body is `{subject, content, headers, metadata}`; uid, timestamp and
//! sender travel inside `headers`. Every non-raw inbound message must carry
//! `herald-version` equal to [`HERALD_SPECIFICATION_VERSION`].

use serde_json::{Map, Value};

use crate::beans::{Message, MessageReceived};
use crate::errors::HeraldError;
use crate::{
    HERALD_SPECIFICATION_VERSION, MESSAGE_HEADER_REPLIES_TO, MESSAGE_HEADER_SENDER_UID,
    MESSAGE_HEADER_UID, MESSAGE_HERALD_VERSION, UNKNOWN_SENDER_UID,
};

const FIELD_SUBJECT: &str = "subject";
const FIELD_CONTENT: &str = "content";
const FIELD_HEADERS: &str = "headers";
const FIELD_METADATA: &str = "metadata";

/// Serialises a message to its wire JSON string.
pub fn to_json(message: &Message) -> String {
    let mut headers = message.headers().clone();
    headers
        .entry(MESSAGE_HERALD_VERSION.to_string())
        .or_insert_with(|| Value::from(HERALD_SPECIFICATION_VERSION));
    let mut body = Map::new();
    body.insert(FIELD_SUBJECT.to_string(), Value::from(message.subject()));
    body.insert(FIELD_CONTENT.to_string(), message.content().clone());
    body.insert(FIELD_HEADERS.to_string(), Value::Object(headers));
    body.insert(
        FIELD_METADATA.to_string(),
        Value::Object(message.metadata().clone()),
    );
    Value::Object(body).to_string()
}

/// Parses a wire JSON string into an inbound message.
///
/// Fails with [`HeraldError::VersionMismatch`] on an unsupported
/// `herald-version` and with [`HeraldError::Malformed`] when uid or subject
/// are missing; callers decide whether to drop or to fall back to a raw
/// message. The transport access and extra hints are set by the caller.
pub fn from_json(raw: &str) -> Result<MessageReceived, HeraldError> {
    let parsed: Value = serde_json::from_str(raw)?;
    let object = parsed
        .as_object()
        .ok_or_else(|| HeraldError::Malformed("message body is not an object".into()))?;

    let headers = object
        .get(FIELD_HEADERS)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let version = headers.get(MESSAGE_HERALD_VERSION).and_then(Value::as_u64);
    if version != Some(HERALD_SPECIFICATION_VERSION) {
        return Err(HeraldError::VersionMismatch { received: version });
    }

    let uid = headers
        .get(MESSAGE_HEADER_UID)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let subject = object
        .get(FIELD_SUBJECT)
        .and_then(Value::as_str)
        .unwrap_or_default();
    if uid.is_empty() || subject.is_empty() {
        return Err(HeraldError::Malformed(
            "message without uid or subject".into(),
        ));
    }

    let content = object.get(FIELD_CONTENT).cloned().unwrap_or(Value::Null);
    let metadata = object
        .get(FIELD_METADATA)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let sender_uid = headers
        .get(MESSAGE_HEADER_SENDER_UID)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SENDER_UID)
        .to_string();
    let reply_to = headers
        .get(MESSAGE_HEADER_REPLIES_TO)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let subject = subject.to_string();
    let message = Message::from_parts(subject, content, headers, metadata);
    Ok(MessageReceived::new(message, sender_uid, reply_to, ""))
}
