//! Fail-closed normalization of fetched payload shapes.
//!
//! The server nests its lists inconsistently: a conversations response may
//! arrive bare, under `conversations`, or under `data`; a message page may
//! arrive bare, under `messages`, or under `data`. Normalization happens
//! exactly once, here, and anything unrecognizable is rejected rather than
//! guessed at.

use serde::de::DeserializeOwned;
use serde_json::Value;

use parley_shared::models::{Conversation, Message};

use crate::error::{Result, StoreError};

/// Extract the array from `payload`, either bare or nested under one of
/// `keys` (checked in order).
fn extract_array<'a>(payload: &'a Value, keys: &[&str]) -> Result<&'a Vec<Value>> {
    if let Value::Array(list) = payload {
        return Ok(list);
    }
    if let Value::Object(map) = payload {
        for key in keys {
            if let Some(Value::Array(list)) = map.get(*key) {
                return Ok(list);
            }
        }
    }
    Err(StoreError::Malformed(format!(
        "expected an array, bare or under one of {keys:?}"
    )))
}

fn decode_list<T: DeserializeOwned>(list: &[Value], what: &str) -> Result<Vec<T>> {
    list.iter()
        .map(|item| {
            serde_json::from_value(item.clone())
                .map_err(|e| StoreError::Malformed(format!("bad {what} entry: {e}")))
        })
        .collect()
}

/// Normalize a conversations-list payload.
pub fn extract_conversations(payload: &Value) -> Result<Vec<Conversation>> {
    let list = extract_array(payload, &["conversations", "data"])?;
    decode_list(list, "conversation")
}

/// Normalize a message-page payload.
pub fn extract_messages(payload: &Value) -> Result<Vec<Message>> {
    let list = extract_array(payload, &["messages", "data"])?;
    decode_list(list, "message")
}

/// Normalize a single-conversation payload (bare or under `data`).
pub fn extract_conversation(payload: &Value) -> Result<Conversation> {
    let candidate = match payload {
        Value::Object(map) if map.contains_key("data") => &map["data"],
        other => other,
    };
    serde_json::from_value(candidate.clone())
        .map_err(|e| StoreError::Malformed(format!("bad conversation entry: {e}")))
}
