// Helpers for the JSON command messages exchanged over control channels.

use rand::RngCore;
use serde_json::{json, Value};

use crate::error::{CentralError, Result};

/// Every control message is a JSON object carrying a `cmd` field.
pub type Message = Value;

/// Returns the `cmd` field of a message, or an empty string.
pub fn cmd_of(msg: &Message) -> &str {
    msg.get("cmd").and_then(Value::as_str).unwrap_or("")
}

/// Standard acknowledgement reply.
pub fn ok_reply() -> Message {
    json!({ "message": "ok" })
}

/// In-band error reply.
pub fn error_reply(err: impl std::fmt::Display) -> Message {
    json!({ "error": err.to_string() })
}

/// Converts an in-band `{error: msg}` reply into an error.
pub fn check_response(res: Message) -> Result<Message> {
    match res.get("error") {
        Some(Value::String(msg)) => Err(CentralError::Remote(msg.clone())),
        Some(Value::Null) | None => Ok(res),
        Some(other) => Err(CentralError::Remote(other.to_string())),
    }
}

/// Allocates a new random channel token.
pub fn new_token() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Reads a string field from a message.
pub fn str_field<'a>(msg: &'a Message, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(Value::as_str)
}

/// Reads an id-like field that agents may send either as a string or a number.
pub fn id_field(msg: &Message, key: &str) -> Option<String> {
    match msg.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads an unsigned integer field sent either as a number or a numeric string.
pub fn u64_field(msg: &Message, key: &str) -> Option<u64> {
    match msg.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Builds `{cmd, ...fields}` from a command name and an object of fields.
pub fn command(cmd: &str, fields: Value) -> Message {
    let mut msg = match fields {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    msg.insert("cmd".to_string(), Value::String(cmd.to_string()));
    Value::Object(msg)
}
