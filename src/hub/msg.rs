use serde::Deserialize;
use serde_json::{from_str, from_value, json, Value};

/// Terminates every JSON record on the wire.
pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const INVOCATION: u64 = 1;
pub const PING: u64 = 6;
pub const CLOSE: u64 = 7;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid hub message")]
    InvalidMessage,
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Ping,
    Close(Close),
    Other(u64),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default)]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Close {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub allow_reconnect: bool,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

pub fn records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
}

pub fn parse(record: &str) -> Result<HubMessage> {
    let value: Value = from_str(record)?;
    match value.get("type").and_then(Value::as_u64) {
        Some(INVOCATION) => Ok(HubMessage::Invocation(from_value(value)?)),
        Some(PING) => Ok(HubMessage::Ping),
        Some(CLOSE) => Ok(HubMessage::Close(from_value(value)?)),
        Some(other) => Ok(HubMessage::Other(other)),
        None => Err(Error::InvalidMessage),
    }
}

pub fn handshake_request() -> String {
    format!(
        "{}{RECORD_SEPARATOR}",
        json!({"protocol": "json", "version": 1})
    )
}

/// Returns the server's rejection reason, if it sent one.
pub fn parse_handshake(record: &str) -> Result<Option<String>> {
    let response: HandshakeResponse = from_str(record)?;
    Ok(response.error)
}

pub fn ping() -> String {
    format!("{}{RECORD_SEPARATOR}", json!({"type": PING}))
}
