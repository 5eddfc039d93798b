use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PacketError;

pub const BROADCAST: &str = "broadcast";
pub const MAX_TTL: u32 = 64;
pub const MAX_HEADERS: usize = 8;
const DEFAULT_TTL: u32 = 8;
const DEFAULT_PROTO: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    Hello,
    Info,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(rename = "type")]
    pub kind: PacketKind,
    pub from: String,
    pub to: String,
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "uuid_msg_id")]
    pub msg_id: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

fn default_proto() -> String {
    DEFAULT_PROTO.to_string()
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

fn uuid_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_unix() -> f64 {
    crate::clock::now()
}

/// Accepts either a bare list of hops or the legacy `{"path": [...]}` wrapper.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(normalize_headers(&raw))
}

fn normalize_headers(raw: &Value) -> Vec<String> {
    let list = match raw {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("path")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let mut headers: Vec<String> = list
        .into_iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect();
    trim_headers(&mut headers);
    headers
}

fn trim_headers(headers: &mut Vec<String>) {
    if headers.len() > MAX_HEADERS {
        let drop = headers.len() - MAX_HEADERS;
        headers.drain(0..drop);
    }
}

fn clamp_ttl(ttl: u32) -> u32 {
    ttl.min(MAX_TTL)
}

impl Packet {
    pub fn new_hello(from: impl Into<String>) -> Self {
        Packet {
            proto: default_proto(),
            kind: PacketKind::Hello,
            from: from.into(),
            to: BROADCAST.to_string(),
            ttl: clamp_ttl(default_ttl()),
            headers: Vec::new(),
            payload: Value::Null,
            msg_id: uuid_msg_id(),
            timestamp: now_unix(),
            trace_id: None,
        }
    }

    pub fn new_info(from: impl Into<String>, view: impl Serialize) -> Self {
        Packet {
            proto: default_proto(),
            kind: PacketKind::Info,
            from: from.into(),
            to: BROADCAST.to_string(),
            ttl: clamp_ttl(default_ttl()),
            headers: Vec::new(),
            payload: serde_json::to_value(view).unwrap_or(Value::Null),
            msg_id: uuid_msg_id(),
            timestamp: now_unix(),
            trace_id: None,
        }
    }

    pub fn new_message(from: impl Into<String>, to: impl Into<String>, body: impl Serialize) -> Self {
        Packet {
            proto: default_proto(),
            kind: PacketKind::Message,
            from: from.into(),
            to: to.into(),
            ttl: clamp_ttl(default_ttl()),
            headers: Vec::new(),
            payload: serde_json::to_value(body).unwrap_or(Value::Null),
            msg_id: uuid_msg_id(),
            timestamp: now_unix(),
            trace_id: None,
        }
    }

    pub fn with_decremented_ttl(&self) -> Self {
        let mut next = self.clone();
        next.ttl = next.ttl.saturating_sub(1);
        next.ttl = clamp_ttl(next.ttl);
        next
    }

    pub fn with_appended_hop(&self, who: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.headers.push(who.into());
        trim_headers(&mut next.headers);
        next
    }

    pub fn seen_cycle(&self, who: &str) -> bool {
        self.headers.iter().any(|hop| hop == who)
    }

    /// The node we should not relay back to: the last hop in the trail, or
    /// the originator itself if this packet hasn't been relayed yet.
    pub fn previous_hop(&self) -> &str {
        self.headers.last().map(String::as_str).unwrap_or(&self.from)
    }

    fn validate(&self) -> Result<(), PacketError> {
        if self.ttl > MAX_TTL {
            return Err(PacketError::SchemaViolation(format!(
                "ttl must be in [0, {MAX_TTL}], got {}",
                self.ttl
            )));
        }
        if self.kind == PacketKind::Hello && self.to != BROADCAST {
            return Err(PacketError::SchemaViolation(
                "hello packets must be addressed to broadcast".to_string(),
            ));
        }
        if self.kind == PacketKind::Message && self.to.eq_ignore_ascii_case(BROADCAST) {
            return Err(PacketError::SchemaViolation(
                "message packets must not be addressed to broadcast".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct PacketFactory;

impl PacketFactory {
    /// Parses a raw wire payload into a validated [`Packet`].
    ///
    /// Callers are expected to have already run compatibility coercion
    /// (channel-name normalization, hello broadcast-forcing, legacy
    /// message-as-info rewriting) before calling this.
    pub fn parse(raw: &[u8]) -> Result<Packet, PacketError> {
        let mut value: Value = serde_json::from_slice(raw)?;
        if let Value::Object(obj) = &mut value {
            if let Some(to) = obj.get("to").and_then(Value::as_str) {
                if to.eq_ignore_ascii_case(BROADCAST) {
                    obj.insert("to".to_string(), Value::String(BROADCAST.to_string()));
                }
            }
        }
        let packet: Packet = serde_json::from_value(value)?;
        packet.validate()?;
        Ok(packet)
    }

    pub fn encode(packet: &Packet) -> Result<Vec<u8>, PacketError> {
        Ok(serde_json::to_vec(packet)?)
    }
}
