//!
//! The wire envelope: [`Packet`], its `source` classification, the RPC
//! sub-envelope, and the error taxonomy carried back to RPC callers.
//!
//! This module defines the domain representation only. Each codec
//! (`codec::binary`, `codec::text`) owns its own wire-format record and the
//! conversions to and from [`Packet`] — see that module's doc comment for why
//! the two are kept separate rather than deriving one shared wire format.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Classifies how a packet entered or should be routed through the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// An application payload sent directly by user code via `Connection::send`.
    Custom,
    /// Fan-out via `HandlerRegistry::broadcast`.
    Broadcast,
    /// Fan-out via `HandlerRegistry::publish` to a named channel.
    Channel,
    /// An RPC request or response.
    Rpc,
    /// Produced locally when decoding failed; `data` carries the raw bytes.
    Unknown,
}

/// The taxonomy of outcomes an RPC invocation can report back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    MethodNotFound,
    InvalidParams,
    AccessDenied,
    RateLimitExceeded,
    ApplicationError,
    InternalServerError,
}

/// Opaque packet payload. `Json` is used for GENERIC (text/JSON) peers whose
/// application payload is itself a JSON value, per the wire envelope's text
/// shape (`data` often *is* the user's own JSON object).
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Text(String),
    Binary(Vec<u8>),
    Json(Value),
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        PacketData::Text(s.to_string())
    }
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        PacketData::Text(s)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        PacketData::Binary(b)
    }
}

impl From<Value> for PacketData {
    fn from(v: Value) -> Self {
        PacketData::Json(v)
    }
}

impl PacketData {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PacketData::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            PacketData::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            PacketData::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// The RPC sub-envelope: a tagged union of a request and a response,
/// distinguished on the wire by an explicit `"request"`/`"response"` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEnvelope {
    Request { method: String, args: Vec<Value>, kwargs: Map<String, Value>, call_id: String },
    Response { call_id: String, response: Option<Value>, error: Option<ErrorCode> },
}

impl RpcEnvelope {
    pub fn call_id(&self) -> &str {
        match self {
            RpcEnvelope::Request { call_id, .. } => call_id,
            RpcEnvelope::Response { call_id, .. } => call_id,
        }
    }
}

/// The single wire record wrapping any payload with routing metadata.
///
/// Invariants enforced by construction: `source == Source::Rpc` iff `rpc` is
/// `Some`; `source == Source::Channel` implies `channel` is non-empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub source: Source,
    pub data: Option<PacketData>,
    pub rpc: Option<RpcEnvelope>,
    pub channel: Option<String>,
    pub timestamp: Option<String>,
    pub correlation_id: Option<String>,
}

impl Packet {
    fn bare(source: Source) -> Self {
        Packet { source, data: None, rpc: None, channel: None, timestamp: None, correlation_id: None }
    }

    pub fn custom(data: PacketData) -> Self {
        Packet { data: Some(data), ..Self::bare(Source::Custom) }
    }

    pub fn broadcast(data: PacketData) -> Self {
        Packet { data: Some(data), ..Self::bare(Source::Broadcast) }
    }

    pub fn channel(channel: impl Into<String>, data: PacketData) -> Self {
        let channel = channel.into();
        assert!(!channel.is_empty(), "channel packets require a non-empty channel name");
        Packet { data: Some(data), channel: Some(channel), ..Self::bare(Source::Channel) }
    }

    pub fn rpc_request(method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>, call_id: impl Into<String>) -> Self {
        Packet {
            rpc: Some(RpcEnvelope::Request { method: method.into(), args, kwargs, call_id: call_id.into() }),
            ..Self::bare(Source::Rpc)
        }
    }

    pub fn rpc_response(call_id: impl Into<String>, response: Option<Value>, error: Option<ErrorCode>) -> Self {
        Packet {
            rpc: Some(RpcEnvelope::Response { call_id: call_id.into(), response, error }),
            ..Self::bare(Source::Rpc)
        }
    }

    /// A packet produced locally when decoding raw bytes failed — delivered
    /// to the handler rather than dropping the frame, per §4.2's decoding
    /// contract.
    pub fn unknown(raw: Vec<u8>) -> Self {
        Packet { data: Some(PacketData::Binary(raw)), ..Self::bare(Source::Unknown) }
    }

    pub fn is_rpc_request(&self) -> bool {
        matches!(self.rpc, Some(RpcEnvelope::Request { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_packet_requires_channel_name() {
        let p = Packet::channel("news.tech", PacketData::Text("hi".into()));
        assert_eq!(p.source, Source::Channel);
        assert_eq!(p.channel.as_deref(), Some("news.tech"));
    }

    #[test]
    #[should_panic]
    fn channel_packet_rejects_empty_name() {
        Packet::channel("", PacketData::Text("hi".into()));
    }

    #[test]
    fn rpc_request_sets_source_rpc() {
        let p = Packet::rpc_request("ping", vec![], Map::new(), "abc");
        assert_eq!(p.source, Source::Rpc);
        assert!(p.is_rpc_request());
    }
}
