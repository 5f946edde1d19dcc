//!
//! Compact tagged binary codec, selected for FRAMEWORK peers (§4.2).
use borsh::{BorshDeserialize, BorshSerialize};

use super::Codec;
use crate::error::Error;
use crate::packet::{ErrorCode, Packet, PacketData, RpcEnvelope, Source};
use crate::result::Result;

#[derive(BorshSerialize, BorshDeserialize)]
enum WireSource {
    Custom,
    Broadcast,
    Channel,
    Rpc,
    Unknown,
}

impl From<Source> for WireSource {
    fn from(s: Source) -> Self {
        match s {
            Source::Custom => WireSource::Custom,
            Source::Broadcast => WireSource::Broadcast,
            Source::Channel => WireSource::Channel,
            Source::Rpc => WireSource::Rpc,
            Source::Unknown => WireSource::Unknown,
        }
    }
}

impl From<WireSource> for Source {
    fn from(s: WireSource) -> Self {
        match s {
            WireSource::Custom => Source::Custom,
            WireSource::Broadcast => Source::Broadcast,
            WireSource::Channel => Source::Channel,
            WireSource::Rpc => Source::Rpc,
            WireSource::Unknown => Source::Unknown,
        }
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
enum WireErrorCode {
    MethodNotFound,
    InvalidParams,
    AccessDenied,
    RateLimitExceeded,
    ApplicationError,
    InternalServerError,
}

impl From<ErrorCode> for WireErrorCode {
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::MethodNotFound => WireErrorCode::MethodNotFound,
            ErrorCode::InvalidParams => WireErrorCode::InvalidParams,
            ErrorCode::AccessDenied => WireErrorCode::AccessDenied,
            ErrorCode::RateLimitExceeded => WireErrorCode::RateLimitExceeded,
            ErrorCode::ApplicationError => WireErrorCode::ApplicationError,
            ErrorCode::InternalServerError => WireErrorCode::InternalServerError,
        }
    }
}

impl From<WireErrorCode> for ErrorCode {
    fn from(e: WireErrorCode) -> Self {
        match e {
            WireErrorCode::MethodNotFound => ErrorCode::MethodNotFound,
            WireErrorCode::InvalidParams => ErrorCode::InvalidParams,
            WireErrorCode::AccessDenied => ErrorCode::AccessDenied,
            WireErrorCode::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            WireErrorCode::ApplicationError => ErrorCode::ApplicationError,
            WireErrorCode::InternalServerError => ErrorCode::InternalServerError,
        }
    }
}

/// `serde_json::Value` has no Borsh impl, so JSON-valued payloads (GENERIC
/// application data passed through on a FRAMEWORK connection, and RPC
/// args/kwargs/response, which are always dynamically typed per §4.5) are
/// carried as their JSON text, nested inside the Borsh record.
#[derive(BorshSerialize, BorshDeserialize)]
enum WireData {
    Text(String),
    Binary(Vec<u8>),
    Json(String),
}

impl TryFrom<&PacketData> for WireData {
    type Error = Error;

    fn try_from(data: &PacketData) -> Result<Self> {
        Ok(match data {
            PacketData::Text(s) => WireData::Text(s.clone()),
            PacketData::Binary(b) => WireData::Binary(b.clone()),
            PacketData::Json(v) => WireData::Json(serde_json::to_string(v)?),
        })
    }
}

impl TryFrom<WireData> for PacketData {
    type Error = Error;

    fn try_from(data: WireData) -> Result<Self> {
        Ok(match data {
            WireData::Text(s) => PacketData::Text(s),
            WireData::Binary(b) => PacketData::Binary(b),
            WireData::Json(s) => PacketData::Json(serde_json::from_str(&s)?),
        })
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
enum WireRpc {
    Request { method: String, args_json: String, kwargs_json: String, call_id: String },
    Response { call_id: String, response_json: Option<String>, error: Option<WireErrorCode> },
}

impl TryFrom<&RpcEnvelope> for WireRpc {
    type Error = Error;

    fn try_from(rpc: &RpcEnvelope) -> Result<Self> {
        Ok(match rpc {
            RpcEnvelope::Request { method, args, kwargs, call_id } => WireRpc::Request {
                method: method.clone(),
                args_json: serde_json::to_string(args)?,
                kwargs_json: serde_json::to_string(kwargs)?,
                call_id: call_id.clone(),
            },
            RpcEnvelope::Response { call_id, response, error } => WireRpc::Response {
                call_id: call_id.clone(),
                response_json: response.as_ref().map(serde_json::to_string).transpose()?,
                error: error.map(Into::into),
            },
        })
    }
}

impl TryFrom<WireRpc> for RpcEnvelope {
    type Error = Error;

    fn try_from(rpc: WireRpc) -> Result<Self> {
        Ok(match rpc {
            WireRpc::Request { method, args_json, kwargs_json, call_id } => RpcEnvelope::Request {
                method,
                args: serde_json::from_str(&args_json)?,
                kwargs: serde_json::from_str(&kwargs_json)?,
                call_id,
            },
            WireRpc::Response { call_id, response_json, error } => RpcEnvelope::Response {
                call_id,
                response: response_json.map(|s| serde_json::from_str(&s)).transpose()?,
                error: error.map(Into::into),
            },
        })
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct WirePacket {
    source: WireSource,
    data: Option<WireData>,
    rpc: Option<WireRpc>,
    channel: Option<String>,
    timestamp: Option<String>,
    correlation_id: Option<String>,
}

impl TryFrom<&Packet> for WirePacket {
    type Error = Error;

    fn try_from(p: &Packet) -> Result<Self> {
        Ok(WirePacket {
            source: p.source.into(),
            data: p.data.as_ref().map(WireData::try_from).transpose()?,
            rpc: p.rpc.as_ref().map(WireRpc::try_from).transpose()?,
            channel: p.channel.clone(),
            timestamp: p.timestamp.clone(),
            correlation_id: p.correlation_id.clone(),
        })
    }
}

impl TryFrom<WirePacket> for Packet {
    type Error = Error;

    fn try_from(w: WirePacket) -> Result<Self> {
        Ok(Packet {
            source: w.source.into(),
            data: w.data.map(PacketData::try_from).transpose()?,
            rpc: w.rpc.map(RpcEnvelope::try_from).transpose()?,
            channel: w.channel,
            timestamp: w.timestamp,
            correlation_id: w.correlation_id,
        })
    }
}

/// Compact binary [`Codec`] used for FRAMEWORK peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        let wire = WirePacket::try_from(packet)?;
        borsh::to_vec(&wire).map_err(|err| Error::Encode(err.to_string()))
    }

    fn try_decode(&self, bytes: &[u8]) -> Result<Packet> {
        let wire: WirePacket = borsh::from_slice(bytes).map_err(|err| Error::Decode(err.to_string()))?;
        Packet::try_from(wire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_custom_text_packet() {
        let codec = BinaryCodec;
        let packet = Packet::custom(PacketData::Text("hello".into()));
        let bytes = codec.encode(&packet).unwrap();
        let decoded = codec.try_decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn round_trips_rpc_request_with_json_args() {
        let codec = BinaryCodec;
        let mut kwargs = serde_json::Map::new();
        kwargs.insert("name".into(), json!("world"));
        let packet = Packet::rpc_request("greet", vec![json!(1), json!("two")], kwargs, "abc-1");
        let bytes = codec.encode(&packet).unwrap();
        let decoded = codec.try_decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn malformed_bytes_decode_to_unknown() {
        let codec = BinaryCodec;
        let packet = codec.decode(&[0xff, 0x00, 0x01]);
        assert_eq!(packet.source, Source::Unknown);
    }
}
