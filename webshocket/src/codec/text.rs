//!
//! JSON codec, selected for GENERIC peers (§4.2). Field names on the wire
//! match the envelope 1:1 (§6 Wire envelope (text)).
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Codec;
use crate::error::Error;
use crate::packet::{ErrorCode, Packet, PacketData, RpcEnvelope, Source};
use crate::result::Result;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

#[derive(Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
enum WireRpc {
    Request { method: String, args: Vec<Value>, kwargs: serde_json::Map<String, Value>, call_id: String },
    Response {
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorCode>,
    },
}

impl From<&RpcEnvelope> for WireRpc {
    fn from(rpc: &RpcEnvelope) -> Self {
        match rpc {
            RpcEnvelope::Request { method, args, kwargs, call_id } => {
                WireRpc::Request { method: method.clone(), args: args.clone(), kwargs: kwargs.clone(), call_id: call_id.clone() }
            }
            RpcEnvelope::Response { call_id, response, error } => {
                WireRpc::Response { call_id: call_id.clone(), response: response.clone(), error: *error }
            }
        }
    }
}

impl From<WireRpc> for RpcEnvelope {
    fn from(rpc: WireRpc) -> Self {
        match rpc {
            WireRpc::Request { method, args, kwargs, call_id } => RpcEnvelope::Request { method, args, kwargs, call_id },
            WireRpc::Response { call_id, response, error } => RpcEnvelope::Response { call_id, response, error },
        }
    }
}

/// On-the-wire JSON record. `data` is left as a raw [`Value`] so a GENERIC
/// peer's own JSON object can be round-tripped without the framework
/// needing to understand its shape.
#[derive(Serialize, Deserialize)]
struct WirePacket {
    source: WireSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rpc: Option<WireRpc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

fn data_to_value(data: &PacketData) -> Value {
    match data {
        PacketData::Text(s) => Value::String(s.clone()),
        PacketData::Binary(b) => serde_json::to_value(b).unwrap_or(Value::Null),
        PacketData::Json(v) => v.clone(),
    }
}

fn value_to_data(value: Value) -> PacketData {
    match value {
        Value::String(s) => PacketData::Text(s),
        other => PacketData::Json(other),
    }
}

impl From<&Packet> for WirePacket {
    fn from(p: &Packet) -> Self {
        WirePacket {
            source: p.source.into(),
            data: p.data.as_ref().map(data_to_value),
            rpc: p.rpc.as_ref().map(Into::into),
            channel: p.channel.clone(),
            timestamp: p.timestamp.clone(),
            correlation_id: p.correlation_id.clone(),
        }
    }
}

impl From<WirePacket> for Packet {
    fn from(w: WirePacket) -> Self {
        Packet {
            source: w.source.into(),
            data: w.data.map(value_to_data),
            rpc: w.rpc.map(Into::into),
            channel: w.channel,
            timestamp: w.timestamp,
            correlation_id: w.correlation_id,
        }
    }
}

/// JSON [`Codec`] used for GENERIC peers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        let wire = WirePacket::from(packet);
        serde_json::to_vec(&wire).map_err(|err| Error::Encode(err.to_string()))
    }

    fn try_decode(&self, bytes: &[u8]) -> Result<Packet> {
        let wire: WirePacket = serde_json::from_slice(bytes)?;
        Ok(Packet::from(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_channel_packet() {
        let codec = TextCodec;
        let packet = Packet::channel("news.tech", PacketData::Text("X".into()));
        let bytes = codec.encode(&packet).unwrap();
        let decoded = codec.try_decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn malformed_json_decodes_to_unknown() {
        let codec = TextCodec;
        let packet = codec.decode(b"not json");
        assert_eq!(packet.source, Source::Unknown);
    }

    #[test]
    fn unparseable_json_value_surfaces_as_unknown_with_raw_bytes() {
        let codec = TextCodec;
        let raw = b"{\"source\": \"not-a-real-source\"}";
        let packet = codec.decode(raw);
        assert_eq!(packet.source, Source::Unknown);
        assert_eq!(packet.data.unwrap().as_binary(), Some(&raw[..]));
    }
}
