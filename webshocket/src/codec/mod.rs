//!
//! Packet Codec: encodes/decodes the wire envelope, in either the compact
//! binary form (FRAMEWORK peers) or the JSON form (GENERIC peers).
//!
//! The two codecs are kept as separate wire-format modules rather than one
//! shared `#[derive(Serialize, Borsh...)]` record, mirroring how the
//! teacher's `rpc::messages` module defines an independent `borsh` submodule
//! and `serde_json` submodule for the same logical request/response shapes:
//! Borsh has no blanket support for `serde_json::Value`, and the two formats
//! disagree on how the `rpc` tagged union should look on the wire (a
//! discriminant byte vs. a `"request"`/`"response"` string tag), so forcing
//! them through one derive would fight both libraries.
pub mod binary;
pub mod text;

use crate::packet::Packet;
use crate::result::Result;

/// A packet codec bound to one connection for its lifetime, selected once at
/// handshake time from the negotiated subprotocol (§4.2 Selection).
pub trait Codec: Send + Sync {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>>;

    /// Never fails outright: malformed bytes produce `Packet::unknown(bytes)`
    /// rather than an error, per §4.2's decoding contract, so that opaque or
    /// GENERIC traffic still reaches the handler instead of being dropped.
    fn decode(&self, bytes: &[u8]) -> Packet {
        self.try_decode(bytes).unwrap_or_else(|_| Packet::unknown(bytes.to_vec()))
    }

    fn try_decode(&self, bytes: &[u8]) -> Result<Packet>;
}

pub use binary::BinaryCodec;
pub use text::TextCodec;
