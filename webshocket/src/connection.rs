//!
//! Connection (§4.3): per-peer state exposed to handlers and RPC methods.
//!
//! A [`Connection`] is a cheap `Clone`-able handle (an `Arc` underneath) onto
//! the per-peer record owned by the Server Core / Client Core for the
//! connection's lifetime; the Handler Registry only ever holds a copy of the
//! handle in its `clients`/`channels`/`patterns` sets, never the sole owner
//! (Design Notes §9, "Global registry").
use ahash::AHashMap;
use serde_json::Value;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use webshocket_transport::frame::chunk;
use webshocket_transport::server::{FrameSink, Outbound};

use crate::codec::Codec;
use crate::error::Error;
use crate::packet::{Packet, PacketData};
use crate::registry::HandlerRegistry;
use crate::result::Result;

/// Normal WebSocket close (§6 Close codes).
pub const CLOSE_OK: u16 = 1000;

/// Codec classification decided once at upgrade time (§6 Subprotocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    /// Peer announced the `webshocket.v1` subprotocol; uses the binary codec.
    Framework,
    /// Peer announced no subprotocol (or an unrecognized one); uses JSON.
    Generic,
}

/// Lifecycle state of a connection (§3 Connection, §7 error taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnected = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::Closed,
        }
    }
}

/// Outcome of a rate-limit check, evaluated against the per-connection,
/// per-method bucket (§4.5 step 3). Whether exceeding the limit also
/// disconnects the peer is a property of the method's `RateLimit`
/// configuration, not of the check itself — see `rpc::RpcEngine`.
pub(crate) enum RateLimitOutcome {
    Allowed,
    Exceeded,
}

struct Inner {
    id: u64,
    client_type: ClientType,
    remote_address: SocketAddr,
    state: AtomicU8,
    session_state: Mutex<AHashMap<String, Value>>,
    /// Rate-limit buckets, one per RPC method name. Kept out of
    /// `session_state` (unlike the reference implementation, which stores
    /// `{last_called, count}` directly in its dict-typed session state)
    /// since `Instant` has no `serde_json::Value` representation; see
    /// DESIGN.md for the rationale.
    rate_limits: Mutex<AHashMap<String, (Instant, u32)>>,
    registry: Arc<HandlerRegistry>,
    codec: Arc<dyn Codec>,
    sink: FrameSink,
    chunk_size: usize,
    packet_tx: async_channel::Sender<Packet>,
    packet_rx: async_channel::Receiver<Packet>,
}

/// Per-peer connection handle (§3 Connection). Exclusively owned by the
/// Server/Client Core for the life of the socket; every other place that
/// holds one (the registry's `clients`/`channels`/`patterns` sets, RPC
/// method closures, user handler code) holds a non-owning clone.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        client_type: ClientType,
        remote_address: SocketAddr,
        registry: Arc<HandlerRegistry>,
        codec: Arc<dyn Codec>,
        sink: FrameSink,
        chunk_size: usize,
        packet_capacity: usize,
    ) -> Self {
        let (packet_tx, packet_rx) = async_channel::bounded(packet_capacity);
        Connection(Arc::new(Inner {
            id,
            client_type,
            remote_address,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            session_state: Mutex::new(AHashMap::new()),
            rate_limits: Mutex::new(AHashMap::new()),
            registry,
            codec,
            sink,
            chunk_size,
            packet_tx,
            packet_rx,
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn client_type(&self) -> ClientType {
        self.0.client_type
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.0.remote_address
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// Reads a value previously stored in `session_state`.
    pub fn session_get(&self, key: &str) -> Option<Value> {
        self.0.session_state.lock().unwrap().get(key).cloned()
    }

    /// Freely mutable per-connection state (§3), keyed by string.
    pub fn session_set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.session_state.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn session_remove(&self, key: &str) -> Option<Value> {
        self.0.session_state.lock().unwrap().remove(key)
    }

    /// Authoritative channel/pattern membership, always re-derived from the
    /// registry rather than mirrored locally (Design Notes §9).
    pub fn subscribed_channels(&self) -> Vec<String> {
        self.0.registry.subscribed_channels(self)
    }

    pub fn subscribe(&self, channels: impl IntoIterator<Item = impl Into<String>>) {
        self.0.registry.subscribe(self, channels.into_iter().map(Into::into));
    }

    pub fn unsubscribe(&self, channels: impl IntoIterator<Item = impl Into<String>>) {
        self.0.registry.unsubscribe(self, channels.into_iter().map(Into::into));
    }

    /// Wraps `data` in a `Packet{source=CUSTOM}` and queues it for delivery.
    /// Non-blocking: returns `Err(Error::ConnectionClosed)` rather than
    /// stalling the caller when the connection isn't `Connected` or its
    /// outbound queue is momentarily full (§4.3).
    pub fn send(&self, data: impl Into<PacketData>) -> Result<()> {
        self.send_packet(Packet::custom(data.into()))
    }

    /// Sends a pre-built [`Packet`] (used directly by `broadcast`/`publish`
    /// fan-out and by RPC response delivery, as well as by [`Connection::send`]).
    /// Encodes with the peer's negotiated codec and hands the bytes to the
    /// transport's outbound chunker. A full outbound queue surfaces as an
    /// error here rather than blocking — see DESIGN.md for why this and
    /// `broadcast`/`publish` share the non-blocking path while still
    /// honouring the resource bound in §5 (the queue capacity absorbs
    /// ordinary bursts; sustained overflow is treated as back-pressure on
    /// that one connection, not a reason to stall the rest of a fan-out).
    pub(crate) fn send_packet(&self, packet: Packet) -> Result<()> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::ConnectionClosed);
        }
        let bytes = self.0.codec.encode(&packet)?;
        for frame in chunk(&bytes, self.0.chunk_size) {
            self.0.sink.try_send(Outbound::Frame(frame)).map_err(|_| Error::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Decodes a raw inbound payload with this peer's negotiated codec
    /// (§4.2); malformed bytes become `Packet::unknown` rather than an error.
    pub(crate) fn decode(&self, bytes: &[u8]) -> Packet {
        self.0.codec.decode(bytes)
    }

    /// Delivers a packet decoded from the wire into this connection's
    /// `packet_queue`, for later consumption via [`Connection::recv`].
    /// Applies real back-pressure (an awaited bounded put) to the caller —
    /// normally the per-connection read loop — per §5's "bounded queue,
    /// awaited puts" requirement; a slow consumer of `recv()` stalls only
    /// its own connection's read loop, never the rest of the server.
    pub(crate) async fn enqueue_packet(&self, packet: Packet) -> Result<()> {
        self.0.packet_tx.send(packet).await.map_err(|_| Error::ConnectionClosed)
    }

    /// Blocks until a decoded packet is available or `timeout` elapses
    /// (§4.3). Only meaningful for connections using the default
    /// (queueing) handler; a custom handler that consumes packets via
    /// `on_receive` never populates this queue.
    pub async fn recv(&self, timeout: Duration) -> Result<Packet> {
        match tokio::time::timeout(timeout, self.0.packet_rx.recv()).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::ReceiveTimeout),
        }
    }

    /// Transitions to `Closed`, sends a close frame, and lets the
    /// connection's own read loop unwind and run `on_disconnect` (§4.3).
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.set_connection_state(ConnectionState::Closed);
        let close_frame = tungstenite::protocol::CloseFrame { code: code.into(), reason: reason.into().into() };
        let _ = self.0.sink.try_send(Outbound::Close(Some(close_frame)));
    }

    /// Evaluates the fixed-window rate limiter for `method` (§4.5 step 3,
    /// Open Questions in SPEC_FULL.md): resets the window only when
    /// `now - last_called ≥ period`, preserving the boundary quirk
    /// (a call landing exactly on the boundary resets rather than
    /// increments) rather than silently "fixing" it during the port.
    pub(crate) fn check_rate_limit(&self, method: &str, limit: u32, period: Duration) -> RateLimitOutcome {
        let mut buckets = self.0.rate_limits.lock().unwrap();
        let now = Instant::now();
        let (last_called, count) = buckets.entry(method.to_string()).or_insert((now, 0));

        if now.duration_since(*last_called) >= period {
            *last_called = now;
            *count = 0;
        }

        if *count >= limit {
            RateLimitOutcome::Exceeded
        } else {
            *count += 1;
            RateLimitOutcome::Allowed
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.0.id)
            .field("remote_address", &self.0.remote_address)
            .field("client_type", &self.0.client_type)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryCodec;

    fn test_connection() -> Connection {
        let (sink, _rx) = tokio::sync::mpsc::channel(16);
        Connection::new(
            1,
            ClientType::Framework,
            "127.0.0.1:9000".parse().unwrap(),
            HandlerRegistry::new(),
            Arc::new(BinaryCodec),
            sink,
            64 * 1024,
            16,
        )
    }

    #[test]
    fn session_state_roundtrips() {
        let conn = test_connection();
        assert_eq!(conn.session_get("admin"), None);
        conn.session_set("admin", true);
        assert_eq!(conn.session_get("admin"), Some(Value::Bool(true)));
        conn.session_remove("admin");
        assert_eq!(conn.session_get("admin"), None);
    }

    #[test]
    fn send_before_connected_is_not_connected() {
        let conn = test_connection();
        let err = conn.send("hi").unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn send_after_connected_queues_a_frame() {
        let (sink, mut rx) = tokio::sync::mpsc::channel(16);
        let conn = Connection::new(
            1,
            ClientType::Framework,
            "127.0.0.1:9000".parse().unwrap(),
            HandlerRegistry::new(),
            Arc::new(BinaryCodec),
            sink,
            64 * 1024,
            16,
        );
        conn.set_connection_state(ConnectionState::Connected);
        conn.send("hi").unwrap();
        let outbound = rx.recv().await.unwrap();
        assert!(matches!(outbound, Outbound::Frame(_)));
    }

    #[test]
    fn rate_limit_allows_then_exceeds() {
        let conn = test_connection();
        let period = Duration::from_secs(60);
        assert!(matches!(conn.check_rate_limit("ping", 2, period), RateLimitOutcome::Allowed));
        assert!(matches!(conn.check_rate_limit("ping", 2, period), RateLimitOutcome::Allowed));
        assert!(matches!(conn.check_rate_limit("ping", 2, period), RateLimitOutcome::Exceeded));
    }
}
