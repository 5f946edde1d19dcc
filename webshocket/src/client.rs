//!
//! Client Core (§4.7): connect with bounded retry/backoff, a listener task
//! dispatching decoded packets per the rules in §4.7 (RPC response
//! correlation, optional `on_receive` callback, or the default
//! `packet_queue`), and RPC call-ID correlation for `send_rpc`.
use ahash::AHashMap;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;

use webshocket_transport::client::{ClientEvent, ReconnectPolicy, WebSocketClient};
use webshocket_transport::frame::{chunk, DEFAULT_CHUNK_SIZE};

use crate::codec::{BinaryCodec, Codec};
use crate::connection::ConnectionState;
use crate::error::Error;
use crate::id::generate_call_id;
use crate::packet::{ErrorCode, Packet, PacketData, RpcEnvelope, Source};
use crate::result::Result;
use crate::rpc::{PendingCall, DEFAULT_RPC_TIMEOUT};
use crate::server::SUBPROTOCOL;

/// Bounded-retry connect policy (SPEC_FULL.md §6 Configuration surface
/// additions): `max_attempts = None` retries indefinitely (delegated to the
/// transport's own reconnect loop), `Some(n)` gives up after `n` failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: None, retry_interval: Duration::from_secs(2) }
    }
}

/// Client-side configuration surface (§6, SPEC_FULL.md additions).
#[derive(Clone)]
pub struct ClientConfig {
    pub chunk_size: usize,
    pub retry: RetryPolicy,
    pub rpc_timeout: Duration,
    pub packet_qsize: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE, retry: RetryPolicy::default(), rpc_timeout: DEFAULT_RPC_TIMEOUT, packet_qsize: 128 }
    }
}

/// The `on_receive` callback a caller may install in place of the default
/// `packet_queue` (§4.7 Listener task).
#[async_trait]
pub trait OnReceive: Send + Sync {
    async fn call(&self, packet: Packet);
}

pub struct OnReceiveFn<F>(pub F);

#[async_trait]
impl<F, Fut> OnReceive for OnReceiveFn<F>
where
    F: Fn(Packet) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, packet: Packet) {
        (self.0)(packet).await
    }
}

struct Inner {
    transport: Arc<WebSocketClient>,
    inbound_rx: tokio::sync::Mutex<Option<Receiver<ClientEvent>>>,
    state: AtomicU8,
    chunk_size: usize,
    rpc_timeout: Duration,
    on_receive: Option<Arc<dyn OnReceive>>,
    packet_tx: async_channel::Sender<Packet>,
    packet_rx: async_channel::Receiver<Packet>,
    pending: Mutex<AHashMap<String, PendingCall>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Client Core handle (§4.7). Always speaks the binary (FRAMEWORK) codec —
/// the client announces `webshocket.v1` itself, so there is no GENERIC
/// client-side mode to support.
#[derive(Clone)]
pub struct Client(Arc<Inner>);

impl Client {
    pub fn new(url: impl Into<String>, config: ClientConfig) -> Self {
        Self::build(url, config, None)
    }

    pub fn with_on_receive(url: impl Into<String>, config: ClientConfig, on_receive: impl OnReceive + 'static) -> Self {
        Self::build(url, config, Some(Arc::new(on_receive)))
    }

    fn build(url: impl Into<String>, config: ClientConfig, on_receive: Option<Arc<dyn OnReceive>>) -> Self {
        let reconnect = ReconnectPolicy { retry_interval: config.retry.retry_interval, max_retries: config.retry.max_attempts };
        let (transport, inbound_rx) = WebSocketClient::new(url, Some(SUBPROTOCOL.to_string()), reconnect);
        let (packet_tx, packet_rx) = async_channel::bounded(config.packet_qsize);

        Client(Arc::new(Inner {
            transport,
            inbound_rx: tokio::sync::Mutex::new(Some(inbound_rx)),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            chunk_size: config.chunk_size,
            rpc_timeout: config.rpc_timeout,
            on_receive,
            packet_tx,
            packet_rx,
            pending: Mutex::new(AHashMap::new()),
            listener: Mutex::new(None),
        }))
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.0.state.load(Ordering::Acquire))
    }

    fn set_connection_state(&self, state: ConnectionState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// Connects with the configured [`RetryPolicy`] (§4.7 Connect). Resolves
    /// once the first successful upgrade completes, or once the transport's
    /// reconnect loop gives up (only possible when `max_attempts` is
    /// `Some(_)`); from then on reconnection after a drop is handled
    /// automatically by the transport, not by a second call to this method.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.0.inbound_rx.lock().await;
        let mut rx = guard.take().ok_or_else(|| Error::ConnectionFailed("connect() already called".into()))?;
        self.set_connection_state(ConnectionState::Connecting);
        self.0.transport.connect();

        match rx.recv().await {
            Some(ClientEvent::Open) => {
                self.set_connection_state(ConnectionState::Connected);
            }
            _ => {
                self.set_connection_state(ConnectionState::Disconnected);
                return Err(Error::ConnectionFailed("all connection attempts failed".into()));
            }
        }
        drop(guard);

        let client = self.clone();
        let handle = tokio::spawn(async move { client.listen(rx).await });
        *self.0.listener.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// The listener task body (§4.7 Listener task): serializes dispatch per
    /// connection, one packet at a time.
    async fn listen(&self, mut rx: Receiver<ClientEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ClientEvent::Open => self.set_connection_state(ConnectionState::Connected),
                ClientEvent::Close | ClientEvent::Failed => self.set_connection_state(ConnectionState::Disconnected),
                ClientEvent::Frame(frame) => {
                    let packet = BinaryCodec.decode(&frame.payload);
                    self.dispatch(packet).await;
                }
            }
        }
        self.set_connection_state(ConnectionState::Disconnected);
    }

    async fn dispatch(&self, packet: Packet) {
        if packet.source == Source::Rpc {
            if let Some(RpcEnvelope::Response { call_id, .. }) = &packet.rpc {
                if let Some(pending) = self.0.pending.lock().unwrap().remove(call_id) {
                    let _ = pending.responder.send(packet);
                }
                return;
            }
        }

        if let Some(callback) = &self.0.on_receive {
            callback.call(packet).await;
        } else if self.0.packet_tx.send(packet).await.is_err() {
            log::warn!("dropping packet: client packet_queue receiver gone");
        }
    }

    /// Wraps `data` in a `Packet{source=CUSTOM}` and sends it (§4.7 `send`).
    pub fn send(&self, data: impl Into<PacketData>) -> Result<()> {
        self.send_packet(Packet::custom(data.into()))
    }

    fn send_packet(&self, packet: Packet) -> Result<()> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(Error::ConnectionClosed);
        }
        let bytes = BinaryCodec.encode(&packet)?;
        for frame in chunk(&bytes, self.0.chunk_size) {
            self.0.transport.send(frame)?;
        }
        Ok(())
    }

    /// Sends an RPC request and awaits its matching response, correlated by
    /// `call_id`, honouring `rpc_timeout` (§4.5 client-side correlation).
    pub async fn send_rpc(&self, method: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>, raise_on_rate_limit: bool) -> Result<Packet> {
        let call_id = generate_call_id();
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.0.pending.lock().unwrap().insert(call_id.clone(), PendingCall { responder: tx });

        let packet = Packet::rpc_request(method, args, kwargs, call_id.clone());
        if let Err(err) = self.send_packet(packet) {
            self.0.pending.lock().unwrap().remove(&call_id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.0.rpc_timeout, rx).await {
            Ok(Ok(packet)) => packet,
            _ => {
                self.0.pending.lock().unwrap().remove(&call_id);
                return Err(Error::RpcTimeout);
            }
        };

        if raise_on_rate_limit {
            if let Some(RpcEnvelope::Response { error: Some(ErrorCode::RateLimitExceeded), .. }) = &response.rpc {
                return Err(Error::RateLimitExceeded);
            }
        }

        Ok(response)
    }

    /// Blocks until a decoded packet is available or `timeout` elapses
    /// (§4.7). Only meaningful when no `on_receive` callback was installed.
    pub async fn recv(&self, timeout: Duration) -> Result<Packet> {
        match tokio::time::timeout(timeout, self.0.packet_rx.recv()).await {
            Ok(Ok(packet)) => Ok(packet),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::ReceiveTimeout),
        }
    }

    /// Cancels the listener task, disconnects the transport, and marks the
    /// client `CLOSED` (§4.7 Close).
    pub fn close(&self) {
        self.0.transport.disconnect();
        self.set_connection_state(ConnectionState::Closed);
        if let Some(handle) = self.0.listener.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_defaults_to_unbounded_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn send_before_connect_is_not_connected() {
        let client = Client::new("ws://127.0.0.1:1", ClientConfig::default());
        assert!(matches!(client.send("hi"), Err(Error::ConnectionClosed)));
    }
}
