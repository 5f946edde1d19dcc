//!
//! async WebSocket client transport with automatic reconnect.
//!
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::Error;
use crate::frame::{Frame, Reassembled, Reassembler};
use crate::result::Result;

pub type WsSender = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, tungstenite::Message>;
pub type WsReceiver = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Message delivered up to the application from the client dispatcher loop.
#[derive(Debug)]
pub enum ClientEvent {
    Open,
    Frame(Frame),
    Close,
    /// The reconnect loop gave up after exhausting `ReconnectPolicy::max_retries`.
    /// No further `ClientEvent`s will follow.
    Failed,
}

/// Reconnection policy, matching the exponential-backoff-with-jitter formula
/// used by the reference client: `delay = retry_interval * 2^attempt + U(0,1)`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub retry_interval: Duration,
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { retry_interval: Duration::from_secs(1), max_retries: None }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.retry_interval.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(base + jitter)
    }
}

/// Thin async WebSocket client transport: connects (with retry), exposes a
/// channel of reassembled [`Frame`]s, and accepts outbound frames to send.
pub struct WebSocketClient {
    url: String,
    subprotocol: Option<String>,
    reconnect: ReconnectPolicy,
    is_open: Arc<AtomicBool>,
    outbound_tx: UnboundedSender<Frame>,
    outbound_rx: tokio::sync::Mutex<Option<UnboundedReceiver<Frame>>>,
    inbound_tx: Sender<ClientEvent>,
    shutdown_tx: async_channel::Sender<()>,
    shutdown_rx: async_channel::Receiver<()>,
}

impl WebSocketClient {
    pub fn new(
        url: impl Into<String>,
        subprotocol: Option<String>,
        reconnect: ReconnectPolicy,
    ) -> (Arc<Self>, Receiver<ClientEvent>) {
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::unbounded_channel();
        // Matches the client-side `frame_queue` bound (§5): 64 reassembled
        // frames may be outstanding before the dispatcher applies back-pressure.
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = async_channel::bounded(1);
        let client = Arc::new(Self {
            url: url.into(),
            subprotocol,
            reconnect,
            is_open: Arc::new(AtomicBool::new(false)),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(Some(outbound_rx)),
            inbound_tx,
            shutdown_tx,
            shutdown_rx,
        });
        (client, inbound_rx)
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Relaxed)
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        self.outbound_tx.send(frame).map_err(|_| Error::DispatchClosed)
    }

    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Spawns the connect/reconnect loop. Returns immediately; connection
    /// progress is reported via [`ClientEvent`]s on the receiver returned by
    /// [`WebSocketClient::new`].
    pub fn connect(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            client.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempt = 0u32;
        loop {
            if let Some(max) = self.reconnect.max_retries {
                if attempt > max {
                    // Exhausted: signal the waiter (`connect()`'s `rx.recv()`)
                    // rather than just stopping silently, or it would block
                    // forever waiting for an `Open` that will never arrive.
                    let _ = self.inbound_tx.send(ClientEvent::Failed).await;
                    break;
                }
            }

            match self.connect_once().await {
                Ok(()) => {
                    attempt = 0;
                }
                Err(err) => {
                    log::warn!("connection to {} failed: {err}", self.url);
                }
            }

            if self.shutdown_rx.try_recv().is_ok() {
                break;
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt += 1;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown_rx.recv() => break,
            }
        }
    }

    async fn connect_once(self: &Arc<Self>) -> Result<()> {
        let mut request = tungstenite::client::IntoClientRequest::into_client_request(self.url.as_str())
            .map_err(|err| Error::Connect(err.to_string()))?;
        if let Some(proto) = &self.subprotocol {
            if let Ok(value) = proto.parse() {
                request.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| Error::Connect(err.to_string()))?;

        self.is_open.store(true, Ordering::Relaxed);
        let _ = self.inbound_tx.send(ClientEvent::Open).await;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut outbound_rx = self.outbound_rx.lock().await.take().expect("single dispatcher");
        let result = self.dispatch(&mut ws_sender, &mut ws_receiver, &mut outbound_rx).await;
        *self.outbound_rx.lock().await = Some(outbound_rx);

        self.is_open.store(false, Ordering::Relaxed);
        let _ = self.inbound_tx.send(ClientEvent::Close).await;
        result
    }

    async fn dispatch(
        self: &Arc<Self>,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        outbound_rx: &mut UnboundedReceiver<Frame>,
    ) -> Result<()> {
        let mut reassembler = Reassembler::new();
        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    let _ = ws_sender.send(tungstenite::Message::Close(None)).await;
                    return Ok(());
                }
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => { ws_sender.send(frame.into_message()).await?; }
                        None => return Ok(()),
                    }
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(tungstenite::Message::Binary(data))) => {
                            let frame = Frame::from_binary(data)?;
                            match reassembler.feed(frame) {
                                Reassembled::Payload(payload) => {
                                    let _ = self.inbound_tx.send(ClientEvent::Frame(Frame::binary(true, payload))).await;
                                }
                                Reassembled::Pending => {}
                                Reassembled::Close => return Ok(()),
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(_))) => return Ok(()),
                        Some(Ok(tungstenite::Message::Ping(data))) => {
                            ws_sender.send(tungstenite::Message::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(Error::WebSocket(err)),
                        None => return Err(Error::AbnormalClose),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exhausting `max_retries` against an address nothing listens on must
    /// emit a terminal `ClientEvent::Failed` rather than leaving the
    /// dispatcher loop's receiver hanging forever.
    #[tokio::test]
    async fn exhausted_retries_emit_failed_event() {
        let reconnect = ReconnectPolicy { retry_interval: Duration::from_millis(1), max_retries: Some(0) };
        let (client, mut events) = WebSocketClient::new("ws://127.0.0.1:1", None, reconnect);
        client.connect();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("reconnect loop never gave up")
            .expect("inbound channel closed instead of yielding Failed");
        assert!(matches!(event, ClientEvent::Failed), "expected ClientEvent::Failed, got {event:?}");
    }
}
