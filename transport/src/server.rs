//!
//! async WebSocket server transport (requires a tokio executor).
//!
//! This mirrors the connect/handshake/message lifecycle of a typical
//! tungstenite-based server, but hands the application layer logical
//! [`Frame`]s (after fragment reassembly) instead of raw [`tungstenite::Message`],
//! and negotiates the `Sec-WebSocket-Protocol` subprotocol during the HTTP
//! upgrade so the caller can tell a framework peer from a generic one before
//! the connection handler is even invoked.
//!
use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_tungstenite::{
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    WebSocketStream,
};
use tungstenite::protocol::CloseFrame;

use crate::error::Error;
use crate::frame::Frame;
use crate::result::Result;

pub use tokio::net::TcpListener as Listener;
pub use tungstenite::protocol::WebSocketConfig;

pub type WsSender = SplitSink<WebSocketStream<TcpStream>, tungstenite::Message>;
pub type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Messages accepted on a connection's outbound sink: a logical frame, or a
/// request to send a real WebSocket close frame and terminate the connection.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close(Option<CloseFrame<'static>>),
}

/// Outbound sink retained by the application layer to push frames to a peer
/// from outside the read loop (broadcasts, RPC responses, notifications).
/// Bounded: a full sink applies back-pressure to the sender rather than
/// growing without bound (§5 Resource bounds).
pub type FrameSink = Sender<Outbound>;

/// Default bound on a connection's outbound queue, matching the resource
/// bound given for `payload_queue` (§5): at least 1024 messages in flight.
pub const DEFAULT_SINK_CAPACITY: usize = 1024;

/// What to do with an incoming upgrade request, decided before the
/// WebSocket handshake response is sent.
pub enum AcceptOutcome {
    /// Accept the connection, optionally echoing back a negotiated subprotocol.
    Accept { subprotocol: Option<String> },
    /// Reject the upgrade outright with a plain-text HTTP response.
    Reject { status: u16, body: String },
}

/// Server-side connection lifecycle, implemented by the application layer.
#[async_trait]
pub trait WebSocketHandler
where
    Arc<Self>: Sync,
{
    type Context: Send + Sync;

    /// Called synchronously while processing the HTTP upgrade request, before
    /// any bytes of the WebSocket connection itself exist. `requested_protocols`
    /// is the client's `Sec-WebSocket-Protocol` list, already comma-split.
    fn accept(&self, _peer: &SocketAddr, _requested_protocols: &[String]) -> AcceptOutcome {
        AcceptOutcome::Accept { subprotocol: None }
    }

    /// Called immediately after the upgrade completes. Returning an error
    /// here aborts the connection before `handshake` runs.
    async fn connect(self: &Arc<Self>, _peer: &SocketAddr) -> Result<()> {
        Ok(())
    }

    /// Called once per connection to build the per-connection context, after
    /// the outbound sink channel exists but before any frames are dispatched.
    async fn handshake(
        self: &Arc<Self>,
        peer: &SocketAddr,
        subprotocol: Option<&str>,
        sink: &FrameSink,
    ) -> Result<Self::Context>;

    /// Called for every reassembled logical frame.
    async fn frame(self: &Arc<Self>, ctx: &Self::Context, frame: Frame, sink: &FrameSink) -> Result<()>;

    /// Called once the connection is fully closed, successfully or not.
    async fn disconnect(self: &Arc<Self>, _ctx: Self::Context, _result: Result<()>) {}
}

#[derive(Default)]
struct Counters {
    active_connections: AtomicUsize,
    handshake_failures: AtomicUsize,
}

/// Drives accept/handshake/message dispatch for a single [`WebSocketHandler`]
/// implementation across all inbound connections on a listener.
pub struct WebSocketServer<T>
where
    T: WebSocketHandler + Send + Sync + 'static,
{
    handler: Arc<T>,
    counters: Counters,
    sink_capacity: usize,
    stop_tx: async_channel::Sender<()>,
    stop_rx: async_channel::Receiver<()>,
    done_tx: async_channel::Sender<()>,
    done_rx: async_channel::Receiver<()>,
}

impl<T> WebSocketServer<T>
where
    T: WebSocketHandler + Send + Sync + 'static,
{
    pub fn new(handler: Arc<T>) -> Arc<Self> {
        Self::with_sink_capacity(handler, DEFAULT_SINK_CAPACITY)
    }

    pub fn with_sink_capacity(handler: Arc<T>, sink_capacity: usize) -> Arc<Self> {
        let (stop_tx, stop_rx) = async_channel::bounded(1);
        let (done_tx, done_rx) = async_channel::bounded(1);
        Arc::new(Self { handler, counters: Counters::default(), sink_capacity, stop_tx, stop_rx, done_tx, done_rx })
    }

    pub async fn bind(&self, addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|err| Error::Listen(format!("unable to listen on `{addr}`: {err}")))
    }

    pub async fn listen(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    if let Ok((stream, peer)) = accepted {
                        self.spawn_connection(stream, peer);
                    }
                }
                _ = self.stop_rx.recv() => break,
            }
        }
        let _ = self.done_tx.send(()).await;
        Ok(())
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(err) = server.handle_connection(peer, stream).await {
                match err {
                    Error::WebSocket(tungstenite::Error::ConnectionClosed)
                    | Error::WebSocket(tungstenite::Error::Protocol(_))
                    | Error::AbnormalClose => {}
                    err => log::error!("connection {peer} terminated: {err}"),
                }
            }
            server.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn handle_connection(self: &Arc<Self>, peer: SocketAddr, stream: TcpStream) -> Result<()> {
        let outcome = Arc::new(Mutex::new(None));
        let callback_outcome = outcome.clone();
        let handler_for_cb = self.handler.clone();

        let callback = move |req: &Request, mut response: Response| {
            let requested: Vec<String> = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();

            match handler_for_cb.accept(&peer, &requested) {
                AcceptOutcome::Accept { subprotocol } => {
                    if let Some(proto) = &subprotocol {
                        if let Ok(value) = proto.parse() {
                            response.headers_mut().insert("Sec-WebSocket-Protocol", value);
                        }
                    }
                    *callback_outcome.lock().unwrap() = Some(AcceptOutcome::Accept { subprotocol });
                    Ok(response)
                }
                AcceptOutcome::Reject { status, body } => {
                    *callback_outcome.lock().unwrap() = Some(AcceptOutcome::Reject { status, body: body.clone() });
                    let resp: ErrorResponse = tungstenite::http::Response::builder()
                        .status(status)
                        .body(Some(body))
                        .unwrap_or_else(|_| ErrorResponse::new(Some("rejected".to_string())));
                    Err(resp)
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(stream) => stream,
            Err(err) => {
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                return Err(Error::WebSocket(err));
            }
        };

        let subprotocol = match outcome.lock().unwrap().take() {
            Some(AcceptOutcome::Accept { subprotocol }) => subprotocol,
            _ => None,
        };

        self.handler.connect(&peer).await?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (sink_tx, sink_rx) = tokio::sync::mpsc::channel::<Outbound>(self.sink_capacity);

        let ctx = match self.handler.handshake(&peer, subprotocol.as_deref(), &sink_tx).await {
            Ok(ctx) => ctx,
            Err(err) => {
                self.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                let _ = ws_sender.send(tungstenite::Message::Close(None)).await;
                return Err(err);
            }
        };

        let result = self.connection_task(&ctx, &mut ws_sender, &mut ws_receiver, sink_tx.clone(), sink_rx).await;
        self.handler.disconnect(ctx, result).await;
        Ok(())
    }

    async fn connection_task(
        self: &Arc<Self>,
        ctx: &T::Context,
        ws_sender: &mut WsSender,
        ws_receiver: &mut WsReceiver,
        sink_tx: FrameSink,
        mut sink_rx: Receiver<Outbound>,
    ) -> Result<()> {
        let mut reassembler = crate::frame::Reassembler::new();
        loop {
            tokio::select! {
                outbound = sink_rx.recv() => {
                    match outbound {
                        Some(Outbound::Frame(frame)) => {
                            ws_sender.send(frame.into_message()).await?;
                        }
                        Some(Outbound::Close(close)) => {
                            ws_sender.send(tungstenite::Message::Close(close)).await?;
                            break;
                        }
                        None => break,
                    }
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(tungstenite::Message::Binary(data))) => {
                            let frame = Frame::from_binary(data)?;
                            self.dispatch(ctx, &mut reassembler, frame, ws_sender, &sink_tx).await?;
                        }
                        Some(Ok(tungstenite::Message::Close(frame))) => {
                            ws_sender.send(tungstenite::Message::Close(frame)).await?;
                            break;
                        }
                        Some(Ok(tungstenite::Message::Ping(data))) => {
                            ws_sender.send(tungstenite::Message::Pong(data)).await?;
                        }
                        Some(Ok(tungstenite::Message::Pong(_))) => {}
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(Error::WebSocket(err)),
                        None => return Err(Error::AbnormalClose),
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        self: &Arc<Self>,
        ctx: &T::Context,
        reassembler: &mut crate::frame::Reassembler,
        frame: Frame,
        ws_sender: &mut WsSender,
        sink_tx: &FrameSink,
    ) -> Result<()> {
        use crate::frame::Reassembled;
        match reassembler.feed(frame) {
            Reassembled::Payload(payload) => {
                let frame = Frame::binary(true, payload);
                self.handler.frame(ctx, frame, sink_tx).await
            }
            Reassembled::Pending => Ok(()),
            Reassembled::Close => {
                ws_sender.send(tungstenite::Message::Close(None)).await?;
                Ok(())
            }
        }
    }

    pub fn stop(&self) -> Result<()> {
        self.stop_tx.try_send(()).map_err(|err| Error::Stop(err.to_string()))
    }

    pub async fn join(&self) -> Result<()> {
        self.done_rx.recv().await.map_err(|err| Error::Join(err.to_string()))
    }

    pub async fn stop_and_join(&self) -> Result<()> {
        self.stop()?;
        self.join().await
    }
}
