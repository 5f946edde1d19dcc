//!
//! Server Core (§4.6): binds a listener, negotiates the subprotocol at
//! upgrade time (rejecting outright when at `max_connection`), drives the
//! per-connection read loop, and dispatches decoded packets to the RPC
//! engine or to the installed [`Handler`].
use async_trait::async_trait;
use std::any::TypeId;
use std::net::SocketAddr;
use std::sync::Arc;

use webshocket_transport::frame::{Frame, DEFAULT_CHUNK_SIZE};
use webshocket_transport::server::{AcceptOutcome, FrameSink, WebSocketHandler, WebSocketServer};

use crate::codec::{BinaryCodec, Codec, TextCodec};
use crate::connection::{ClientType, Connection, ConnectionState};
use crate::error::Error;
use crate::handler::{DefaultHandler, Handler};
use crate::id::next_connection_id;
use crate::packet::{Packet, RpcEnvelope, Source};
use crate::registry::HandlerRegistry;
use crate::result::Result;
use crate::rpc::RpcEngine;

/// The `Sec-WebSocket-Protocol` token that classifies a peer as FRAMEWORK
/// and selects the binary codec (§6 Subprotocol).
pub const SUBPROTOCOL: &str = "webshocket.v1";

/// HTTP status and body used to reject an upgrade when the server is full
/// (§6 HTTP rejection when full).
const FULL_STATUS: u16 = 503;
const FULL_BODY: &str = "Server is full, try again later.";

/// Server-side configuration surface (§6 Configuration surface,
/// SPEC_FULL.md additions).
#[derive(Clone)]
pub struct ServerConfig {
    pub max_connection: Option<usize>,
    /// Default capacity of each connection's decoded-packet queue
    /// (`packet_queue`, §3/§5); used only by the default handler's
    /// `accept()`/`recv()` path.
    pub packet_qsize: usize,
    /// Bound on concurrent in-flight RPC tasks (§4.5, §5).
    pub rpc_task_limit: usize,
    /// Outbound chunk size for large payloads (§4.1).
    pub chunk_size: usize,
    /// Capacity of each connection's outbound frame sink (§5).
    pub sink_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connection: None,
            packet_qsize: 512,
            rpc_task_limit: crate::rpc::DEFAULT_RPC_TASK_LIMIT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            sink_capacity: 1024,
        }
    }
}

struct ServerImpl {
    registry: Arc<HandlerRegistry>,
    handler: Arc<dyn Handler>,
    rpc_engine: Arc<RpcEngine>,
    config: ServerConfig,
    is_default_handler: bool,
    accept_tx: async_channel::Sender<Connection>,
}

#[async_trait]
impl WebSocketHandler for ServerImpl {
    type Context = Connection;

    fn accept(&self, _peer: &SocketAddr, requested_protocols: &[String]) -> AcceptOutcome {
        if let Some(max) = self.config.max_connection {
            if self.registry.client_count() >= max {
                return AcceptOutcome::Reject { status: FULL_STATUS, body: FULL_BODY.to_string() };
            }
        }

        let framework = requested_protocols.iter().any(|p| p == SUBPROTOCOL);
        AcceptOutcome::Accept { subprotocol: framework.then(|| SUBPROTOCOL.to_string()) }
    }

    async fn handshake(self: &Arc<Self>, peer: &SocketAddr, subprotocol: Option<&str>, sink: &FrameSink) -> webshocket_transport::Result<Connection> {
        let client_type = if subprotocol == Some(SUBPROTOCOL) { ClientType::Framework } else { ClientType::Generic };
        let codec: Arc<dyn Codec> = match client_type {
            ClientType::Framework => Arc::new(BinaryCodec),
            ClientType::Generic => Arc::new(TextCodec),
        };

        let conn = Connection::new(
            next_connection_id(),
            client_type,
            *peer,
            self.registry.clone(),
            codec,
            sink.clone(),
            self.config.chunk_size,
            self.config.packet_qsize,
        );
        conn.set_connection_state(ConnectionState::Connected);

        // Inserted into the registry before `on_connect` runs (§3 Lifecycle).
        self.registry.insert_client(conn.clone());

        if self.is_default_handler {
            let _ = self.accept_tx.send(conn.clone()).await;
        }

        self.handler.on_connect(conn.clone()).await;
        log::info!("new connection from {peer}");

        Ok(conn)
    }

    async fn frame(self: &Arc<Self>, conn: &Connection, frame: Frame, _sink: &FrameSink) -> webshocket_transport::Result<()> {
        let packet = conn.decode(&frame.payload);

        match (&packet.source, &packet.rpc) {
            (Source::Rpc, Some(RpcEnvelope::Request { method, args, kwargs, call_id })) => {
                self.rpc_engine.spawn_request(conn.clone(), method.clone(), args.clone(), kwargs.clone(), call_id.clone());
            }
            _ => {
                self.handler.on_receive(conn.clone(), packet).await;
            }
        }

        Ok(())
    }

    async fn disconnect(self: &Arc<Self>, conn: Connection, _result: webshocket_transport::Result<()>) {
        conn.set_connection_state(ConnectionState::Disconnected);
        self.registry.remove_client(&conn);
        self.handler.on_disconnect(conn.clone()).await;
        log::info!("connection {} closed", conn.remote_addr());
    }
}

/// The Server Core (§4.6): owns the Handler Registry and drives the
/// transport's accept loop against an installed [`Handler`].
pub struct Server {
    inner: Arc<ServerImpl>,
    transport: Arc<WebSocketServer<ServerImpl>>,
    registry: Arc<HandlerRegistry>,
    accept_rx: async_channel::Receiver<Connection>,
}

impl Server {
    /// Constructs a server around `handler`. Passing [`DefaultHandler`]
    /// enables [`Server::accept`] (§4.6 "accept() convenience entry point").
    pub fn new<H: Handler>(handler: H, config: ServerConfig) -> Arc<Self> {
        Self::with_registry(HandlerRegistry::new(), handler, config)
    }

    /// Constructs a server around a registry created (and possibly
    /// pre-populated with RPC methods) by the caller.
    pub fn with_registry<H: Handler>(registry: Arc<HandlerRegistry>, handler: H, config: ServerConfig) -> Arc<Self> {
        let is_default_handler = TypeId::of::<H>() == TypeId::of::<DefaultHandler>();
        let (accept_tx, accept_rx) = async_channel::bounded(config.packet_qsize.max(1));
        let rpc_engine = Arc::new(RpcEngine::new(registry.clone(), config.rpc_task_limit));

        let inner = Arc::new(ServerImpl {
            registry: registry.clone(),
            handler: Arc::new(handler),
            rpc_engine,
            is_default_handler,
            accept_tx,
            config: config.clone(),
        });
        let transport = WebSocketServer::with_sink_capacity(inner.clone(), config.sink_capacity);

        Arc::new(Self { inner, transport, registry, accept_rx })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Registers an RPC method, last-registration-wins (§4.5, Open Questions).
    pub fn register_rpc_method(&self, name: impl Into<String>, entry: crate::rpc::RpcMethodEntry) {
        self.registry.register_rpc_method(name, entry);
    }

    /// Fan-out to every connected client (§4.4).
    pub fn broadcast(
        &self,
        data: impl Into<crate::packet::PacketData>,
        exclude: &[Connection],
        predicate: Option<&dyn Fn(&Connection) -> bool>,
    ) {
        self.registry.broadcast(data.into(), exclude, predicate);
    }

    /// Fan-out to every subscriber (exact or pattern) of `channel` (§4.4).
    pub fn publish(
        &self,
        channel: &str,
        data: impl Into<crate::packet::PacketData>,
        exclude: &[Connection],
        predicate: Option<&dyn Fn(&Connection) -> bool>,
    ) {
        self.registry.publish(channel, data.into(), exclude, predicate);
    }

    /// Fan-out to every subscriber of each of `channels` in turn (§4.4
    /// `publish(channel_or_channels, ...)`).
    pub fn publish_many(
        &self,
        channels: impl IntoIterator<Item = impl AsRef<str>>,
        data: impl Into<crate::packet::PacketData>,
        exclude: &[Connection],
        predicate: Option<&dyn Fn(&Connection) -> bool>,
    ) {
        self.registry.publish_many(channels, data.into(), exclude, predicate);
    }

    /// Binds `addr` and spawns the accept loop in the background, returning
    /// the bound address immediately (§4.6 `server.start()`). Useful for
    /// ephemeral ports (`"127.0.0.1:0"`) and for callers that want to do
    /// other work while the server runs.
    pub async fn start(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = self.transport.bind(addr).await?;
        let local_addr = listener.local_addr().map_err(|err| Error::PacketError(err.to_string()))?;
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.listen(listener).await {
                log::error!("server listener exited: {err}");
            }
        });
        Ok(local_addr)
    }

    /// Binds `addr` and serves until [`Server::stop`] is called (§4.6
    /// `server.serve_forever()`).
    pub async fn serve_forever(self: &Arc<Self>, addr: &str) -> Result<()> {
        self.start(addr).await?;
        self.join().await
    }

    /// Pulls the next newly-connected [`Connection`] (§4.6 `accept()`).
    /// Only meaningful when the server was constructed with
    /// [`DefaultHandler`]; otherwise every packet is already being routed
    /// to the custom handler's `on_receive`.
    pub async fn accept(&self) -> Result<Connection> {
        if !self.inner.is_default_handler {
            return Err(Error::PacketError("cannot use manual accept() when a custom handler is active".into()));
        }
        self.accept_rx.recv().await.map_err(|_| Error::ConnectionClosed)
    }

    pub fn stop(&self) -> Result<()> {
        Ok(self.transport.stop()?)
    }

    pub async fn join(&self) -> Result<()> {
        Ok(self.transport.join().await?)
    }

    pub async fn stop_and_join(&self) -> Result<()> {
        Ok(self.transport.stop_and_join().await?)
    }
}
