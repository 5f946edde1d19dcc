//!
//! Handler polymorphism (Design Notes §9): the capability bundle a server
//! application implements (`on_connect`/`on_disconnect`/`on_receive`), with
//! default no-op implementations, plus the queueing [`DefaultHandler`] used
//! when no custom handler is supplied.
//!
//! RPC method registration is deliberately *not* part of this trait — per
//! Design Notes §9 it is "a separate registration API", implemented as
//! `HandlerRegistry::register_rpc_method` (§4.5), since RPC methods are
//! looked up by runtime string rather than dispatched through the handler
//! object itself.
use async_trait::async_trait;

use crate::connection::Connection;
use crate::packet::Packet;

/// Server-side connection event callbacks (§4.4, §4.6).
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called once a connection is admitted, registered in the handler
    /// registry, and ready to send/receive (§4.6 step 2).
    async fn on_connect(&self, _conn: Connection) {}

    /// Called after the connection has been removed from the registry and
    /// unsubscribed from every channel (§4.6 step 4).
    async fn on_disconnect(&self, _conn: Connection) {}

    /// Called for every non-RPC packet decoded from the connection, in
    /// arrival order; the next packet on this connection is not processed
    /// until this call returns (§5 Ordering guarantees).
    async fn on_receive(&self, _conn: Connection, _packet: Packet) {}
}

/// The no-op handler installed when the server is constructed without a
/// custom one: every inbound packet is simply parked on the connection's
/// own `packet_queue` for later retrieval via `Server::accept()` +
/// `Connection::recv()` (§4.6, Glossary "Default handler").
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

#[async_trait]
impl Handler for DefaultHandler {
    async fn on_receive(&self, conn: Connection, packet: Packet) {
        if let Err(err) = conn.enqueue_packet(packet).await {
            log::warn!("dropping packet for disconnected peer {conn:?}: {err}");
        }
    }
}
