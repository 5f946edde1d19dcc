//!
//! Bidirectional WebSocket application framework built on top of
//! `webshocket-transport`: connection/session management, a wildcard-aware
//! pub/sub channel registry, and a correlation-ID RPC engine.
//!
//! See [`server::Server`] for the server side and [`client::Client`] for the
//! client side; [`Handler`] is the capability bundle a server application
//! implements, and [`rpc_method!`] registers RPC methods against a
//! [`registry::HandlerRegistry`].
pub mod client;
pub mod codec;
pub mod connection;
pub mod duration;
pub mod error;
pub mod handler;
pub mod id;
pub mod packet;
pub mod registry;
pub mod result;
pub mod rpc;
pub mod server;

pub use client::{Client, ClientConfig, OnReceive, RetryPolicy};
pub use codec::{BinaryCodec, Codec, TextCodec};
pub use connection::{ClientType, Connection, ConnectionState, CLOSE_OK};
pub use error::Error;
pub use handler::{DefaultHandler, Handler};
pub use packet::{ErrorCode, Packet, PacketData, RpcEnvelope, Source};
pub use registry::HandlerRegistry;
pub use result::Result;
pub use rpc::{AccessPredicate, RateLimit, RpcMethod, RpcMethodEntry, RpcMethodError, CLOSE_TRY_AGAIN_LATER};
pub use server::{Server, ServerConfig};

pub use webshocket_transport as transport;
