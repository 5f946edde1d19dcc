//!
//! Low-level async WebSocket transport used by `webshocket`.
//!
//! This crate wraps [`tokio_tungstenite`] with two things the layer above
//! needs and tungstenite doesn't provide on its own:
//!
//! - a `Sec-WebSocket-Protocol`-aware accept/handshake pipeline on the server
//!   side, so a listener can tell a framework peer from a generic one (and
//!   reject connections outright, with a plain-text body, before the upgrade
//!   completes);
//! - an application-level logical frame format ([`frame::Frame`]) layered on
//!   top of tungstenite's `Message::Binary`, giving `webshocket` its own
//!   fragmentation/reassembly and outbound chunking independent of whatever
//!   wire-level fragmentation tungstenite performs underneath.
//!
//! Codec, RPC dispatch, pub/sub and connection/session bookkeeping all live
//! one layer up, in `webshocket` itself.
pub mod client;
pub mod error;
pub mod frame;
pub mod result;
pub mod server;

pub use error::Error;
pub use frame::{Frame, Opcode};
pub use result::Result;
