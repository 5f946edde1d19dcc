//!
//! RPC Engine (§4.5): method registration, the six-step dispatch algorithm
//! (lookup, access predicate, rate limit, invocation, error mapping,
//! response), and the client-side call-ID correlation table used by
//! `client::Client::send_rpc`.
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::connection::{Connection, ConnectionState, RateLimitOutcome};
use crate::duration::parse_period;
use crate::packet::{ErrorCode, Packet};
use crate::registry::HandlerRegistry;
use crate::result::Result;

/// Default bound on concurrent in-flight server-side RPC tasks (§5).
pub const DEFAULT_RPC_TASK_LIMIT: usize = 1024;

/// Close code sent when a rate limit fires with `disconnect_on_limit_exceeded`
/// (§6 Close codes).
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Outcome a user RPC method reports back to the dispatch engine, mapped to
/// a wire [`ErrorCode`] per §4.5 step 5.
#[derive(Debug, Clone)]
pub enum RpcMethodError {
    /// Parameter arity/type mismatch → `ErrorCode::InvalidParams`.
    InvalidParams(String),
    /// Application-raised RPC error → `ErrorCode::ApplicationError`.
    Application(String),
    /// Anything else unexpected → `ErrorCode::InternalServerError`.
    Internal(String),
}

impl std::fmt::Display for RpcMethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcMethodError::InvalidParams(msg) => write!(f, "{msg}"),
            RpcMethodError::Application(msg) => write!(f, "{msg}"),
            RpcMethodError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

/// A registered RPC method: `(connection, args, kwargs) -> Result<Value, RpcMethodError>`,
/// invoked once per request as its own task (§4.5 step 4).
#[async_trait]
pub trait RpcMethod: Send + Sync {
    async fn call(&self, conn: Connection, args: Vec<Value>, kwargs: Map<String, Value>) -> std::result::Result<Value, RpcMethodError>;
}

/// Adapts a plain async closure into an [`RpcMethod`], so callers don't need
/// to hand-write the trait impl for every method. Used by the
/// [`crate::rpc_method!`] macro.
pub struct RpcMethodFn<F>(pub F);

#[async_trait]
impl<F, Fut> RpcMethod for RpcMethodFn<F>
where
    F: Fn(Connection, Vec<Value>, Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, RpcMethodError>> + Send + 'static,
{
    async fn call(&self, conn: Connection, args: Vec<Value>, kwargs: Map<String, Value>) -> std::result::Result<Value, RpcMethodError> {
        (self.0)(conn, args, kwargs).await
    }
}

/// Declares an RPC method closure without hand-writing the `Box`/`Pin`
/// plumbing `RpcMethodFn` needs — mirrors, in spirit, the workspace's
/// `method!`/`notification!` macros, reduced to a declarative macro since a
/// proc-macro crate can't be authored without running the toolchain to
/// verify it.
///
/// ```ignore
/// registry.register_rpc_method("ping", RpcMethodEntry::new(rpc_method!(|conn, args, kwargs| {
///     Ok(serde_json::json!("pong"))
/// })));
/// ```
#[macro_export]
macro_rules! rpc_method {
    (|$conn:ident, $args:ident, $kwargs:ident| $body:expr) => {
        ::std::sync::Arc::new($crate::rpc::RpcMethodFn(
            move |$conn: $crate::connection::Connection,
                  $args: ::std::vec::Vec<::serde_json::Value>,
                  $kwargs: ::serde_json::Map<::std::string::String, ::serde_json::Value>| {
                ::std::boxed::Box::pin(async move { $body })
            },
        )) as ::std::sync::Arc<dyn $crate::rpc::RpcMethod>
    };
}

/// `restricted` access predicate (§3 RPC Method descriptor).
pub type AccessPredicate = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Rate-limit configuration for one RPC method (§3, §4.5 step 3).
#[derive(Clone)]
pub struct RateLimit {
    pub limit: u32,
    pub period: Duration,
    pub disconnect_on_limit_exceeded: bool,
}

impl RateLimit {
    pub fn new(limit: u32, period: Duration) -> Self {
        Self { limit, period, disconnect_on_limit_exceeded: false }
    }

    /// Convenience constructor accepting a suffixed duration string
    /// (`"60s"`, `"5m"`, `"1h"`, `"2d"`) for `period` (SPEC_FULL.md §3).
    pub fn from_period_str(limit: u32, period: &str) -> Result<Self> {
        Ok(Self::new(limit, parse_period(period)?))
    }

    pub fn disconnect_on_limit(mut self, disconnect: bool) -> Self {
        self.disconnect_on_limit_exceeded = disconnect;
        self
    }
}

/// Full descriptor for one registered RPC method (§3 RPC Method descriptor).
pub struct RpcMethodEntry {
    pub func: Arc<dyn RpcMethod>,
    pub rate_limit: Option<RateLimit>,
    pub restricted: Option<AccessPredicate>,
}

impl RpcMethodEntry {
    pub fn new(func: Arc<dyn RpcMethod>) -> Self {
        Self { func, rate_limit: None, restricted: None }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_restricted(mut self, predicate: AccessPredicate) -> Self {
        self.restricted = Some(predicate);
        self
    }
}

/// Drives the six-step dispatch algorithm (§4.5) for every inbound
/// `Packet{source=RPC, rpc=Request}`, bounding concurrent in-flight
/// invocations with a semaphore (§5).
pub struct RpcEngine {
    registry: Arc<HandlerRegistry>,
    semaphore: Arc<Semaphore>,
}

impl RpcEngine {
    pub fn new(registry: Arc<HandlerRegistry>, task_limit: usize) -> Self {
        Self { registry, semaphore: Arc::new(Semaphore::new(task_limit)) }
    }

    /// Spawns the request as its own task (§4.5 step 4: "concurrently").
    /// The semaphore permit is held for the task's lifetime, bounding the
    /// number of requests in flight at any moment regardless of how many
    /// connections are sending them.
    pub fn spawn_request(self: &Arc<Self>, conn: Connection, method: String, args: Vec<Value>, kwargs: Map<String, Value>, call_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = engine.semaphore.clone().acquire_owned().await else {
                return;
            };
            engine.handle_request(conn, method, args, kwargs, call_id).await;
        });
    }

    async fn handle_request(&self, conn: Connection, method: String, args: Vec<Value>, kwargs: Map<String, Value>, call_id: String) {
        let entry = match self.registry.rpc_method(&method) {
            Some(entry) => entry,
            None => {
                let message = Value::String(format!("method `{method}` not found"));
                Self::respond(&conn, call_id, Some(message), Some(ErrorCode::MethodNotFound));
                return;
            }
        };

        if let Some(restricted) = &entry.restricted {
            if !restricted(&conn) {
                Self::respond(&conn, call_id, None, Some(ErrorCode::AccessDenied));
                return;
            }
        }

        if let Some(rate_limit) = &entry.rate_limit {
            match conn.check_rate_limit(&method, rate_limit.limit, rate_limit.period) {
                RateLimitOutcome::Exceeded => {
                    // Respond first: `close()` marks the connection Closed,
                    // and `respond` refuses to send to anything but a
                    // Connected peer, so closing first would silently
                    // swallow the RATE_LIMIT_EXCEEDED response.
                    Self::respond(&conn, call_id, None, Some(ErrorCode::RateLimitExceeded));
                    if rate_limit.disconnect_on_limit_exceeded {
                        conn.close(CLOSE_TRY_AGAIN_LATER, "Rate limit exceeded");
                    }
                    return;
                }
                RateLimitOutcome::Allowed => {}
            }
        }

        let (response, error) = match entry.func.call(conn.clone(), args, kwargs).await {
            Ok(value) => (Some(value), None),
            Err(RpcMethodError::InvalidParams(msg)) => (Some(Value::String(msg)), Some(ErrorCode::InvalidParams)),
            Err(RpcMethodError::Application(msg)) => (Some(Value::String(msg)), Some(ErrorCode::ApplicationError)),
            Err(RpcMethodError::Internal(msg)) => {
                log::error!("RPC execution failed for method '{method}': {msg}");
                (Some(Value::String(msg)), Some(ErrorCode::InternalServerError))
            }
        };

        Self::respond(&conn, call_id, response, error);
    }

    /// Sends the response "only if the connection is still CONNECTED" (§4.5
    /// step 6). A send failure here (connection gone, queue full) is not
    /// actionable by the dispatch engine — there is no caller left to
    /// report it to — so it is logged and dropped.
    fn respond(conn: &Connection, call_id: String, response: Option<Value>, error: Option<ErrorCode>) {
        if conn.connection_state() != ConnectionState::Connected {
            return;
        }
        if let Err(err) = conn.send_packet(Packet::rpc_response(call_id, response, error)) {
            log::warn!("failed to deliver RPC response to {conn:?}: {err}");
        }
    }
}

/// One pending client-side RPC call awaiting its response (§4.5 client-side
/// correlation).
pub(crate) struct PendingCall {
    pub(crate) responder: tokio::sync::oneshot::Sender<Packet>,
}

/// Default client-side RPC call timeout (§4.5, §7).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Error raised by `Client::send_rpc` when the opt-in
/// `raise_on_rate_limit` flag is set and the server responded
/// `RATE_LIMIT_EXCEEDED` (§4.5 client-side correlation).
#[derive(Debug)]
pub struct RateLimitExceededError;

impl std::fmt::Display for RateLimitExceededError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC call rate limit exceeded")
    }
}

impl std::error::Error for RateLimitExceededError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinaryCodec;
    use crate::connection::ClientType;
    use serde_json::json;

    fn test_connection(registry: Arc<HandlerRegistry>) -> Connection {
        let (sink, _rx) = tokio::sync::mpsc::channel(16);
        let conn = Connection::new(1, ClientType::Framework, "127.0.0.1:9000".parse().unwrap(), registry, Arc::new(BinaryCodec), sink, 64 * 1024, 16);
        conn.set_connection_state(ConnectionState::Connected);
        conn
    }

    #[tokio::test]
    async fn method_not_found_yields_method_not_found_error() {
        let registry = HandlerRegistry::new();
        let engine = Arc::new(RpcEngine::new(registry.clone(), 4));
        let (sink, mut rx) = tokio::sync::mpsc::channel(16);
        let conn = Connection::new(1, ClientType::Framework, "127.0.0.1:9000".parse().unwrap(), registry, Arc::new(BinaryCodec), sink, 64 * 1024, 16);
        conn.set_connection_state(ConnectionState::Connected);

        engine.handle_request(conn, "missing".into(), vec![], Map::new(), "call-1".into()).await;

        let outbound = rx.recv().await.unwrap();
        let webshocket_transport::server::Outbound::Frame(frame) = outbound else { panic!("expected a frame") };
        let packet = BinaryCodec.decode(&frame.payload);
        match packet.rpc {
            Some(crate::packet::RpcEnvelope::Response { error, .. }) => assert_eq!(error, Some(ErrorCode::MethodNotFound)),
            _ => panic!("expected an rpc response"),
        }
    }

    #[tokio::test]
    async fn restricted_method_denies_access() {
        let registry = HandlerRegistry::new();
        registry.register_rpc_method(
            "admin_only",
            RpcMethodEntry::new(rpc_method!(|_conn, _args, _kwargs| Ok(json!("ok")))).with_restricted(Arc::new(|_: &Connection| false)),
        );
        let engine = Arc::new(RpcEngine::new(registry.clone(), 4));
        let conn = test_connection(registry);

        engine.handle_request(conn, "admin_only".into(), vec![], Map::new(), "call-1".into()).await;
    }

    #[tokio::test]
    async fn rate_limit_allows_then_denies() {
        use crate::codec::Codec;

        let registry = HandlerRegistry::new();
        registry.register_rpc_method(
            "ping",
            RpcMethodEntry::new(rpc_method!(|_conn, _args, _kwargs| Ok(json!("pong")))).with_rate_limit(RateLimit::new(2, Duration::from_secs(60))),
        );
        let engine = Arc::new(RpcEngine::new(registry.clone(), 4));
        let (sink, mut rx) = tokio::sync::mpsc::channel(16);
        let conn = Connection::new(1, ClientType::Framework, "127.0.0.1:9000".parse().unwrap(), registry, Arc::new(BinaryCodec), sink, 64 * 1024, 16);
        conn.set_connection_state(ConnectionState::Connected);

        for i in 0..3 {
            engine.clone().handle_request(conn.clone(), "ping".into(), vec![], Map::new(), format!("call-{i}")).await;
        }

        let mut errors = Vec::new();
        for _ in 0..3 {
            let webshocket_transport::server::Outbound::Frame(frame) = rx.recv().await.unwrap() else { panic!() };
            let packet = BinaryCodec.decode(&frame.payload);
            if let Some(crate::packet::RpcEnvelope::Response { error, .. }) = packet.rpc {
                errors.push(error);
            }
        }
        assert_eq!(errors, vec![None, None, Some(ErrorCode::RateLimitExceeded)]);
    }

    /// Even when the rate limit is configured to disconnect the caller, the
    /// `RATE_LIMIT_EXCEEDED` response must still reach it first — the close
    /// must not race ahead and make `respond` a no-op.
    #[tokio::test]
    async fn rate_limit_disconnect_still_delivers_response() {
        use crate::codec::Codec;

        let registry = HandlerRegistry::new();
        registry.register_rpc_method(
            "ping",
            RpcMethodEntry::new(rpc_method!(|_conn, _args, _kwargs| Ok(json!("pong"))))
                .with_rate_limit(RateLimit::new(1, Duration::from_secs(60)).disconnect_on_limit(true)),
        );
        let engine = Arc::new(RpcEngine::new(registry.clone(), 4));
        let (sink, mut rx) = tokio::sync::mpsc::channel(16);
        let conn = Connection::new(1, ClientType::Framework, "127.0.0.1:9000".parse().unwrap(), registry, Arc::new(BinaryCodec), sink, 64 * 1024, 16);
        conn.set_connection_state(ConnectionState::Connected);

        engine.clone().handle_request(conn.clone(), "ping".into(), vec![], Map::new(), "call-0".into()).await;
        engine.clone().handle_request(conn.clone(), "ping".into(), vec![], Map::new(), "call-1".into()).await;

        let webshocket_transport::server::Outbound::Frame(frame) = rx.recv().await.unwrap() else { panic!() };
        let packet = BinaryCodec.decode(&frame.payload);
        assert!(matches!(packet.rpc, Some(crate::packet::RpcEnvelope::Response { error: None, .. })));

        let webshocket_transport::server::Outbound::Frame(frame) = rx.recv().await.unwrap() else { panic!() };
        let packet = BinaryCodec.decode(&frame.payload);
        assert!(matches!(packet.rpc, Some(crate::packet::RpcEnvelope::Response { error: Some(ErrorCode::RateLimitExceeded), .. })));

        assert_eq!(conn.connection_state(), ConnectionState::Closed);
    }
}
