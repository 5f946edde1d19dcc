//!
//! Identifier generation for connections and RPC calls.
//!
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);
static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic per-process connection identifier.
pub fn next_connection_id() -> u64 {
    CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Process-prefixed monotonic hex string, matching the reference
/// implementation's `generate_uuid()`: pid in hex, a timestamp in hex, and a
/// monotonically increasing counter, joined with `-`. Collision-free within
/// a process and roughly sorts by call order.
pub fn generate_call_id() -> String {
    let pid = std::process::id();
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_micros();
    let counter = CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{pid:x}-{timestamp:x}-{counter:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique_and_monotonic_in_counter() {
        let a = generate_call_id();
        let b = generate_call_id();
        assert_ne!(a, b);
    }

    #[test]
    fn connection_ids_are_monotonic() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }
}
