//!
//! Handler Registry (§4.4): the global set of connections, the exact-channel
//! and pattern-channel subscription tables, and the RPC method table.
use ahash::AHashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::packet::{Packet, PacketData};
use crate::rpc::RpcMethodEntry;

fn is_pattern(name: &str) -> bool {
    name.contains('*') || name.contains('?') || name.contains('[')
}

struct CompiledPatterns {
    set: GlobSet,
    /// Parallel to the glob indices `GlobSet::matches` returns.
    names: Vec<String>,
}

/// Global registry owned by one server instance: no process-wide singleton,
/// per Design Notes §9. Constructed before the first connection is admitted.
pub struct HandlerRegistry {
    clients: Mutex<HashSet<Connection>>,
    channels: Mutex<AHashMap<String, HashSet<Connection>>>,
    patterns: Mutex<AHashMap<String, HashSet<Connection>>>,
    compiled_patterns: Mutex<Option<CompiledPatterns>>,
    rpc_methods: Mutex<AHashMap<String, Arc<RpcMethodEntry>>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            clients: Mutex::new(HashSet::new()),
            channels: Mutex::new(AHashMap::new()),
            patterns: Mutex::new(AHashMap::new()),
            compiled_patterns: Mutex::new(None),
            rpc_methods: Mutex::new(AHashMap::new()),
        }
    }
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_client(&self, conn: Connection) {
        self.clients.lock().unwrap().insert(conn);
    }

    /// Removes a disconnected connection from every table it might be in:
    /// `clients`, every exact channel, and every pattern — invariant 3 (§8).
    pub fn remove_client(&self, conn: &Connection) {
        self.clients.lock().unwrap().remove(conn);

        let mut channels = self.channels.lock().unwrap();
        channels.retain(|_, set| {
            set.remove(conn);
            !set.is_empty()
        });
        drop(channels);

        let mut patterns = self.patterns.lock().unwrap();
        let before = patterns.len();
        patterns.retain(|_, set| {
            set.remove(conn);
            !set.is_empty()
        });
        let evicted = patterns.len() != before;
        drop(patterns);
        if evicted {
            self.recompile_patterns();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn contains_client(&self, conn: &Connection) -> bool {
        self.clients.lock().unwrap().contains(conn)
    }

    /// Subscribes `conn` to one or more channel names or glob patterns,
    /// classified per the grammar in §4.4 (`*`, `?`, `[` ⇒ pattern).
    pub fn subscribe(&self, conn: &Connection, channels: impl IntoIterator<Item = String>) {
        let mut exact = self.channels.lock().unwrap();
        let mut pattern = self.patterns.lock().unwrap();
        let mut patterns_changed = false;

        for name in channels {
            if is_pattern(&name) {
                let is_new = !pattern.contains_key(&name);
                pattern.entry(name).or_default().insert(conn.clone());
                patterns_changed |= is_new;
            } else {
                exact.entry(name).or_default().insert(conn.clone());
            }
        }

        drop(exact);
        drop(pattern);
        if patterns_changed {
            self.recompile_patterns();
        }
    }

    /// Unsubscribes `conn`; when a channel's or pattern's subscriber set
    /// becomes empty, the entry (and its compiled matcher) is evicted.
    pub fn unsubscribe(&self, conn: &Connection, channels: impl IntoIterator<Item = String>) {
        let mut exact = self.channels.lock().unwrap();
        let mut pattern = self.patterns.lock().unwrap();
        let mut patterns_changed = false;

        for name in channels {
            if is_pattern(&name) {
                if let Some(set) = pattern.get_mut(&name) {
                    set.remove(conn);
                    if set.is_empty() {
                        pattern.remove(&name);
                        patterns_changed = true;
                    }
                }
            } else if let Some(set) = exact.get_mut(&name) {
                set.remove(conn);
                if set.is_empty() {
                    exact.remove(&name);
                }
            }
        }

        drop(exact);
        drop(pattern);
        if patterns_changed {
            self.recompile_patterns();
        }
    }

    /// Every channel name (exact or pattern) `conn` is currently subscribed
    /// to. Always derived from the registry — never cached on the
    /// connection — per Design Notes §9.
    pub fn subscribed_channels(&self, conn: &Connection) -> Vec<String> {
        let mut out = Vec::new();
        for (name, set) in self.channels.lock().unwrap().iter() {
            if set.contains(conn) {
                out.push(name.clone());
            }
        }
        for (name, set) in self.patterns.lock().unwrap().iter() {
            if set.contains(conn) {
                out.push(name.clone());
            }
        }
        out
    }

    fn recompile_patterns(&self) {
        let patterns = self.patterns.lock().unwrap();
        if patterns.is_empty() {
            *self.compiled_patterns.lock().unwrap() = None;
            return;
        }

        let mut builder = GlobSetBuilder::new();
        let mut names = Vec::with_capacity(patterns.len());
        for name in patterns.keys() {
            if let Ok(glob) = Glob::new(name) {
                builder.add(glob);
                names.push(name.clone());
            } else {
                log::warn!("skipping uncompilable channel pattern `{name}`");
            }
        }
        drop(patterns);

        match builder.build() {
            Ok(set) => *self.compiled_patterns.lock().unwrap() = Some(CompiledPatterns { set, names }),
            Err(err) => log::error!("failed to compile channel pattern set: {err}"),
        }
    }

    /// Broadcasts to every connected client, skipping `exclude` and anyone
    /// failing `predicate`. Individual send failures are logged and
    /// swallowed — the fan-out itself never aborts (§4.4).
    pub fn broadcast(&self, data: PacketData, exclude: &[Connection], predicate: Option<&dyn Fn(&Connection) -> bool>) {
        let clients: Vec<Connection> = self.clients.lock().unwrap().iter().cloned().collect();
        if clients.is_empty() {
            return;
        }

        let packet = Packet::broadcast(data);
        for client in clients {
            if exclude.contains(&client) {
                continue;
            }
            if let Some(pred) = predicate {
                if !pred(&client) {
                    continue;
                }
            }
            if let Err(err) = client.send_packet(packet.clone()) {
                log::warn!("broadcast send to {client:?} failed: {err}");
            }
        }
    }

    /// Publishes the same `data` to each of `channels` in turn (§4.4
    /// `publish(channel_or_channels, ...)`), each recipient set computed and
    /// deduplicated independently per target channel.
    pub fn publish_many(
        &self,
        channels: impl IntoIterator<Item = impl AsRef<str>>,
        data: PacketData,
        exclude: &[Connection],
        predicate: Option<&dyn Fn(&Connection) -> bool>,
    ) {
        for channel in channels {
            self.publish(channel.as_ref(), data.clone(), exclude, predicate);
        }
    }

    /// Publishes to every exact and pattern subscriber of `channel`,
    /// deduplicated, per invariant 4 (§8).
    pub fn publish(&self, channel: &str, data: PacketData, exclude: &[Connection], predicate: Option<&dyn Fn(&Connection) -> bool>) {
        let mut recipients: HashSet<Connection> = HashSet::new();

        if let Some(set) = self.channels.lock().unwrap().get(channel) {
            recipients.extend(set.iter().cloned());
        }

        if let Some(compiled) = self.compiled_patterns.lock().unwrap().as_ref() {
            let patterns = self.patterns.lock().unwrap();
            for idx in compiled.set.matches(channel) {
                if let Some(set) = patterns.get(&compiled.names[idx]) {
                    recipients.extend(set.iter().cloned());
                }
            }
        }

        if recipients.is_empty() {
            return;
        }

        let packet = Packet::channel(channel.to_string(), data);
        for client in recipients {
            if exclude.contains(&client) {
                continue;
            }
            if let Some(pred) = predicate {
                if !pred(&client) {
                    continue;
                }
            }
            if let Err(err) = client.send_packet(packet.clone()) {
                log::warn!("publish to {channel} for {client:?} failed: {err}");
            }
        }
    }

    pub fn register_rpc_method(&self, name: impl Into<String>, entry: RpcMethodEntry) {
        // Last registration wins, per the Open Questions resolution in
        // SPEC_FULL.md: a plain map insert replaces any prior entry.
        self.rpc_methods.lock().unwrap().insert(name.into(), Arc::new(entry));
    }

    pub fn rpc_method(&self, name: &str) -> Option<Arc<RpcMethodEntry>> {
        self.rpc_methods.lock().unwrap().get(name).cloned()
    }
}
