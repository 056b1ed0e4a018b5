//! # Connection State
//!
//! Purpose: Carry per-connection state shared by the real client connection
//! and the "virtual connection" used to replay AOF records at startup.
//!
//! ## Design Principles
//! 1. **One Struct, Two Drivers**: `ConnectionState` has no I/O of its own;
//!    the server's real connection and the AOF replayer both own one and
//!    feed commands through the same dispatcher.
//! 2. **Watch Set as Snapshot**: `watch` records the key-version pair seen
//!    at `WATCH` time; `EXEC` compares it against current versions rather
//!    than re-deriving it, so the compare is O(watched keys) not O(keys).

use std::collections::{HashMap, HashSet};

/// Everything the dispatcher needs to know about who is asking.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    db_index: usize,
    password: Option<String>,
    authenticated: bool,
    subscribed: HashSet<String>,
    in_transaction: bool,
    queued: Vec<Vec<Vec<u8>>>,
    queue_errors: Vec<String>,
    watch: HashMap<Vec<u8>, u64>,
}

impl ConnectionState {
    /// A fresh connection: db 0, no subscriptions, no pending transaction.
    pub fn new() -> Self {
        ConnectionState {
            db_index: 0,
            password: None,
            authenticated: false,
            subscribed: HashSet::new(),
            in_transaction: false,
            queued: Vec::new(),
            queue_errors: Vec::new(),
            watch: HashMap::new(),
        }
    }

    pub fn db_index(&self) -> usize {
        self.db_index
    }

    pub fn set_db_index(&mut self, index: usize) {
        self.db_index = index;
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(password.into());
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn set_authenticated(&mut self, value: bool) {
        self.authenticated = value;
    }

    pub fn subscribe(&mut self, channel: impl Into<String>) -> bool {
        self.subscribed.insert(channel.into())
    }

    pub fn unsubscribe(&mut self, channel: &str) -> bool {
        self.subscribed.remove(channel)
    }

    pub fn subscribed_channels(&self) -> impl Iterator<Item = &str> {
        self.subscribed.iter().map(String::as_str)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.len()
    }

    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Opens a transaction; clears any stale queue from a prior MULTI/EXEC.
    pub fn begin_transaction(&mut self) {
        self.in_transaction = true;
        self.queued.clear();
        self.queue_errors.clear();
    }

    pub fn enqueue(&mut self, command: Vec<Vec<u8>>) {
        self.queued.push(command);
    }

    pub fn record_enqueue_error(&mut self, message: impl Into<String>) {
        self.queue_errors.push(message.into());
    }

    pub fn has_enqueue_errors(&self) -> bool {
        !self.queue_errors.is_empty()
    }

    /// Ends the transaction and hands back the queued commands for EXEC to run.
    pub fn take_transaction(&mut self) -> Vec<Vec<Vec<u8>>> {
        self.in_transaction = false;
        self.watch.clear();
        self.queue_errors.clear();
        std::mem::take(&mut self.queued)
    }

    /// Aborts the transaction without executing anything (DISCARD).
    pub fn discard_transaction(&mut self) {
        self.in_transaction = false;
        self.queued.clear();
        self.queue_errors.clear();
        self.watch.clear();
    }

    pub fn watch_key(&mut self, key: Vec<u8>, version_at_watch: u64) {
        self.watch.entry(key).or_insert(version_at_watch);
    }

    pub fn clear_watches(&mut self) {
        self.watch.clear();
    }

    pub fn watched_keys(&self) -> impl Iterator<Item = (&[u8], u64)> {
        self.watch.iter().map(|(k, v)| (k.as_slice(), *v))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_queue_round_trips() {
        let mut conn = ConnectionState::new();
        conn.begin_transaction();
        assert!(conn.is_in_transaction());
        conn.enqueue(vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        let queued = conn.take_transaction();
        assert_eq!(queued.len(), 1);
        assert!(!conn.is_in_transaction());
    }

    #[test]
    fn watch_set_keeps_first_seen_version() {
        let mut conn = ConnectionState::new();
        conn.watch_key(b"k".to_vec(), 5);
        conn.watch_key(b"k".to_vec(), 9);
        let (_, v) = conn.watched_keys().next().unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn discard_clears_queue_and_watches() {
        let mut conn = ConnectionState::new();
        conn.begin_transaction();
        conn.enqueue(vec![b"PING".to_vec()]);
        conn.watch_key(b"k".to_vec(), 1);
        conn.discard_transaction();
        assert!(!conn.is_in_transaction());
        assert_eq!(conn.watched_keys().count(), 0);
    }
}
