//! # Engine
//!
//! Purpose: the top-level object a server connection talks to. Owns the
//! fixed array of databases, the shared timer, and the command registry;
//! dispatches base commands (`PING`/`AUTH`/`SELECT`/pub-sub/`BGREWRITEAOF`)
//! itself and routes everything else to the selected database.
//!
//! ## Design Principles
//! 1. **AOF and pub/sub are collaborators, not fields of this module's own
//!    logic.** `AofSink`/`PubSubHub` are small traits the server crate
//!    implements and injects; the engine only calls them at the right
//!    moments, it never owns a socket or a file handle.
//! 2. **Transactions live here, not in the registry.** `MULTI`/`EXEC`/
//!    `WATCH` touch `ConnectionState` as much as they touch the database, so
//!    they're handled alongside the other base commands rather than as
//!    ordinary `CommandSpec` executors.

use std::sync::Arc;
use std::time::Duration;

use hkv_common::{ConnectionState, HkvError, Reply};

use crate::database::Database;
use crate::registry::{CommandRegistry, RollbackOutcome};
use crate::timer::TimeWheel;

/// Sink for AOF persistence; `hkv-aof` provides the real implementation.
pub trait AofSink: Send + Sync {
    fn append(&self, db_index: usize, command: &[Vec<u8>]);
    /// Runs `BGREWRITEAOF`'s three-phase rewrite (§4.5) against `engine`.
    /// A no-op default lets tests exercise `Engine` without wiring a real
    /// sink.
    fn rewrite(&self, engine: &Engine) {
        let _ = engine;
    }
}

/// Channel hub for `SUBSCRIBE`/`PUBLISH`; `hkv-pubsub` provides the real
/// implementation. `conn_id` identifies the calling connection to the hub.
pub trait PubSubHub: Send + Sync {
    fn subscribe(&self, channel: &str, conn_id: u64);
    fn unsubscribe(&self, channel: &str, conn_id: u64);
    fn publish(&self, channel: &str, message: &[u8]) -> u64;
}

/// Builds the 3-element `SUBSCRIBE`/`UNSUBSCRIBE` confirmation push: kind,
/// channel (or `$-1` for an argument-less `UNSUBSCRIBE` with no
/// subscriptions), and the connection's resulting subscription count.
fn channel_envelope(kind: &str, channel: Option<&str>, count: usize) -> Reply {
    Reply::Array(vec![Reply::bulk(kind.as_bytes().to_vec()), channel.map(|c| Reply::bulk(c.as_bytes().to_vec())).unwrap_or_else(Reply::nil), Reply::Integer(count as i64)])
}

pub struct EngineConfig {
    pub database_count: usize,
    pub shard_count: usize,
    pub tick_interval: Duration,
    pub slot_count: usize,
    pub password: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_count: 16,
            shard_count: 16,
            tick_interval: Duration::from_secs(1),
            slot_count: 3600,
            password: None,
        }
    }
}

/// What `EXEC` produced, distinguishing a watch/enqueue abort from a normal
/// (possibly mixed-error) reply list so the server can choose the right
/// wire framing (`*-1` vs `-EXECABORT` vs a regular multi-bulk).
pub enum TxnOutcome {
    Aborted(&'static str),
    Replies(Vec<Reply>),
}

pub struct Engine {
    databases: Vec<Arc<Database>>,
    registry: CommandRegistry,
    _timer: TimeWheel,
    password: Option<String>,
    aof: Option<Arc<dyn AofSink>>,
    pubsub: Option<Arc<dyn PubSubHub>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let timer = TimeWheel::start(config.tick_interval, config.slot_count);
        let databases = (0..config.database_count)
            .map(|i| Database::new(i, config.shard_count, timer.handle()))
            .collect();
        Engine {
            databases,
            registry: CommandRegistry::with_builtin_commands(),
            _timer: timer,
            password: config.password,
            aof: None,
            pubsub: None,
        }
    }

    pub fn set_aof_sink(&mut self, sink: Arc<dyn AofSink>) {
        self.aof = Some(sink);
    }

    pub fn set_pubsub_hub(&mut self, hub: Arc<dyn PubSubHub>) {
        self.pubsub = Some(hub);
    }

    pub fn database_count(&self) -> usize {
        self.databases.len()
    }

    pub fn database(&self, index: usize) -> Option<&Arc<Database>> {
        self.databases.get(index)
    }

    fn requires_auth(&self) -> bool {
        self.password.is_some()
    }

    /// Entry point for a single command (not already queued by `MULTI`).
    /// `conn_id` is an opaque per-connection identifier used only for
    /// pub/sub bookkeeping.
    pub fn dispatch(&self, conn: &mut ConnectionState, conn_id: u64, name: &str, args: &[Vec<u8>]) -> Reply {
        let upper = name.to_ascii_uppercase();

        if self.requires_auth() && !conn.is_authenticated() && !matches!(upper.as_str(), "AUTH" | "PING") {
            return Reply::Error("NOAUTH Authentication required".to_string());
        }

        match upper.as_str() {
            "PING" => return Reply::Simple(args.first().map(|m| String::from_utf8_lossy(m).into_owned()).unwrap_or_else(|| "PONG".to_string())),
            "AUTH" => return self.handle_auth(conn, args),
            "SELECT" => return self.handle_select(conn, args),
            "SUBSCRIBE" => return self.handle_subscribe(conn, conn_id, args),
            "UNSUBSCRIBE" => return self.handle_unsubscribe(conn, conn_id, args),
            "PUBLISH" => return self.handle_publish(args),
            "BGREWRITEAOF" => {
                if let Some(sink) = &self.aof {
                    sink.rewrite(self);
                }
                return Reply::Simple("Background append only file rewriting started".to_string());
            }
            "MULTI" => return self.handle_multi(conn),
            "DISCARD" => return self.handle_discard(conn),
            "WATCH" => return self.handle_watch(conn, args),
            "UNWATCH" => {
                conn.clear_watches();
                return Reply::ok();
            }
            "EXEC" => {
                return match self.handle_exec(conn, args) {
                    TxnOutcome::Aborted(msg) => Reply::Error(msg.to_string()),
                    TxnOutcome::Replies(replies) => Reply::Array(replies),
                }
            }
            _ => {}
        }

        if conn.is_in_transaction() {
            return self.enqueue(conn, &upper, args);
        }

        self.dispatch_live(conn.db_index(), &upper, args)
    }

    fn handle_auth(&self, conn: &mut ConnectionState, args: &[Vec<u8>]) -> Reply {
        if args.len() != 1 {
            return Reply::Error("ERR wrong number of arguments for 'auth' command".to_string());
        }
        match &self.password {
            None => Reply::Error("ERR Client sent AUTH, but no password is set".to_string()),
            Some(expected) => {
                if args[0] == expected.as_bytes() {
                    conn.set_authenticated(true);
                    Reply::ok()
                } else {
                    Reply::Error("WRONGPASS invalid password".to_string())
                }
            }
        }
    }

    fn handle_select(&self, conn: &mut ConnectionState, args: &[Vec<u8>]) -> Reply {
        if conn.is_in_transaction() {
            return Reply::Error("ERR SELECT is not allowed in transactions".to_string());
        }
        let Some(raw) = args.first() else {
            return Reply::Error("ERR wrong number of arguments for 'select' command".to_string());
        };
        let Ok(index) = std::str::from_utf8(raw).unwrap_or("").parse::<usize>() else {
            return Reply::Error("ERR value is not an integer or out of range".to_string());
        };
        if index >= self.databases.len() {
            return Reply::Error("ERR DB index is out of range".to_string());
        }
        conn.set_db_index(index);
        Reply::ok()
    }

    fn handle_subscribe(&self, conn: &mut ConnectionState, conn_id: u64, args: &[Vec<u8>]) -> Reply {
        if args.is_empty() {
            return Reply::Error("ERR wrong number of arguments for 'subscribe' command".to_string());
        }
        let mut envelopes = Vec::with_capacity(args.len());
        for channel in args {
            let channel = String::from_utf8_lossy(channel).into_owned();
            conn.subscribe(channel.clone());
            if let Some(hub) = &self.pubsub {
                hub.subscribe(&channel, conn_id);
            }
            envelopes.push(channel_envelope("subscribe", Some(&channel), conn.subscription_count()));
        }
        Reply::Multi(envelopes)
    }

    fn handle_unsubscribe(&self, conn: &mut ConnectionState, conn_id: u64, args: &[Vec<u8>]) -> Reply {
        let channels: Vec<String> = if args.is_empty() {
            conn.subscribed_channels().map(str::to_string).collect()
        } else {
            args.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect()
        };
        if channels.is_empty() {
            return Reply::Multi(vec![channel_envelope("unsubscribe", None, 0)]);
        }
        let mut envelopes = Vec::with_capacity(channels.len());
        for channel in &channels {
            conn.unsubscribe(channel);
            if let Some(hub) = &self.pubsub {
                hub.unsubscribe(channel, conn_id);
            }
            envelopes.push(channel_envelope("unsubscribe", Some(channel), conn.subscription_count()));
        }
        Reply::Multi(envelopes)
    }

    fn handle_publish(&self, args: &[Vec<u8>]) -> Reply {
        if args.len() != 2 {
            return Reply::Error("ERR wrong number of arguments for 'publish' command".to_string());
        }
        let channel = String::from_utf8_lossy(&args[0]);
        let delivered = self.pubsub.as_ref().map(|hub| hub.publish(&channel, &args[1])).unwrap_or(0);
        Reply::Integer(delivered as i64)
    }

    fn handle_multi(&self, conn: &mut ConnectionState) -> Reply {
        if conn.is_in_transaction() {
            return Reply::Error("ERR MULTI calls can not be nested".to_string());
        }
        conn.begin_transaction();
        Reply::ok()
    }

    fn handle_discard(&self, conn: &mut ConnectionState) -> Reply {
        if !conn.is_in_transaction() {
            return Reply::Error("ERR DISCARD without MULTI".to_string());
        }
        conn.discard_transaction();
        Reply::ok()
    }

    fn handle_watch(&self, conn: &mut ConnectionState, args: &[Vec<u8>]) -> Reply {
        if conn.is_in_transaction() {
            return Reply::Error("ERR WATCH inside MULTI is not allowed".to_string());
        }
        if args.is_empty() {
            return Reply::Error("ERR wrong number of arguments for 'watch' command".to_string());
        }
        let Some(db) = self.databases.get(conn.db_index()) else {
            return Reply::from(HkvError::Internal("selected database out of range".to_string()));
        };
        for key in args {
            conn.watch_key(key.clone(), db.get_version(key));
        }
        Reply::ok()
    }

    /// Queues a command inside `MULTI`, pre-validating name/arity so
    /// enqueue-time errors can trigger `EXECABORT` (§4.7).
    fn enqueue(&self, conn: &mut ConnectionState, name: &str, args: &[Vec<u8>]) -> Reply {
        match self.registry.get(name) {
            None => {
                conn.record_enqueue_error(format!("ERR unknown command '{name}'"));
                Reply::Error(format!("ERR unknown command '{name}'"))
            }
            Some(spec) => {
                if !spec.check_arity(args.len() + 1) {
                    let message = format!("ERR wrong number of arguments for '{name}' command");
                    conn.record_enqueue_error(message.clone());
                    Reply::Error(message)
                } else {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(name.as_bytes().to_vec());
                    full.extend_from_slice(args);
                    conn.enqueue(full);
                    Reply::Simple("QUEUED".to_string())
                }
            }
        }
    }

    fn handle_exec(&self, conn: &mut ConnectionState, args: &[Vec<u8>]) -> TxnOutcome {
        if !conn.is_in_transaction() {
            return TxnOutcome::Aborted("ERR EXEC without MULTI");
        }
        if conn.has_enqueue_errors() {
            conn.take_transaction();
            return TxnOutcome::Aborted("EXECABORT Transaction discarded because of previous errors.");
        }
        let rollback = matches!(args.first(), Some(flag) if flag.eq_ignore_ascii_case(b"RB"));

        let db_index = conn.db_index();
        let Some(db) = self.databases.get(db_index).cloned() else {
            conn.take_transaction();
            return TxnOutcome::Aborted("ERR selected database out of range");
        };

        let watched: Vec<(Vec<u8>, u64)> = conn.watched_keys().map(|(k, v)| (k.to_vec(), v)).collect();
        for (key, version_at_watch) in &watched {
            if db.get_version(key) != *version_at_watch {
                conn.take_transaction();
                return TxnOutcome::Replies(Vec::new());
            }
        }

        let queued = conn.take_transaction();
        let commands: Vec<(String, Vec<Vec<u8>>)> = queued
            .into_iter()
            .map(|mut full| {
                let name = String::from_utf8_lossy(&full.remove(0)).to_ascii_uppercase();
                (name, full)
            })
            .collect();

        if rollback {
            self.run_with_rollback(&db, db_index, commands)
        } else {
            let replies = self.registry.dispatch_batch(&db, &commands);
            self.append_writes_to_aof(db_index, &commands, &replies);
            TxnOutcome::Replies(replies)
        }
    }

    /// `RB` path: runs the whole queued batch under one combined lock
    /// spanning every key it touches, stacking undo commands as it goes; on
    /// the first error the stack is unwound in reverse still under that same
    /// lock, so no other connection ever observes the partial write (§4.7, §8).
    fn run_with_rollback(&self, db: &Arc<Database>, db_index: usize, commands: Vec<(String, Vec<Vec<u8>>)>) -> TxnOutcome {
        match self.registry.dispatch_batch_with_rollback(db, &commands) {
            RollbackOutcome::Committed(replies) => {
                self.append_writes_to_aof(db_index, &commands, &replies);
                TxnOutcome::Replies(replies)
            }
            RollbackOutcome::Aborted => TxnOutcome::Aborted("EXECABORT Transaction discarded because of a command error."),
        }
    }

    fn append_writes_to_aof(&self, db_index: usize, commands: &[(String, Vec<Vec<u8>>)], replies: &[Reply]) {
        let Some(sink) = &self.aof else { return };
        for ((name, args), reply) in commands.iter().zip(replies.iter()) {
            if reply.is_error() {
                continue;
            }
            if let Some(spec) = self.registry.get(name) {
                let (_, writes) = crate::registry::extract_keys(&spec.key_spec, args);
                if writes.is_empty() {
                    continue;
                }
            }
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(name.as_bytes().to_vec());
            full.extend_from_slice(args);
            sink.append(db_index, &full);
        }
    }

    /// Runs one command immediately (outside a transaction), appending it to
    /// the AOF when it's a write and didn't error.
    fn dispatch_live(&self, db_index: usize, name: &str, args: &[Vec<u8>]) -> Reply {
        let Some(db) = self.databases.get(db_index) else {
            return Reply::from(HkvError::Internal("selected database out of range".to_string()));
        };
        if !self.registry.contains(name) {
            return Reply::Error(format!("ERR unknown command '{name}'"));
        }
        let reply = self.registry.dispatch_one(db, name, args);
        if !reply.is_error() {
            if let (Some(sink), Some(spec)) = (&self.aof, self.registry.get(name)) {
                let (_, writes) = crate::registry::extract_keys(&spec.key_spec, args);
                if !writes.is_empty() {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(name.as_bytes().to_vec());
                    full.extend_from_slice(args);
                    sink.append(db_index, &full);
                }
            }
        }
        reply
    }

    /// Replays one record against a fresh virtual connection (AOF startup
    /// load and the background-rewrite builder both drive through this
    /// path, never through `dispatch`, so replay never re-enters the AOF).
    pub fn replay(&self, conn: &mut ConnectionState, name: &str, args: &[Vec<u8>]) -> Reply {
        let upper = name.to_ascii_uppercase();
        if upper == "SELECT" {
            return self.handle_select(conn, args);
        }
        self.dispatch_live_no_aof(conn.db_index(), &upper, args)
    }

    fn dispatch_live_no_aof(&self, db_index: usize, name: &str, args: &[Vec<u8>]) -> Reply {
        match self.databases.get(db_index) {
            Some(db) => self.registry.dispatch_one(db, name, args),
            None => Reply::from(HkvError::Internal("selected database out of range".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Engine {
        Engine::new(EngineConfig { database_count: 2, shard_count: 4, tick_interval: Duration::from_millis(20), slot_count: 32, password: None })
    }

    #[test]
    fn ping_without_message_replies_pong() {
        let engine = test_engine();
        let mut conn = ConnectionState::new();
        assert_eq!(engine.dispatch(&mut conn, 1, "PING", &[]), Reply::Simple("PONG".to_string()));
    }

    #[test]
    fn select_switches_database_scope() {
        let engine = test_engine();
        let mut conn = ConnectionState::new();
        engine.dispatch(&mut conn, 1, "SET", &[b"k".to_vec(), b"v0".to_vec()]);
        engine.dispatch(&mut conn, 1, "SELECT", &[b"1".to_vec()]);
        assert_eq!(engine.dispatch(&mut conn, 1, "GET", &[b"k".to_vec()]), Reply::nil());
    }

    #[test]
    fn multi_exec_runs_queued_commands_in_order() {
        let engine = test_engine();
        let mut conn = ConnectionState::new();
        engine.dispatch(&mut conn, 1, "MULTI", &[]);
        assert_eq!(engine.dispatch(&mut conn, 1, "SET", &[b"k".to_vec(), b"v".to_vec()]), Reply::Simple("QUEUED".to_string()));
        assert_eq!(engine.dispatch(&mut conn, 1, "GET", &[b"k".to_vec()]), Reply::Simple("QUEUED".to_string()));
        let result = engine.dispatch(&mut conn, 1, "EXEC", &[]);
        assert_eq!(result, Reply::Array(vec![Reply::ok(), Reply::bulk(b"v".to_vec())]));
    }

    #[test]
    fn watch_aborts_exec_when_key_changed_concurrently() {
        let engine = test_engine();
        let mut conn = ConnectionState::new();
        engine.dispatch(&mut conn, 1, "SET", &[b"k".to_vec(), b"v1".to_vec()]);
        engine.dispatch(&mut conn, 1, "WATCH", &[b"k".to_vec()]);
        engine.dispatch(&mut conn, 1, "SET", &[b"k".to_vec(), b"v2".to_vec()]);
        engine.dispatch(&mut conn, 1, "MULTI", &[]);
        engine.dispatch(&mut conn, 1, "SET", &[b"k".to_vec(), b"v3".to_vec()]);
        let result = engine.dispatch(&mut conn, 1, "EXEC", &[]);
        assert_eq!(result, Reply::Array(Vec::new()));
        assert_eq!(engine.dispatch(&mut conn, 1, "GET", &[b"k".to_vec()]), Reply::bulk(b"v2".to_vec()));
    }

    #[test]
    fn exec_without_multi_is_an_error() {
        let engine = test_engine();
        let mut conn = ConnectionState::new();
        assert!(engine.dispatch(&mut conn, 1, "EXEC", &[]).is_error());
    }
}
