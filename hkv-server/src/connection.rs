//! # Client Connection Handling
//!
//! Accept RESP2 connections, parse commands, and dispatch them to the
//! storage engine (or, in cluster mode, to the router) with minimal
//! overhead. One task per connection; a second task per connection pumps
//! pub/sub pushes onto the same socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;

use hkv_common::{encode_pubsub_message, encode_reply, ConnectionState, Reply, RespError, RespParser};
use hkv_engine::registry::KeySpec;
use hkv_engine::{CommandRegistry, Engine};
use hkv_pubsub::ChannelHub;

use crate::metrics::Metrics;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

struct Cluster {
    router: hkv_cluster::ClusterRouter,
    tcc: hkv_cluster::TccParticipant,
    _timer: hkv_engine::TimeWheel,
}

/// Everything a connection task needs, shared read-only across every
/// connection on the process.
pub struct ServerState {
    engine: Arc<Engine>,
    pubsub: Arc<ChannelHub>,
    metrics: Arc<Metrics>,
    registry: Arc<CommandRegistry>,
    cluster: Option<Cluster>,
}

impl ServerState {
    pub fn new(
        engine: Arc<Engine>,
        pubsub: Arc<ChannelHub>,
        metrics: Arc<Metrics>,
        self_addr: Option<String>,
        peers: Vec<String>,
        aof: Option<Arc<dyn hkv_engine::engine::AofSink>>,
    ) -> Self {
        let registry = Arc::new(CommandRegistry::with_builtin_commands());
        let cluster = self_addr.map(|addr| {
            let timer = hkv_engine::TimeWheel::start(std::time::Duration::from_secs(1), 3600);
            let tcc = hkv_cluster::TccParticipant::new(Arc::clone(&registry), timer.handle(), aof.clone());
            let router = hkv_cluster::ClusterRouter::new(addr, peers, Arc::clone(&registry), tcc.clone(), Arc::new(crate::cluster::TcpPeerTransport), aof.clone());
            Cluster { router, tcc, _timer: timer }
        });
        ServerState { engine, pubsub, metrics, registry, cluster }
    }

    /// Dispatches one command, routing `DIRECT`/`PREPARE`/`COMMIT`/
    /// `ROLLBACK` (the internal cluster verbs) to the local TCC participant
    /// and routable data commands through the cluster router when this node
    /// runs in cluster mode.
    fn dispatch(&self, conn: &mut ConnectionState, conn_id: u64, name: &str, args: &[Vec<u8>]) -> Reply {
        let upper = name.to_ascii_uppercase();
        if let Some(cluster) = &self.cluster {
            if let Some(reply) = self.dispatch_peer_verb(cluster, &upper, args) {
                return reply;
            }
            if !conn.is_in_transaction() && self.touches_keys(&upper) {
                let db_index = conn.db_index();
                if let Some(db) = self.engine.database(db_index) {
                    return cluster.router.route(db, &upper, args);
                }
            }
        }
        self.engine.dispatch(conn, conn_id, &upper, args)
    }

    fn touches_keys(&self, name: &str) -> bool {
        self.registry.get(name).map(|spec| !matches!(spec.key_spec, KeySpec::None)).unwrap_or(false)
    }

    /// Internal peer-to-peer verbs always operate against database 0 — the
    /// cluster layer shares one logical keyspace across peers rather than
    /// routing per selected db.
    fn dispatch_peer_verb(&self, cluster: &Cluster, name: &str, args: &[Vec<u8>]) -> Option<Reply> {
        let db0 = self.engine.database(0)?;
        match name {
            "DIRECT" => {
                let (inner_name, rest) = args.split_first()?;
                let inner_name = String::from_utf8_lossy(inner_name).to_ascii_uppercase();
                let mut conn = ConnectionState::new();
                Some(self.engine.dispatch(&mut conn, 0, &inner_name, rest))
            }
            "PREPARE" => {
                let [tx_id, inner_name, rest @ ..] = args else { return Some(Reply::Error("ERR PREPARE requires <txId> <cmd> [args...]".to_string())) };
                let tx_id = std::str::from_utf8(tx_id).ok()?.parse::<u64>().ok()?;
                let inner_name = String::from_utf8_lossy(inner_name).to_ascii_uppercase();
                Some(cluster.tcc.prepare(db0, tx_id, &inner_name, rest))
            }
            "COMMIT" => {
                let tx_id = args.first()?;
                let tx_id = std::str::from_utf8(tx_id).ok()?.parse::<u64>().ok()?;
                Some(cluster.tcc.commit(tx_id))
            }
            "ROLLBACK" => {
                let tx_id = args.first()?;
                let tx_id = std::str::from_utf8(tx_id).ok()?.parse::<u64>().ok()?;
                Some(cluster.tcc.rollback(db0, tx_id))
            }
            _ => None,
        }
    }
}

/// Handles a single TCP client connection: reads RESP frames, dispatches
/// them, writes replies, and pumps pub/sub pushes onto the same socket.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let conn_id = next_conn_id();
    let (mut read_half, write_half) = stream.into_split();
    let write_half = Arc::new(AsyncMutex::new(write_half));

    let (push_tx, mut push_rx) = tokio::sync::mpsc::unbounded_channel();
    state.pubsub.register(conn_id, push_tx);

    let pump_write_half = Arc::clone(&write_half);
    let pump = tokio::spawn(async move {
        while let Some(message) = push_rx.recv().await {
            let frame = encode_pubsub_message(&message.channel, &message.payload);
            if pump_write_half.lock().await.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnectionState::new();
    let mut parser = RespParser::new();
    let mut raw = Vec::with_capacity(8 * 1024);

    let result = loop {
        match read_half.read_buf(&mut raw).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e),
        };

        loop {
            match parser.parse(&mut raw) {
                Ok(Some(args)) => {
                    if args.is_empty() {
                        continue;
                    }
                    let started = Instant::now();
                    state.metrics.record_request_start();
                    let name = String::from_utf8_lossy(&args[0]).into_owned();
                    let reply = state.dispatch(&mut conn, conn_id, &name, &args[1..]);
                    if reply.is_error() {
                        state.metrics.record_error();
                    }
                    state.metrics.record_request_end(started.elapsed());

                    let frame = encode_reply(&reply);
                    let mut writer = write_half.lock().await;
                    if writer.write_all(&frame).await.is_err() {
                        drop(writer);
                        break;
                    }
                }
                Ok(None) => break,
                Err(RespError::Protocol) => {
                    let frame = encode_reply(&Reply::Error("ERR Protocol error".to_string()));
                    let _ = write_half.lock().await.write_all(&frame).await;
                    break;
                }
            }
        }
    };

    pump.abort();
    state.pubsub.deregister(conn_id);
    result
}
