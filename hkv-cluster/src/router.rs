//! # Cluster Router
//!
//! Purpose: routes an incoming command to the peer (or peers) that own its
//! keys (§4.8). A single-key command is forwarded directly with the
//! `Direct` sentinel so the receiver skips re-routing. A multi-key write
//! whose keys span more than one peer runs Try-Confirm-Cancel across every
//! peer it touches.
//!
//! ## Design Principles
//! 1. **Local Peer Is Just Another Peer**: if every key maps to `self`, the
//!    router dispatches locally instead of forwarding, but goes through the
//!    same grouping logic either way.

use std::collections::HashMap;
use std::sync::Arc;

use hkv_common::Reply;
use hkv_engine::engine::AofSink;
use hkv_engine::registry::{extract_keys, KeySpec};
use hkv_engine::{CommandRegistry, Database};

use crate::ring::HashRing;
use crate::snowflake::SnowflakeGenerator;
use crate::tcc::TccParticipant;

/// Collaborator the router asks to actually talk to a remote peer. Owned by
/// the transport layer (e.g. `hkv-server`'s connection pool); the router
/// itself knows nothing about sockets.
pub trait PeerTransport: Send + Sync {
    fn direct(&self, peer: &str, name: &str, args: &[Vec<u8>]) -> Reply;
    fn prepare(&self, peer: &str, tx_id: u64, name: &str, args: &[Vec<u8>]) -> Reply;
    fn commit(&self, peer: &str, tx_id: u64) -> Reply;
    fn rollback(&self, peer: &str, tx_id: u64) -> Reply;
}

pub struct ClusterRouter {
    ring: HashRing,
    local_addr: String,
    snowflake: SnowflakeGenerator,
    local_tcc: TccParticipant,
    registry: Arc<CommandRegistry>,
    transport: Arc<dyn PeerTransport>,
    aof: Option<Arc<dyn AofSink>>,
}

/// One peer's share of a multi-key command: which args it owns and whether
/// that peer is `self` (dispatched locally) or remote (sent over `transport`).
struct Shard {
    peer: String,
    args: Vec<Vec<u8>>,
}

impl ClusterRouter {
    pub fn new(
        local_addr: impl Into<String>,
        peers: impl IntoIterator<Item = impl Into<String>>,
        registry: Arc<CommandRegistry>,
        local_tcc: TccParticipant,
        transport: Arc<dyn PeerTransport>,
        aof: Option<Arc<dyn AofSink>>,
    ) -> Self {
        let local_addr = local_addr.into();
        let mut ring = HashRing::from_peers(peers);
        ring.add_peer(local_addr.clone());
        ClusterRouter {
            ring,
            snowflake: SnowflakeGenerator::new(&local_addr),
            local_addr,
            local_tcc,
            registry,
            transport,
            aof,
        }
    }

    /// Routes `name(args)` to its owning peer(s), running TCC when the keys
    /// span more than one. `db` is the local engine's database for the
    /// currently-selected index, used whenever this peer participates.
    pub fn route(&self, db: &Arc<Database>, name: &str, args: &[Vec<u8>]) -> Reply {
        let Some(spec) = self.registry.get(name) else {
            return Reply::Error(format!("ERR unknown command '{name}'"));
        };
        let (reads, writes) = extract_keys(&spec.key_spec, args);
        if reads.is_empty() && writes.is_empty() {
            return self.dispatch_local(db, name, args);
        }

        let shards = self.group_by_owner(&spec.key_spec, args);
        if shards.len() <= 1 {
            let peer = shards.first().map(|s| s.peer.as_str()).unwrap_or(&self.local_addr);
            return self.forward_single(db, peer, name, args);
        }

        self.run_tcc(db, name, shards)
    }

    fn forward_single(&self, db: &Arc<Database>, peer: &str, name: &str, args: &[Vec<u8>]) -> Reply {
        if peer == self.local_addr {
            self.dispatch_local(db, name, args)
        } else {
            self.transport.direct(peer, name, args)
        }
    }

    fn dispatch_local(&self, db: &Arc<Database>, name: &str, args: &[Vec<u8>]) -> Reply {
        let reply = self.registry.dispatch_one(db, name, args);
        if !reply.is_error() {
            self.append_to_aof(db, name, args);
        }
        reply
    }

    /// Mirrors the non-clustered `DIRECT`-forwarded path's AOF append
    /// (`hkv-server`'s `dispatch_live`): only writes with at least one write
    /// key are logged.
    fn append_to_aof(&self, db: &Arc<Database>, name: &str, args: &[Vec<u8>]) {
        let Some(sink) = &self.aof else { return };
        let Some(spec) = self.registry.get(name) else { return };
        let (_, writes) = extract_keys(&spec.key_spec, args);
        if writes.is_empty() {
            return;
        }
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(name.as_bytes().to_vec());
        full.extend_from_slice(args);
        sink.append(db.index, &full);
    }

    /// Splits `args` into per-peer shards honoring `key_spec`'s layout
    /// (single key, flat key list, or alternating key/value pairs), so a
    /// shard's `args` slice is always a valid argument list for `name` on
    /// its own.
    fn group_by_owner(&self, key_spec: &KeySpec, args: &[Vec<u8>]) -> Vec<Shard> {
        let mut buckets: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        let mut push = |key: &[u8], chunk: &[Vec<u8>]| {
            let peer = self.ring.owner(key).unwrap_or(&self.local_addr).to_string();
            let bucket = buckets.entry(peer.clone()).or_insert_with(|| {
                order.push(peer.clone());
                Vec::new()
            });
            bucket.extend(chunk.iter().cloned());
        };

        match key_spec {
            KeySpec::WriteAlternating(step) => {
                let step = (*step).max(1);
                for chunk in args.chunks(step) {
                    if let Some(key) = chunk.first() {
                        push(key, chunk);
                    }
                }
            }
            KeySpec::ReadAll | KeySpec::WriteAll => {
                for arg in args {
                    push(arg, std::slice::from_ref(arg));
                }
            }
            KeySpec::ReadFirst | KeySpec::WriteFirst => {
                if let Some(key) = args.first() {
                    push(key, args);
                }
            }
            KeySpec::None => {}
        }

        order.into_iter().map(|peer| Shard { args: buckets.remove(&peer).unwrap_or_default(), peer }).collect()
    }

    fn run_tcc(&self, db: &Arc<Database>, name: &str, shards: Vec<Shard>) -> Reply {
        let tx_id = self.snowflake.next_id();
        let mut prepared_peers: Vec<&Shard> = Vec::with_capacity(shards.len());
        let mut failure: Option<Reply> = None;

        for shard in &shards {
            let reply = if shard.peer == self.local_addr {
                self.local_tcc.prepare(db, tx_id, name, &shard.args)
            } else {
                self.transport.prepare(&shard.peer, tx_id, name, &shard.args)
            };
            if reply.is_error() {
                failure = Some(reply);
                break;
            }
            prepared_peers.push(shard);
        }

        if let Some(failure) = failure {
            for shard in &prepared_peers {
                self.rollback_one(db, tx_id, &shard.peer);
            }
            return failure;
        }

        for shard in &shards {
            self.commit_one(db, tx_id, &shard.peer);
        }
        Reply::ok()
    }

    fn commit_one(&self, db: &Arc<Database>, tx_id: u64, peer: &str) -> Reply {
        if peer == self.local_addr {
            let _ = db;
            self.local_tcc.commit(tx_id)
        } else {
            self.transport.commit(peer, tx_id)
        }
    }

    fn rollback_one(&self, db: &Arc<Database>, tx_id: u64, peer: &str) -> Reply {
        if peer == self.local_addr {
            self.local_tcc.rollback(db, tx_id)
        } else {
            self.transport.rollback(peer, tx_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_engine::TimeWheel;
    use std::time::Duration;

    struct NullTransport;
    impl PeerTransport for NullTransport {
        fn direct(&self, _peer: &str, _name: &str, _args: &[Vec<u8>]) -> Reply {
            Reply::Error("ERR no remote peers in this test".to_string())
        }
        fn prepare(&self, _peer: &str, _tx_id: u64, _name: &str, _args: &[Vec<u8>]) -> Reply {
            Reply::Error("ERR no remote peers in this test".to_string())
        }
        fn commit(&self, _peer: &str, _tx_id: u64) -> Reply {
            Reply::Integer(0)
        }
        fn rollback(&self, _peer: &str, _tx_id: u64) -> Reply {
            Reply::Integer(0)
        }
    }

    fn single_node_router() -> (ClusterRouter, Arc<Database>) {
        let wheel = TimeWheel::start(Duration::from_millis(10), 64);
        let registry = Arc::new(CommandRegistry::with_builtin_commands());
        let db = Database::new(0, 4, wheel.handle());
        let tcc = TccParticipant::new(Arc::clone(&registry), wheel.handle(), None);
        let router =
            ClusterRouter::new("self:1", Vec::<String>::new(), registry, tcc, Arc::new(NullTransport), None);
        std::mem::forget(wheel);
        (router, db)
    }

    #[test]
    fn single_peer_commands_dispatch_locally() {
        let (router, db) = single_node_router();
        let reply = router.route(&db, "SET", &[b"k".to_vec(), b"v".to_vec()]);
        assert!(!reply.is_error());
        let get = router.route(&db, "GET", &[b"k".to_vec()]);
        assert_eq!(get, Reply::Bulk(Some(b"v".to_vec())));
    }

    #[test]
    fn mset_on_a_single_node_ring_runs_as_one_local_shard() {
        let (router, db) = single_node_router();
        let reply = router.route(&db, "MSET", &[b"a".to_vec(), b"1".to_vec(), b"b".to_vec(), b"2".to_vec()]);
        assert!(!reply.is_error());
        assert_eq!(router.route(&db, "GET", &[b"a".to_vec()]), Reply::Bulk(Some(b"1".to_vec())));
        assert_eq!(router.route(&db, "GET", &[b"b".to_vec()]), Reply::Bulk(Some(b"2".to_vec())));
    }
}
