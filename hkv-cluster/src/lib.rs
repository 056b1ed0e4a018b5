//! # hkv-cluster
//!
//! Purpose: sharded-cluster routing on top of `hkv-engine`'s single-node
//! command registry — the consistent-hash ring, snowflake transaction ids,
//! the TCC participant state machine, and the router that ties them
//! together. Wire transport to remote peers is left to a collaborator
//! ([`router::PeerTransport`]) supplied by `hkv-server`.

pub mod ring;
pub mod router;
pub mod snowflake;
pub mod tcc;

pub use ring::HashRing;
pub use router::{ClusterRouter, PeerTransport};
pub use snowflake::SnowflakeGenerator;
pub use tcc::{TccParticipant, TxState};
