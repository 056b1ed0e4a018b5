//! # hkv-engine
//!
//! Purpose: the in-memory data engine — sharded storage, the sorted-set
//! skip list, the hashed-wheel expiry timer, and the command registry that
//! ties them together. Everything here is pure state and computation; RESP
//! framing, AOF persistence, and cluster routing are separate crates.

pub mod border;
pub mod commands;
pub mod database;
pub mod engine;
pub mod entity;
pub mod registry;
pub mod sharded_map;
pub mod skiplist;
pub mod sortedset;
pub mod timer;

pub use database::{current_millis, Database, TtlStatus};
pub use engine::{Engine, EngineConfig, TxnOutcome};
pub use entity::DataEntity;
pub use registry::{CommandRegistry, CommandSpec, KeySpec};
pub use sharded_map::{MultiKeyLock, ShardedMap};
pub use sortedset::{ScoredMember, SortedSet};
pub use timer::{TimeWheel, TimerHandle};
