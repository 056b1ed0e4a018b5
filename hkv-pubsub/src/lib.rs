//! # Channel Hub
//!
//! Purpose: back `SUBSCRIBE`/`UNSUBSCRIBE`/`PUBLISH`. A channel-indexed
//! sharded map from channel name to its subscriber list, sharded by channel
//! name with its own lock array so publishes to different channels never
//! contend.
//!
//! ## Design Principles
//! 1. **Registration Is Separate From Subscription**: a connection registers
//!    its outbound sender once (`register`) and from then on `subscribe`/
//!    `unsubscribe` only touch the channel → subscriber-id lists; this keeps
//!    `hkv_engine::engine::PubSubHub` (which only sees channel + connection
//!    id) decoupled from the transport-level sender type.
//! 2. **Best-Effort Publish**: a send failure (receiver dropped) is treated
//!    as the subscriber having gone away; it's removed in the same pass, and
//!    earlier successful sends are not rolled back.

use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use hkv_engine::engine::PubSubHub;

/// One message delivered to a subscribed connection, carrying enough to
/// build the Redis 3-element pub/sub envelope (`message`, channel, payload).
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

struct Subscriber {
    conn_id: u64,
    sender: UnboundedSender<PubSubMessage>,
}

fn shard_index(channel: &str, mask: usize) -> usize {
    (hkv_common::fnv1a32(channel.as_bytes()) as usize) & mask
}

/// Sharded channel → subscriber-list map, plus a flat conn-id → sender
/// registry used to resolve `subscribe(channel, conn_id)` calls.
pub struct ChannelHub {
    shards: Vec<RwLock<HashMap<String, Vec<Subscriber>>>>,
    mask: usize,
    senders: RwLock<HashMap<u64, UnboundedSender<PubSubMessage>>>,
}

impl ChannelHub {
    pub fn new(shard_count: usize) -> Self {
        let shard_count = hkv_common::normalize_shard_count(shard_count);
        let shards = (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect();
        ChannelHub { shards, mask: shard_count - 1, senders: RwLock::new(HashMap::new()) }
    }

    /// Registers a connection's outbound channel; must be called before any
    /// `subscribe` call on its behalf. Re-registering replaces the sender.
    pub fn register(&self, conn_id: u64, sender: UnboundedSender<PubSubMessage>) {
        self.senders.write().insert(conn_id, sender);
    }

    /// Drops a connection's sender and removes it from every channel it was
    /// subscribed to; called when the connection closes.
    pub fn deregister(&self, conn_id: u64) {
        self.senders.write().remove(&conn_id);
        for shard in &self.shards {
            let mut table = shard.write();
            table.retain(|_, subs| {
                subs.retain(|s| s.conn_id != conn_id);
                !subs.is_empty()
            });
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let shard = &self.shards[shard_index(channel, self.mask)];
        shard.read().get(channel).map(Vec::len).unwrap_or(0)
    }
}

impl PubSubHub for ChannelHub {
    fn subscribe(&self, channel: &str, conn_id: u64) {
        let Some(sender) = self.senders.read().get(&conn_id).cloned() else {
            return;
        };
        let shard = &self.shards[shard_index(channel, self.mask)];
        let mut table = shard.write();
        let subs = table.entry(channel.to_string()).or_insert_with(Vec::new);
        if !subs.iter().any(|s| s.conn_id == conn_id) {
            subs.push(Subscriber { conn_id, sender });
        }
    }

    fn unsubscribe(&self, channel: &str, conn_id: u64) {
        let shard = &self.shards[shard_index(channel, self.mask)];
        let mut table = shard.write();
        if let Some(subs) = table.get_mut(channel) {
            subs.retain(|s| s.conn_id != conn_id);
            if subs.is_empty() {
                table.remove(channel);
            }
        }
    }

    fn publish(&self, channel: &str, message: &[u8]) -> u64 {
        let shard = &self.shards[shard_index(channel, self.mask)];
        let mut table = shard.write();
        let Some(subs) = table.get_mut(channel) else {
            return 0;
        };
        let mut delivered = 0u64;
        subs.retain(|sub| {
            let ok = sub
                .sender
                .send(PubSubMessage { channel: channel.to_string(), payload: message.to_vec() })
                .is_ok();
            if ok {
                delivered += 1;
            }
            ok
        });
        if subs.is_empty() {
            table.remove(channel);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn publish_delivers_to_every_subscriber_and_counts_them() {
        let hub = ChannelHub::new(4);
        let (tx1, mut rx1) = unbounded_channel();
        let (tx2, mut rx2) = unbounded_channel();
        hub.register(1, tx1);
        hub.register(2, tx2);
        hub.subscribe("news", 1);
        hub.subscribe("news", 2);

        let delivered = hub.publish("news", b"hello");
        assert_eq!(delivered, 2);
        assert_eq!(rx1.try_recv().unwrap().payload, b"hello");
        assert_eq!(rx2.try_recv().unwrap().payload, b"hello");
    }

    #[test]
    fn unsubscribe_removes_channel_entry_once_empty() {
        let hub = ChannelHub::new(2);
        let (tx, _rx) = unbounded_channel();
        hub.register(1, tx);
        hub.subscribe("a", 1);
        assert_eq!(hub.subscriber_count("a"), 1);
        hub.unsubscribe("a", 1);
        assert_eq!(hub.subscriber_count("a"), 0);
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_publish() {
        let hub = ChannelHub::new(2);
        let (tx, rx) = unbounded_channel();
        hub.register(1, tx);
        hub.subscribe("a", 1);
        drop(rx);
        let delivered = hub.publish("a", b"x");
        assert_eq!(delivered, 0);
        assert_eq!(hub.subscriber_count("a"), 0);
    }

    #[test]
    fn deregister_clears_subscriptions_across_channels() {
        let hub = ChannelHub::new(2);
        let (tx, _rx) = unbounded_channel();
        hub.register(7, tx);
        hub.subscribe("a", 7);
        hub.subscribe("b", 7);
        hub.deregister(7);
        assert_eq!(hub.subscriber_count("a"), 0);
        assert_eq!(hub.subscriber_count("b"), 0);
    }
}
