//! network.rs
//!
//! Simulated unreliable transport. Every send draws a delay from
//! `[min_delay, max_delay]` and independently decides whether the message is
//! lost. Surviving messages wait in a FIFO queue until the clock reaches their
//! `deliver_at`.
//!
//! Delivery is the only path by which one node's state can influence another's.

use std::collections::BTreeSet;

use chainsim_common::NodeId;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::NetworkConfig,
    message::{MessagePayload, MessageView, NetworkMessage},
};

/// Result of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued { id: u64, deliver_at: u64 },
    Dropped,
}

impl SendOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, SendOutcome::Dropped)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
    /// Due messages whose destination had left the registry.
    pub discarded: u64,
}

pub struct Network {
    config: NetworkConfig,
    registry: BTreeSet<NodeId>,
    in_flight: Vec<NetworkMessage>,
    next_id: u64,
    now: u64,
    rng: StdRng,
    stats: NetworkStats,
}

impl Network {
    pub fn new(config: NetworkConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            registry: BTreeSet::new(),
            in_flight: Vec::new(),
            next_id: 1,
            now: 0,
            rng,
            stats: NetworkStats::default(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Current simulated time, as of the last `tick`.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    pub fn set_delay(&mut self, min_delay: u64, max_delay: u64) {
        self.config.min_delay = min_delay.min(max_delay);
        self.config.max_delay = min_delay.max(max_delay);
    }

    pub fn set_packet_loss(&mut self, packet_loss: f64) {
        self.config.packet_loss = packet_loss.clamp(0.0, 1.0);
    }

    // ---- registry ----

    pub fn register_node(&mut self, id: NodeId) -> bool {
        self.registry.insert(id)
    }

    pub fn unregister_node(&mut self, id: &NodeId) -> bool {
        self.registry.remove(id)
    }

    pub fn is_registered(&self, id: &NodeId) -> bool {
        self.registry.contains(id)
    }

    /// Registered node ids in sorted order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry.iter().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.registry.len()
    }

    // ---- sending ----

    pub fn send(&mut self, from: &NodeId, to: &NodeId, payload: MessagePayload) -> SendOutcome {
        let delay = self.random_range(self.config.min_delay, self.config.max_delay);
        let lost = self.config.packet_loss > 0.0 && self.rng.gen::<f64>() < self.config.packet_loss;
        self.stats.sent += 1;

        let msg_type = payload.message_type();
        if lost {
            self.stats.dropped += 1;
            trace!("📉 Dropped {} {} -> {}", msg_type, from, to);
            return SendOutcome::Dropped;
        }

        let id = self.next_id;
        self.next_id += 1;
        let deliver_at = self.now + delay;
        self.in_flight.push(NetworkMessage {
            id,
            msg_type,
            from: from.clone(),
            to: to.clone(),
            payload,
            created_at: self.now,
            deliver_at,
            total_delay: delay,
        });
        SendOutcome::Queued { id, deliver_at }
    }

    /// Sends `payload` to every id in `peers`, skipping the sender and `exclude`.
    pub fn broadcast<'a>(
        &mut self,
        from: &NodeId,
        peers: impl IntoIterator<Item = &'a NodeId>,
        payload: MessagePayload,
        exclude: Option<&NodeId>,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for peer in peers {
            if peer == from || Some(peer) == exclude {
                continue;
            }
            match self.send(from, peer, payload.clone()) {
                SendOutcome::Queued { .. } => report.queued += 1,
                SendOutcome::Dropped => report.dropped += 1,
            }
        }
        report
    }

    /// Like `broadcast`, addressed to every registered node.
    pub fn broadcast_all(&mut self, from: &NodeId, payload: MessagePayload, exclude: Option<&NodeId>) -> BroadcastReport {
        let targets = self.node_ids();
        self.broadcast(from, targets.iter(), payload, exclude)
    }

    // ---- delivery ----

    /// Advances the clock and returns messages now due, in FIFO order.
    ///
    /// Due messages addressed to unregistered nodes are discarded.
    pub fn tick(&mut self, now: u64) -> Vec<NetworkMessage> {
        self.now = now;
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.in_flight)
            .into_iter()
            .partition(|m| m.deliver_at <= now);
        self.in_flight = waiting;

        let mut delivered = Vec::with_capacity(due.len());
        for msg in due {
            if self.registry.contains(&msg.to) {
                self.stats.delivered += 1;
                delivered.push(msg);
            } else {
                self.stats.discarded += 1;
                debug!("📭 Discarding {} for unregistered node {}", msg.msg_type, msg.to);
            }
        }
        delivered
    }

    pub fn in_flight(&self) -> &[NetworkMessage] {
        &self.in_flight
    }

    pub fn message_views(&self) -> Vec<MessageView> {
        self.in_flight.iter().map(|m| MessageView::of(m, self.now)).collect()
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight.clear();
    }

    // ---- randomness shared with engines ----

    /// Uniform draw from the inclusive range; bounds may come in either order.
    pub fn random_range(&mut self, lo: u64, hi: u64) -> u64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        self.rng.gen_range(lo..=hi)
    }

    pub fn random_u64(&mut self) -> u64 {
        self.rng.gen()
    }
}
