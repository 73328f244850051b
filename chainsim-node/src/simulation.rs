//! simulation.rs
//!
//! Owns every node, the wallets, the simulated network and the single
//! consensus engine shared by all nodes, and drives them on one global clock.
//!
//! Each tick first delivers every due message to its destination's engine
//! handler, then runs `on_tick` once per node. Nothing else mutates node state
//! except the administrative operations below.

use std::{collections::BTreeMap, f64::consts::TAU, sync::Arc, time::Duration};

use chainsim_common::{error::Result, genesis::GenesisState, NodeId, Transaction, TxState};
use chainsim_consensus::{create_engine, engine_from_name, ConsensusEngine, PbftEngine, PosEngine, PowEngine, RaftEngine};
use chainsim_ledger::Node;
use chainsim_p2p::{Network, NetworkStats};
use tracing::{debug, info, warn};

use crate::{
    config::SimConfig,
    snapshot::{NodeSnapshot, SimulationSnapshot, WalletSnapshot},
    wallet::Wallet,
};

const LAYOUT_CENTER: (f64, f64) = (400.0, 300.0);
const LAYOUT_RADIUS: f64 = 200.0;
/// Peers a new node gets when the topology is not a full mesh.
const SPARSE_PEERS: usize = 2;

pub struct Simulation {
    config: SimConfig,
    engine: Arc<dyn ConsensusEngine>,
    network: Network,
    nodes: BTreeMap<NodeId, Node>,
    wallets: BTreeMap<String, Wallet>,
    genesis: GenesisState,
    now: u64,
    next_node: u64,
    next_wallet: u64,
}

impl Simulation {
    /// Builds `node_count` nodes laid out on a circle, one funded wallet each.
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let engine = create_engine(config.consensus_kind()?, config.params.clone());
        let network = Network::new(config.network.clone());

        let mut sim = Self {
            config,
            engine,
            network,
            nodes: BTreeMap::new(),
            wallets: BTreeMap::new(),
            genesis: GenesisState::new(),
            now: 0,
            next_node: 0,
            next_wallet: 0,
        };

        let count = sim.config.node_count;
        let ids: Vec<NodeId> = (0..count).map(|_| sim.allocate_node_id()).collect();
        for id in &ids {
            sim.allocate_wallet(id.clone());
        }
        sim.genesis = sim.genesis_for_wallets();

        for (i, id) in ids.iter().enumerate() {
            let angle = TAU * i as f64 / count.max(1) as f64;
            let node = Node::new(id.clone(), sim.genesis.clone()).with_position(
                LAYOUT_CENTER.0 + LAYOUT_RADIUS * angle.cos(),
                LAYOUT_CENTER.1 + LAYOUT_RADIUS * angle.sin(),
            );
            sim.network.register_node(id.clone());
            sim.nodes.insert(id.clone(), node);
        }
        sim.wire_initial_topology();
        for node in sim.nodes.values_mut() {
            sim.engine.init(node, &mut sim.network);
        }

        info!(
            "🚀 Simulation ready: {} nodes under {} (delay {}-{}ms, loss {})",
            count,
            sim.engine.kind(),
            sim.config.network.min_delay,
            sim.config.network.max_delay,
            sim.config.network.packet_loss
        );
        Ok(sim)
    }

    fn allocate_node_id(&mut self) -> NodeId {
        let id = NodeId(format!("node-{}", self.next_node));
        self.next_node += 1;
        id
    }

    fn allocate_wallet(&mut self, node_id: NodeId) -> String {
        let id = format!("wallet-{}", self.next_wallet);
        self.next_wallet += 1;
        self.wallets.insert(id.clone(), Wallet::new(id.clone(), node_id));
        id
    }

    fn genesis_for_wallets(&self) -> GenesisState {
        self.wallets
            .values()
            .fold(GenesisState::new(), |g, w| g.with_allocation(&w.address, self.config.initial_balance))
    }

    fn wire_initial_topology(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        let n = ids.len();
        if n < 2 {
            return;
        }
        if self.config.full_mesh {
            for a in &ids {
                for b in &ids {
                    self.connect_nodes(a, b);
                }
            }
        } else {
            for i in 0..n {
                let (a, b) = (&ids[i], &ids[(i + 1) % n]);
                self.connect_nodes(a, b);
            }
        }
    }

    // ---- clock ----

    /// Delivers due messages, then runs every node's background work.
    /// Returns how many messages were delivered.
    pub fn tick(&mut self, now: u64) -> usize {
        let now = now.max(self.now);
        self.now = now;

        let delivered = self.network.tick(now);
        for msg in &delivered {
            match self.nodes.get_mut(&msg.to) {
                Some(node) => self.engine.on_message(node, msg, &mut self.network),
                None => debug!("📭 No node {} for {} #{}", msg.to, msg.msg_type, msg.id),
            }
        }
        for node in self.nodes.values_mut() {
            self.engine.on_tick(node, now, &mut self.network);
        }
        delivered.len()
    }

    /// Advances the clock by one configured tick interval.
    pub fn step(&mut self) -> usize {
        let next = self.now + self.config.tick_interval_ms;
        self.tick(next)
    }

    pub fn run_ticks(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.step();
        }
    }

    /// Wall-clock period between driver ticks.
    pub fn tick_interval(&self) -> Duration {
        self.config.tick_interval()
    }

    // ---- topology ----

    /// Adds a node at `(x, y)` with its own (unfunded) wallet and returns its id.
    ///
    /// It connects to every node in a full mesh, otherwise to its nearest nodes.
    pub fn add_node(&mut self, x: f64, y: f64) -> NodeId {
        let id = self.allocate_node_id();
        let mut node = Node::new(id.clone(), self.genesis.clone()).with_position(x, y);

        let peers: Vec<NodeId> = if self.config.full_mesh {
            self.nodes.keys().cloned().collect()
        } else {
            let mut by_distance: Vec<(f64, NodeId)> = self
                .nodes
                .values()
                .map(|n| ((n.position.0 - x).hypot(n.position.1 - y), n.id.clone()))
                .collect();
            by_distance.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            by_distance.into_iter().take(SPARSE_PEERS).map(|(_, id)| id).collect()
        };

        self.network.register_node(id.clone());
        for peer in &peers {
            if let Some(other) = self.nodes.get_mut(peer) {
                other.peers.insert(id.clone());
                node.peers.insert(peer.clone());
            }
        }
        self.engine.init(&mut node, &mut self.network);
        self.nodes.insert(id.clone(), node);
        self.allocate_wallet(id.clone());

        info!("➕ Added {} at ({:.0}, {:.0}) with {} peers", id, x, y, peers.len());
        id
    }

    /// Removes a node. Messages still in flight to it are discarded on delivery.
    pub fn remove_node(&mut self, id: &NodeId) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        self.network.unregister_node(id);
        for node in self.nodes.values_mut() {
            node.peers.remove(id);
        }
        self.wallets.retain(|_, w| w.node_id != *id);
        self.engine.on_node_removed(id);
        info!("➖ Removed {}", id);
        true
    }

    pub fn connect_nodes(&mut self, a: &NodeId, b: &NodeId) -> bool {
        if a == b || !self.nodes.contains_key(a) || !self.nodes.contains_key(b) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(a) {
            node.peers.insert(b.clone());
        }
        if let Some(node) = self.nodes.get_mut(b) {
            node.peers.insert(a.clone());
        }
        true
    }

    pub fn disconnect_nodes(&mut self, a: &NodeId, b: &NodeId) -> bool {
        let mut changed = false;
        if let Some(node) = self.nodes.get_mut(a) {
            changed |= node.peers.remove(b);
        }
        if let Some(node) = self.nodes.get_mut(b) {
            changed |= node.peers.remove(a);
        }
        changed
    }

    // ---- wallets & transactions ----

    /// Creates an unfunded wallet submitting through `node_id`.
    pub fn add_wallet(&mut self, node_id: &NodeId) -> Option<String> {
        if !self.nodes.contains_key(node_id) {
            return None;
        }
        Some(self.allocate_wallet(node_id.clone()))
    }

    /// Signs and submits a transfer from `wallet_id` through its node.
    ///
    /// `to` may be a wallet id or a raw address. Returns the transaction if
    /// the node admitted it; unknown wallets and rejections yield `None`.
    pub fn send_transaction(&mut self, wallet_id: &str, to: &str, amount: u64) -> Option<Transaction> {
        let Some(wallet) = self.wallets.get(wallet_id) else {
            debug!("Unknown wallet {}", wallet_id);
            return None;
        };
        let from = wallet.address.clone();
        let node_id = wallet.node_id.clone();
        let to_address = self.wallets.get(to).map(|w| w.address.clone()).unwrap_or_else(|| to.to_string());

        let node = self.nodes.get_mut(&node_id)?;
        let nonce = node.ledger().expected_nonce(&from) + node.mempool.pending_from(&from);
        let tx = Transaction::signed(&from, &to_address, amount, nonce, self.now);

        if !self.engine.on_tx(node, tx.clone(), &mut self.network) {
            warn!("⚠️ {} rejected tx from {} (amount {}, nonce {})", node_id, wallet_id, amount, nonce);
            return None;
        }
        if let Some(wallet) = self.wallets.get_mut(wallet_id) {
            wallet.next_nonce = nonce + 1;
        }
        info!("💸 {} -> {}: {} (tx {}, via {})", wallet_id, to_address, amount, tx.id, node_id);
        tracing::info!(target: "consensus", "EVENT:TX_SUBMIT tx={} node={} amount={}", tx.id, node_id, amount);
        Some(tx)
    }

    // ---- engine administration ----

    pub fn set_mining(&mut self, id: &NodeId, mining: bool) -> bool {
        let (Some(pow), Some(node)) = (self.engine.as_any().downcast_ref::<PowEngine>(), self.nodes.get_mut(id)) else {
            return false;
        };
        pow.set_mining(node, mining);
        true
    }

    pub fn set_hash_power(&mut self, id: &NodeId, hash_power: u64) -> bool {
        let (Some(pow), Some(node)) = (self.engine.as_any().downcast_ref::<PowEngine>(), self.nodes.get_mut(id)) else {
            return false;
        };
        pow.set_hash_power(node, hash_power);
        true
    }

    /// Zero stake removes the node from the validator set.
    pub fn set_stake(&mut self, id: &NodeId, stake: u64) -> bool {
        let (Some(pos), Some(node)) = (self.engine.as_any().downcast_ref::<PosEngine>(), self.nodes.get_mut(id)) else {
            return false;
        };
        pos.set_stake(node, stake);
        true
    }

    pub fn force_election_timeout(&mut self, id: &NodeId) -> bool {
        let (Some(raft), Some(node)) = (self.engine.as_any().downcast_ref::<RaftEngine>(), self.nodes.get_mut(id)) else {
            return false;
        };
        raft.force_election_timeout(node, self.now, &mut self.network);
        true
    }

    /// Administrative PBFT view change applied to every node at once.
    pub fn change_view(&mut self) -> Option<u64> {
        let pbft = self.engine.as_any().downcast_ref::<PbftEngine>()?;
        Some(pbft.change_view(self.nodes.values_mut(), self.now))
    }

    /// Replaces the engine and restarts every node from genesis, keeping
    /// positions, peers and wallets. Unknown kinds fail without changing anything.
    pub fn switch_consensus(&mut self, name: &str) -> Result<()> {
        let engine = engine_from_name(name, self.config.params.clone())?;
        let previous = self.engine.kind();

        self.engine = engine;
        self.config.consensus = name.to_lowercase();
        self.network.clear_in_flight();
        self.genesis = self.genesis_for_wallets();
        for wallet in self.wallets.values_mut() {
            wallet.next_nonce = 0;
        }

        let old = std::mem::take(&mut self.nodes);
        for (id, old_node) in old {
            let mut node = Node::new(id.clone(), self.genesis.clone())
                .with_position(old_node.position.0, old_node.position.1);
            node.peers = old_node.peers;
            self.engine.init(&mut node, &mut self.network);
            self.nodes.insert(id, node);
        }

        info!("🔀 Switched consensus {} -> {}", previous, self.engine.kind());
        tracing::info!(target: "consensus", "EVENT:SWITCH from={} to={}", previous, self.engine.kind());
        Ok(())
    }

    // ---- network tuning ----

    pub fn set_delay(&mut self, min_delay: u64, max_delay: u64) {
        self.network.set_delay(min_delay, max_delay);
        self.config.network = self.network.config().clone();
    }

    pub fn set_packet_loss(&mut self, packet_loss: f64) {
        self.network.set_packet_loss(packet_loss);
        self.config.network = self.network.config().clone();
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.network.stats()
    }

    // ---- queries ----

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn ConsensusEngine> {
        &self.engine
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn wallet(&self, id: &str) -> Option<&Wallet> {
        self.wallets.get(id)
    }

    pub fn wallets(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }

    pub fn tx_state(&self, node_id: &NodeId, tx_id: &str) -> Option<TxState> {
        self.nodes.get(node_id)?.tx_state(tx_id)
    }

    pub fn is_finalized(&self, node_id: &NodeId, block_id: &str) -> bool {
        self.nodes
            .get(node_id)
            .map(|n| self.engine.is_finalized(n, block_id))
            .unwrap_or(false)
    }

    pub fn role(&self, node_id: &NodeId) -> Option<String> {
        let node = self.nodes.get(node_id)?;
        Some(self.engine.role_with_network(node, &self.network))
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let nodes = self
            .nodes
            .values()
            .map(|n| NodeSnapshot {
                id: n.id.clone(),
                position: n.position,
                head_id: n.head_id().to_string(),
                head_height: n.head_height(),
                finalized_id: n.finalized_id().to_string(),
                finalized_height: n.finalized_height(),
                mempool_size: n.mempool.len(),
                role: self.engine.role_with_network(n, &self.network),
                peers: n.peers.iter().cloned().collect(),
                ui: self.engine.ui_state(n),
            })
            .collect();

        let wallets = self
            .wallets
            .iter()
            .map(|(id, w)| {
                let balance = self.nodes.get(&w.node_id).map(|n| n.ledger().balance(&w.address)).unwrap_or(0);
                (id.clone(), WalletSnapshot { wallet: w.clone(), balance })
            })
            .collect();

        SimulationSnapshot {
            now: self.now,
            consensus: self.engine.kind().to_string(),
            nodes,
            messages: self.network.message_views(),
            wallets,
            network: self.network.stats(),
        }
    }
}
