//! Minimal in-crate cluster used by the engine tests.

use std::{collections::BTreeMap, sync::Arc};

use chainsim_common::{genesis::GenesisState, NodeId, Transaction};
use chainsim_ledger::Node;
use chainsim_p2p::{Network, NetworkConfig};

use crate::consensus::ConsensusEngine;

pub(crate) struct Cluster {
    pub nodes: BTreeMap<NodeId, Node>,
    pub network: Network,
    pub engine: Arc<dyn ConsensusEngine>,
    pub now: u64,
}

impl Cluster {
    /// `n` fully meshed nodes n0..n{n-1}; every address starts with 1000.
    pub fn new(n: usize, engine: Arc<dyn ConsensusEngine>) -> Self {
        let mut network = Network::new(NetworkConfig {
            min_delay: 10,
            max_delay: 50,
            packet_loss: 0.0,
            seed: Some(7),
        });
        let ids: Vec<NodeId> = (0..n).map(|i| NodeId(format!("n{}", i))).collect();
        let mut genesis = GenesisState::new();
        for id in &ids {
            genesis = genesis.with_allocation(&addr(id), 1_000);
        }

        let mut nodes = BTreeMap::new();
        for id in &ids {
            network.register_node(id.clone());
            let mut node = Node::new(id.clone(), genesis.clone());
            node.peers = ids.iter().filter(|p| *p != id).cloned().collect();
            nodes.insert(id.clone(), node);
        }
        for node in nodes.values_mut() {
            engine.init(node, &mut network);
        }

        Self { nodes, network, engine, now: 0 }
    }

    pub fn id(i: usize) -> NodeId {
        NodeId(format!("n{}", i))
    }

    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[&Self::id(i)]
    }

    pub fn node_mut(&mut self, i: usize) -> &mut Node {
        self.nodes.get_mut(&Self::id(i)).expect("node exists")
    }

    /// Delivers due messages, then ticks every node.
    pub fn step(&mut self, dt: u64) {
        self.now += dt;
        for msg in self.network.tick(self.now) {
            if let Some(node) = self.nodes.get_mut(&msg.to) {
                self.engine.on_message(node, &msg, &mut self.network);
            }
        }
        for node in self.nodes.values_mut() {
            self.engine.on_tick(node, self.now, &mut self.network);
        }
    }

    pub fn run(&mut self, steps: usize, dt: u64) {
        for _ in 0..steps {
            self.step(dt);
        }
    }

    /// Signs a transfer from node `i`'s address with nonce `nonce` and submits it there.
    pub fn submit(&mut self, i: usize, to: &str, amount: u64, nonce: u64) -> Transaction {
        let from = addr(&Self::id(i));
        let tx = Transaction::signed(&from, to, amount, nonce, self.now);
        let engine = self.engine.clone();
        let node = self.nodes.get_mut(&Self::id(i)).expect("node exists");
        assert!(engine.on_tx(node, tx.clone(), &mut self.network));
        tx
    }
}

pub(crate) fn addr(id: &NodeId) -> String {
    format!("addr-{}", id)
}

