use chainsim_common::{env::consensus::RaftRole, NodeId, TxState};
use chainsim_node::{SimConfig, Simulation};
use chainsim_p2p::NetworkConfig;

fn config(consensus: &str, seed: u64) -> SimConfig {
    SimConfig {
        consensus: consensus.to_string(),
        network: NetworkConfig { seed: Some(seed), ..Default::default() },
        ..Default::default()
    }
}

fn ids(sim: &Simulation) -> Vec<NodeId> {
    sim.node_ids()
}

#[test]
fn pow_single_miner_converges_and_finalizes() {
    let mut c = config("pow", 1);
    c.params.difficulty = 2;
    c.params.confirmations = 1;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);
    for id in &nodes[1..] {
        assert!(sim.set_mining(id, false));
    }

    let tx = sim.send_transaction("wallet-1", "wallet-2", 25).unwrap();
    sim.run_ticks(150);

    let head = sim.node(&nodes[0]).unwrap().head_id().to_string();
    let mined_in: Vec<_> = sim
        .node(&nodes[0])
        .unwrap()
        .get_chain(&head)
        .into_iter()
        .filter(|b| b.contains_tx(&tx.id))
        .map(|b| b.producer_id.clone())
        .collect();
    assert_eq!(mined_in, vec![nodes[0].clone()]);

    for id in &nodes {
        let node = sim.node(id).unwrap();
        assert_eq!(node.head_id(), head, "{} head", id);
        assert_eq!(sim.tx_state(id, &tx.id), Some(TxState::Finalized), "{} tx", id);
        assert!(sim.is_finalized(id, &head));
    }

    let snap = sim.snapshot();
    let receiver = &snap.wallets["wallet-2"];
    assert_eq!(receiver.balance, 1_025);
}

#[test]
fn pow_all_miners_converge_and_finalize() {
    for seed in 0..6 {
        let mut sim = Simulation::new(config("pow", seed)).unwrap();
        let nodes = ids(&sim);

        // Every miner races on the same transaction; same-height forks are expected.
        let first = sim.send_transaction("wallet-1", "wallet-3", 10).unwrap();
        sim.run_ticks(100);
        for id in &nodes {
            assert_eq!(sim.tx_state(id, &first.id), Some(TxState::Finalized), "seed {} {}", seed, id);
        }

        // One more block on top of any branch is strictly longer and pulls everyone over.
        for id in &nodes[1..] {
            sim.set_mining(id, false);
        }
        let second = sim.send_transaction("wallet-0", "wallet-2", 5).unwrap();
        sim.run_ticks(100);

        let head = sim.node(&nodes[0]).unwrap().head_id().to_string();
        for id in &nodes {
            let node = sim.node(id).unwrap();
            assert_eq!(node.head_id(), head, "seed {} {} head", seed, id);
            assert_eq!(node.finalized_id(), head, "seed {} {} finalized", seed, id);
            assert_eq!(node.tx_state(&second.id), Some(TxState::Finalized));
            let chain = node.get_chain(&head);
            assert_eq!(chain.iter().filter(|b| b.contains_tx(&first.id)).count(), 1);
            let replayed = chainsim_ledger::Ledger::replay(node.genesis_state(), chain);
            assert_eq!(&replayed, node.ledger());
        }
    }
}

#[test]
fn raft_forced_election_elects_one_leader() {
    let mut c = config("raft", 3);
    c.network.min_delay = 20;
    c.network.max_delay = 60;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);
    let candidate = nodes[1].clone();

    assert!(sim.force_election_timeout(&candidate));
    // Enough for vote round-trip plus one heartbeat (500ms).
    sim.run_ticks(7);

    let mut leaders = Vec::new();
    for id in &nodes {
        let state = sim.node(id).unwrap().consensus().unwrap().as_raft().unwrap().clone();
        assert_eq!(state.term, 1, "{} term", id);
        assert_eq!(state.leader_id.as_ref(), Some(&candidate), "{} leader", id);
        if state.role == RaftRole::Leader {
            leaders.push(id.clone());
        }
    }
    assert_eq!(leaders, vec![candidate.clone()]);
    assert!(sim.role(&candidate).unwrap().starts_with("Leader"));
}

#[test]
fn raft_replicates_transactions_to_every_follower() {
    let mut c = config("raft", 4);
    c.network.min_delay = 20;
    c.network.max_delay = 60;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);
    sim.force_election_timeout(&nodes[0]);
    sim.run_ticks(5);

    let tx = sim.send_transaction("wallet-3", "wallet-0", 40).unwrap();
    sim.run_ticks(40);

    let head = sim.node(&nodes[0]).unwrap().head_id().to_string();
    for id in &nodes {
        assert_eq!(sim.node(id).unwrap().head_id(), head);
        assert_eq!(sim.tx_state(id, &tx.id), Some(TxState::Finalized));
    }
}

#[test]
fn total_packet_loss_keeps_nodes_isolated() {
    let mut c = config("pow", 5);
    c.network.packet_loss = 1.0;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);

    let tx = sim.send_transaction("wallet-0", "wallet-1", 10).unwrap();
    sim.run_ticks(200);

    let stats = sim.network_stats();
    assert_eq!(stats.delivered, 0);
    assert!(stats.sent > 0);
    assert_eq!(stats.sent, stats.dropped);
    assert!(sim.network().in_flight().is_empty());

    for id in &nodes[1..] {
        let node = sim.node(id).unwrap();
        assert_eq!(node.head_height(), 0, "{} saw remote blocks", id);
        assert_eq!(node.tx_state(&tx.id), None);
        assert!(node.mempool.is_empty());
    }
    // Only the origin can have mined its own transaction.
    let origin = sim.node(&nodes[0]).unwrap();
    assert!(origin.tx_state(&tx.id).is_some());
}

#[test]
fn pbft_commits_and_survives_view_change() {
    let mut c = config("pbft", 6);
    c.params.proposal_interval = 500;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);

    let first = sim.send_transaction("wallet-2", "wallet-0", 3).unwrap();
    sim.run_ticks(40);
    for id in &nodes {
        assert_eq!(sim.tx_state(id, &first.id), Some(TxState::Finalized));
        assert_eq!(sim.node(id).unwrap().finalized_height(), 1);
    }
    assert_eq!(sim.role(&nodes[0]).unwrap(), "Primary");

    assert_eq!(sim.change_view(), Some(1));
    assert_eq!(sim.role(&nodes[1]).unwrap(), "Primary");

    let second = sim.send_transaction("wallet-2", "wallet-0", 4).unwrap();
    sim.run_ticks(40);
    let tip = sim.node(&nodes[1]).unwrap().head_id().to_string();
    for id in &nodes {
        let node = sim.node(id).unwrap();
        assert_eq!(node.tx_state(&second.id), Some(TxState::Finalized));
        assert_eq!(node.head_id(), tip);
        assert_eq!(node.finalized_height(), 2);
    }
}

#[test]
fn pos_finalizes_and_respects_stake_changes() {
    let mut c = config("pos", 7);
    c.params.slot_duration = 1_000;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);

    let tx = sim.send_transaction("wallet-0", "wallet-1", 8).unwrap();
    sim.run_ticks(120);
    for id in &nodes {
        assert_eq!(sim.tx_state(id, &tx.id), Some(TxState::Finalized), "{}", id);
    }

    assert!(sim.set_stake(&nodes[3], 0));
    assert_eq!(sim.role(&nodes[3]).unwrap(), "Observer");
    let snap = sim.snapshot();
    let ui = &snap.nodes.iter().find(|n| n.id == nodes[0]).unwrap().ui;
    assert_eq!(ui["totalStake"], 300);
}

#[test]
fn messages_in_flight_report_progress() {
    let mut sim = Simulation::new(config("raft", 8)).unwrap();
    let nodes = ids(&sim);
    sim.force_election_timeout(&nodes[0]);
    sim.step();

    let snap = sim.snapshot();
    assert!(!snap.messages.is_empty());
    for m in &snap.messages {
        assert!((0.0..=1.0).contains(&m.progress));
    }
}

#[test]
fn removed_node_stops_receiving() {
    let mut c = config("raft", 9);
    c.network.min_delay = 20;
    c.network.max_delay = 60;
    let mut sim = Simulation::new(c).unwrap();
    let nodes = ids(&sim);
    sim.force_election_timeout(&nodes[0]);
    assert!(sim.remove_node(&nodes[3]));
    sim.run_ticks(20);

    assert!(sim.node(&nodes[3]).is_none());
    assert!(sim.network_stats().discarded > 0);
    assert!(sim.role(&nodes[0]).unwrap().starts_with("Leader"));
}
