//! Multi-node scenarios on the deterministic simulation harness.

use concord_consensus::testing::{genesis, MockKeyShare, Simulation};
use concord_consensus::{
    AgreementMode, ConsensusMetrics, DropLabels, EngineConfig, Event, InclusionState, KeyShare,
    LeaderScheduler, MessageKind, NodeLabels, PeerMessage, ResultPosted, Stage,
};
use concord_types::{PeerIndex, Request, RequestKind, StateIndex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn requests(count: usize) -> Vec<Request> {
    (0..count)
        .map(|i| Request::new(RequestKind::OffLedger, format!("request-{i}").into_bytes()))
        .collect()
}

fn genesis_leader() -> PeerIndex {
    LeaderScheduler::new(4, &genesis().anchor.bytes).current()
}

fn rotations(metrics: &ConsensusMetrics, node: PeerIndex) -> u64 {
    metrics.rotations.get_or_create(&NodeLabels { node }).get()
}

fn dropped(metrics: &ConsensusMetrics, node: PeerIndex, kind: MessageKind, reason: &str) -> u64 {
    metrics
        .messages_dropped
        .get_or_create(&DropLabels {
            node,
            kind: kind.as_str().to_string(),
            reason: reason.to_string(),
        })
        .get()
}

fn all_finalized(sim: &Simulation, peers: &[PeerIndex]) -> bool {
    peers.iter().all(|p| sim.status(*p).stage.is_finalized())
}

#[test]
fn test_happy_path_finalizes_and_confirms() {
    init_tracing();
    let mut sim = Simulation::builder(4).build().unwrap();
    let batch = requests(3);
    for request in &batch {
        sim.submit(request.clone());
    }
    sim.start();

    let leader = genesis_leader();
    assert!(all_finalized(&sim, &[0, 1, 2, 3]));
    assert_eq!(sim.status(leader).stage, Stage::LeaderFinalized);
    for peer in (0..4).filter(|p| *p != leader) {
        assert_eq!(sim.status(peer).stage, Stage::SubFinalized);
    }

    let tx = sim.status(leader).finalized_tx.unwrap();
    for peer in 0..4 {
        assert_eq!(sim.status(peer).finalized_tx, Some(tx));
    }

    assert!(sim.run_until(20, |s| s.baseline().state_index == StateIndex(1)));
    let confirmed = sim.ledger().confirmed();
    assert_eq!(confirmed.len(), 1);
    let mut executed = confirmed[0].requests.clone();
    executed.sort();
    let mut expected: Vec<_> = batch.iter().map(|r| r.id).collect();
    expected.sort();
    assert_eq!(executed, expected);

    let keys = MockKeyShare::new(b"concord-simulation", 4, 0);
    let signature = confirmed[0].signature.as_ref().unwrap();
    assert!(keys.verify_full(confirmed[0].signed_digest().as_bytes(), signature));

    for node in sim.nodes() {
        assert!(node.pool.is_empty());
        assert_eq!(node.engine.round().unwrap().target_index(), StateIndex(2));
    }
}

#[test]
fn test_finalization_is_idempotent() {
    init_tracing();
    let mut sim = Simulation::builder(4).build().unwrap();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.start();

    let leader = genesis_leader();
    let follower = (leader + 1) % 4;
    let transition = sim
        .node(leader)
        .engine
        .round()
        .and_then(|r| r.finalized())
        .cloned()
        .unwrap();

    let repeat = PeerMessage::ResultPosted(ResultPosted {
        baseline_id: genesis().id(),
        transition: transition.clone(),
    });
    sim.deliver(
        follower,
        Event::PeerMessage {
            sender: leader,
            kind: repeat.kind(),
            payload: repeat.encode().unwrap(),
        },
    );

    assert_eq!(sim.ledger().posts(), 1);
    assert_eq!(sim.ledger().transactions(), 1);
    assert_eq!(
        dropped(sim.metrics(), follower, MessageKind::ResultPosted, "already_finalized"),
        1
    );
    assert_eq!(
        sim.node(follower).engine.round().unwrap().finalized(),
        Some(&transition)
    );
    let finalized: u64 = (0..4)
        .map(|node| {
            sim.metrics()
                .transitions_finalized
                .get_or_create(&NodeLabels { node })
                .get()
        })
        .sum();
    assert_eq!(finalized, 1);
}

#[test]
fn test_dead_leader_is_rotated_away() {
    init_tracing();
    let leader = genesis_leader();
    let mut sim = Simulation::builder(4).build().unwrap();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.kill(leader);
    sim.start();

    let live: Vec<PeerIndex> = (0..4).filter(|p| *p != leader).collect();
    assert!(!all_finalized(&sim, &live));

    assert!(sim.run_until(60, |s| s.baseline().state_index == StateIndex(1)));
    for peer in &live {
        assert!(rotations(sim.metrics(), *peer) >= 1);
    }
    assert_eq!(rotations(sim.metrics(), leader), 0);
    assert_eq!(sim.ledger().confirmed().len(), 1);
}

#[test]
fn test_no_rotation_without_live_quorum() {
    init_tracing();
    let leader = genesis_leader();
    let other = (leader + 1) % 4;
    let mut sim = Simulation::builder(4).build().unwrap();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.kill(leader);
    sim.kill(other);
    sim.start();

    sim.run_until(50, |_| false);
    for peer in (0..4).filter(|p| *p != leader && *p != other) {
        let status = sim.status(peer);
        assert_eq!(status.rotations, 0);
        assert!(!status.quorum_alive);
        assert_eq!(status.stage, Stage::SubNotified);
        assert_eq!(rotations(sim.metrics(), peer), 0);
    }
    assert_eq!(sim.ledger().transactions(), 0);
}

#[test]
fn test_invalid_share_does_not_block_finalization() {
    init_tracing();
    let leader = genesis_leader();
    let faulty = (leader + 2) % 4;
    let mut sim = Simulation::builder(4).faulty_keys(faulty).build().unwrap();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.start();

    assert_eq!(sim.status(leader).stage, Stage::LeaderFinalized);
    let rejected = dropped(sim.metrics(), leader, MessageKind::SignedResult, "invalid_share")
        + dropped(sim.metrics(), leader, MessageKind::SignedResult, "already_finalized");
    assert_eq!(rejected, 1);
    assert!(sim.run_until(20, |s| s.baseline().state_index == StateIndex(1)));
}

#[test]
fn test_divergent_result_is_not_counted() {
    init_tracing();
    let leader = genesis_leader();
    let divergent = (leader + 1) % 4;
    let mut sim = Simulation::builder(4).divergent(divergent).build().unwrap();
    for request in requests(1) {
        sim.submit(request);
    }
    sim.start();

    assert_eq!(sim.status(leader).stage, Stage::LeaderFinalized);
    let mismatched = dropped(sim.metrics(), leader, MessageKind::SignedResult, "digest_mismatch")
        + dropped(sim.metrics(), leader, MessageKind::SignedResult, "already_finalized");
    assert_eq!(mismatched, 1);

    // The quorum-signed transition is not what the divergent member computed.
    assert_eq!(sim.status(divergent).stage, Stage::SubCalculated);
    assert!(dropped(sim.metrics(), divergent, MessageKind::ResultPosted, "result_mismatch") >= 1);

    assert!(sim.run_until(20, |s| s.baseline().state_index == StateIndex(1)));
    assert_eq!(sim.status(divergent).round_index, Some(StateIndex(2)));
}

#[test]
fn test_tampered_posted_transition_is_dropped() {
    init_tracing();
    let leader = genesis_leader();
    let mut finished = Simulation::builder(4).build().unwrap();
    for request in requests(2) {
        finished.submit(request);
    }
    finished.start();
    let genuine = finished
        .node(leader)
        .engine
        .round()
        .and_then(|r| r.finalized())
        .cloned()
        .unwrap();

    let mut forged = genuine.clone();
    forged.state.commitment = concord_types::Digest::hash(b"forged state");
    forged.requests.reverse();
    forged.requests.push(Request::new(RequestKind::OffLedger, b"injected".to_vec()).id);
    assert_ne!(forged.id(), genuine.id());

    // A committee with nothing to do, so its round is still open.
    let mut idle = Simulation::builder(4).build().unwrap();
    idle.start();
    let target = (leader + 1) % 4;
    let post = |transition| {
        let message = PeerMessage::ResultPosted(ResultPosted {
            baseline_id: genesis().id(),
            transition,
        });
        Event::PeerMessage {
            sender: leader,
            kind: message.kind(),
            payload: message.encode().unwrap(),
        }
    };

    idle.deliver(target, post(forged));
    assert_eq!(
        dropped(idle.metrics(), target, MessageKind::ResultPosted, "invalid_signature"),
        1
    );
    assert!(!idle.status(target).stage.is_finalized());

    idle.deliver(target, post(genuine.clone()));
    assert_eq!(idle.status(target).stage, Stage::SubFinalized);
    assert_eq!(idle.status(target).finalized_tx, Some(genuine.id()));
}

#[test]
fn test_failed_execution_is_retried() {
    init_tracing();
    let leader = genesis_leader();
    let mut sim = Simulation::builder(4).build().unwrap();
    sim.node(leader).executor.fail_next(1);
    for request in requests(2) {
        sim.submit(request);
    }
    sim.start();

    assert_eq!(sim.status(leader).stage, Stage::LeaderFinalized);
    assert_eq!(sim.node(leader).executor.executions(), 2);
    assert_eq!(
        sim.metrics()
            .executions_failed
            .get_or_create(&NodeLabels { node: leader })
            .get(),
        1
    );
}

#[test]
fn test_ledger_rejection_is_reported() {
    init_tracing();
    let mut sim = Simulation::builder(4).build().unwrap();
    sim.ledger().reject_next();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.start();

    assert!(sim.run_until(20, |s| {
        (0..4).all(|p| s.status(p).inclusion == Some(InclusionState::Rejected))
    }));
    assert_eq!(sim.baseline().state_index, StateIndex(0));
    let rejected: u64 = (0..4)
        .map(|node| {
            sim.metrics()
                .transitions_rejected
                .get_or_create(&NodeLabels { node })
                .get()
        })
        .sum();
    assert_eq!(rejected, 4);

    sim.run_until(30, |_| false);
    assert!(all_finalized(&sim, &[0, 1, 2, 3]));
    assert_eq!(sim.baseline().state_index, StateIndex(0));
}

#[test]
fn test_newer_baseline_replaces_unfinished_round() {
    init_tracing();
    let mut sim = Simulation::builder(4).build().unwrap();
    sim.start();
    let leader = genesis_leader();
    assert_eq!(sim.status(leader).stage, Stage::LeaderStart);

    let next = concord_types::Baseline::new(
        StateIndex(3),
        concord_types::Digest::hash(b"elsewhere"),
        concord_types::LedgerAnchor::from_bytes(b"elsewhere".to_vec()),
        genesis().timestamp.saturating_add_millis(10),
    );
    for peer in 0..4 {
        sim.deliver(peer, Event::NewBaseline(next.clone()));
    }
    for peer in 0..4 {
        let status = sim.status(peer);
        assert_eq!(status.round_index, Some(StateIndex(4)));
        assert_eq!(status.baseline_id, Some(next.id()));
        assert_eq!(
            sim.metrics()
                .rounds_abandoned
                .get_or_create(&NodeLabels { node: peer })
                .get(),
            1
        );
    }

    sim.deliver(0, Event::NewBaseline(genesis()));
    assert_eq!(sim.status(0).round_index, Some(StateIndex(4)));
}

#[test]
fn test_common_subset_mode_finalizes() {
    init_tracing();
    let config = EngineConfig {
        stage_timeout_ms: 1_000,
        inclusion_poll_ms: 200,
        resend_ms: 500,
        initial_mode: AgreementMode::CommonSubset,
        ..EngineConfig::default()
    };
    let mut sim = Simulation::builder(4).config(config).build().unwrap();
    let batch = requests(3);
    for request in &batch {
        sim.submit(request.clone());
    }
    sim.start();

    assert_eq!(sim.subset().decided(), 1);
    assert!(all_finalized(&sim, &[0, 1, 2, 3]));
    for peer in 0..4 {
        let status = sim.status(peer);
        assert_eq!(status.mode, AgreementMode::CommonSubset);
        assert_eq!(status.leader, None);
    }
    assert_eq!(sim.ledger().transactions(), 1);

    assert!(sim.run_until(20, |s| s.baseline().state_index == StateIndex(1)));
    assert_eq!(sim.ledger().confirmed()[0].requests.len(), batch.len());
}

#[test]
fn test_rotations_fall_back_to_common_subset() {
    init_tracing();
    let leader = genesis_leader();
    let config = EngineConfig {
        stage_timeout_ms: 1_000,
        inclusion_poll_ms: 200,
        resend_ms: 500,
        acs_after_rotations: 1,
        ..EngineConfig::default()
    };
    let mut sim = Simulation::builder(4).config(config).build().unwrap();
    for request in requests(2) {
        sim.submit(request);
    }
    sim.kill(leader);
    sim.start();

    let live: Vec<PeerIndex> = (0..4).filter(|p| *p != leader).collect();
    assert!(sim.run_until(30, |s| all_finalized(s, &live)));
    for peer in &live {
        assert_eq!(sim.status(*peer).mode, AgreementMode::CommonSubset);
        assert_eq!(
            sim.metrics()
                .subset_fallbacks
                .get_or_create(&NodeLabels { node: *peer })
                .get(),
            1
        );
    }
    assert!(sim.run_until(20, |s| s.baseline().state_index == StateIndex(1)));
}

#[test]
fn test_empty_agreed_batch_proposes_again() {
    init_tracing();
    let config = EngineConfig {
        stage_timeout_ms: 1_000,
        inclusion_poll_ms: 200,
        resend_ms: 500,
        initial_mode: AgreementMode::CommonSubset,
        ..EngineConfig::default()
    };
    let mut sim = Simulation::builder(4).config(config).build().unwrap();
    sim.start();
    assert_eq!(sim.subset().decided(), 1);
    assert_eq!(sim.status(0).stage, Stage::SubsetProposed);

    let request = requests(1).remove(0);
    sim.submit(request.clone());
    assert!(sim.run_until(30, |s| all_finalized(s, &[0, 1, 2, 3])));
    assert!(sim.subset().decided() >= 2);
    let tx = sim.status(0).finalized_tx.unwrap();
    assert!(sim.ledger().state_of(&tx).is_some());
}
