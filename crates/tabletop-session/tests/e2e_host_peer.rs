#![forbid(unsafe_code)]

//! End-to-end host/peer scenarios over the in-memory network.
//!
//! Validates:
//! - A joining peer receives a state equal to the host's current one
//! - Host mutations replicate; bursts coalesce into one broadcast
//! - A dropped connection removes exactly that player
//! - Concurrent moves of one entity resolve last-writer-wins at the host
//! - Malformed payloads are skipped in both directions
//! - A stalled handshake does not block other peers
//! - Undo, redo and dice rolls requested by peers run on the host
//! - Host and peer recover from transport outages
//! - A link failure after the handshake is a lost connection, before it a failed join

use serde_json::{Value, json};
use web_time::{Duration, Instant};

use tabletop_session::{
    BackoffStrategy, GameSession, MemoryNetwork, MemoryTransport, PeerId, RetryPolicy,
    SessionConfig, SessionEvent, Transport, TransportError,
};
use tabletop_state::ActionRequest;
use tabletop_state::actions::{ADD_ENTITY, MOVE_ENTITY, ROLL_DICE};

type Session = GameSession<MemoryTransport>;

// ============================================================================
// Helpers
// ============================================================================

fn config() -> SessionConfig {
    SessionConfig {
        broadcast_debounce_ms: 0,
        roll_duration_ms: 100,
        rng_seed: Some(7),
        reconnect: RetryPolicy::new(2, BackoffStrategy::Fixed { delay_ms: 10 }),
        ..SessionConfig::default()
    }
}

fn host(net: &MemoryNetwork, config: SessionConfig, now: Instant) -> Session {
    let mut host = GameSession::create_or_join(config, net.transport(), None).expect("host starts");
    host.send_action(
        ActionRequest::new(
            ADD_ENTITY,
            json!({"id": "pawn", "kind": "piece", "color": "red"}),
        ),
        now,
    )
    .expect("pawn added");
    host
}

fn join(net: &MemoryNetwork, host: &Session) -> Session {
    GameSession::create_or_join(config(), net.transport(), Some(host.session_id().clone()))
        .expect("peer starts")
}

fn peer_id(session: &Session) -> PeerId {
    session
        .transport()
        .local_id()
        .expect("transport is open")
}

fn move_to(x: f64, y: f64) -> ActionRequest {
    ActionRequest::new(
        MOVE_ENTITY,
        json!({"id": "pawn", "position": {"x": x, "y": y, "z": 0.0}}),
    )
}

fn pawn(session: &Session) -> Value {
    session.store().tree().root()["entities"]["pawn"].clone()
}

/// Pump host and peers until messages settle. Returns each session's events,
/// host first.
fn exchange(host: &mut Session, peers: &mut [&mut Session], now: Instant) -> Vec<Vec<SessionEvent>> {
    let mut events = vec![Vec::new(); peers.len() + 1];
    for _ in 0..3 {
        events[0].extend(host.pump(now));
        for (i, peer) in peers.iter_mut().enumerate() {
            events[i + 1].extend(peer.pump(now));
        }
    }
    events
}

fn state_updates(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::StateApplied { .. }))
        .count()
}

// ============================================================================
// Join and replication
// ============================================================================

#[test]
fn joining_peer_receives_the_hosts_current_state() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    assert!(host.is_host());
    assert!(!peer.is_host());
    assert_eq!(peer.session_id(), host.session_id());

    let events = exchange(&mut host, &mut [&mut peer], t0);

    assert!(events[0].contains(&SessionEvent::PlayerJoined(peer.local_player_id().clone())));
    assert!(events[1].contains(&SessionEvent::Connected));
    assert!(state_updates(&events[1]) >= 1);
    assert_eq!(peer.store().tree().snapshot(), host.store().tree().snapshot());

    let me = peer.local_player().expect("peer is seated");
    assert_eq!(me.name, "Player 2");
    assert_eq!(host.local_player().expect("host is seated").name, "Host");

    // Replicated state is never undoable on the peer.
    assert!(!peer.store().can_undo());
}

#[test]
fn host_move_replicates_to_peer() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);

    host.send_action(move_to(3.0, 4.0), t0).expect("move");
    let events = exchange(&mut host, &mut [&mut peer], t0);

    assert_eq!(state_updates(&events[1]), 1);
    assert_eq!(pawn(&peer)["position"], json!({"x": 3.0, "y": 4.0, "z": 0.0}));
    assert_eq!(pawn(&peer), pawn(&host));
}

#[test]
fn two_rapid_moves_are_one_broadcast_of_the_final_position() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let slow = SessionConfig {
        broadcast_debounce_ms: 50,
        ..config()
    };
    let mut host = host(&net, slow, t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);
    let before = host.broadcasts();

    let t1 = t0 + Duration::from_millis(100);
    host.send_action(move_to(1.0, 0.0), t1).expect("first move");
    host.send_action(move_to(2.0, 0.0), t1).expect("second move");

    let early = exchange(&mut host, &mut [&mut peer], t1 + Duration::from_millis(10));
    assert_eq!(state_updates(&early[1]), 0);

    let settled = exchange(&mut host, &mut [&mut peer], t1 + Duration::from_millis(60));
    assert_eq!(state_updates(&settled[1]), 1);
    assert_eq!(host.broadcasts(), before + 1);
    assert_eq!(pawn(&peer)["position"]["x"], json!(2.0));
}

#[test]
fn peer_actions_are_executed_by_the_host() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);

    // Sent while still connecting: queued, then delivered on open.
    peer.send_action(move_to(5.0, 5.0), t0).expect("queued");
    exchange(&mut host, &mut [&mut peer], t0);

    assert_eq!(pawn(&host)["position"]["x"], json!(5.0));
    assert_eq!(pawn(&peer)["position"]["x"], json!(5.0));
    assert!(!peer.store().can_undo());
    assert_eq!(host.store().undo_manager().next_undo_name(), Some(MOVE_ENTITY));
}

// ============================================================================
// Membership
// ============================================================================

#[test]
fn dropped_connection_removes_exactly_that_player() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut a = join(&net, &host);
    let mut b = join(&net, &host);
    exchange(&mut host, &mut [&mut a, &mut b], t0);
    assert_eq!(host.peer_count(), 2);

    let a_id = a.local_player_id().clone();
    let b_id = b.local_player_id().clone();
    net.sever(&peer_id(&a));
    let events = exchange(&mut host, &mut [&mut a, &mut b], t0);

    assert!(events[0].contains(&SessionEvent::PlayerLeft(a_id.clone())));
    assert!(events[1].contains(&SessionEvent::ConnectionLost));
    assert_eq!(host.peer_count(), 1);

    let players = &host.store().tree().root()["players"];
    assert!(players.get(a_id.as_str()).is_none());
    assert_eq!(players[b_id.as_str()]["name"], json!("Player 3"));
    assert!(players.get(host.local_player_id().as_str()).is_some());

    // B's replica loses A and keeps itself.
    assert_eq!(b.store().tree().root()["players"], *players);
}

#[test]
fn stalled_handshake_does_not_block_other_peers() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);

    let slow_id = PeerId::parse("slow").expect("valid id");
    let slow_transport = net.transport_with_id(slow_id.clone());
    assert!(net.stall(&slow_id, true));
    let mut slow = GameSession::create_or_join(
        config(),
        slow_transport,
        Some(host.session_id().clone()),
    )
    .expect("slow peer starts");
    let mut fast = join(&net, &host);

    let events = exchange(&mut host, &mut [&mut slow, &mut fast], t0);
    assert!(events[1].is_empty());
    assert!(events[2].contains(&SessionEvent::Connected));
    assert_eq!(host.peer_count(), 1);
    assert_eq!(fast.store().tree().snapshot(), host.store().tree().snapshot());

    net.stall(&slow_id, false);
    let events = exchange(&mut host, &mut [&mut slow, &mut fast], t0);
    assert!(events[1].contains(&SessionEvent::Connected));
    assert_eq!(host.peer_count(), 2);
    assert_eq!(slow.store().tree().snapshot(), host.store().tree().snapshot());
}

#[test]
fn joining_an_unknown_session_fails() {
    let net = MemoryNetwork::new();
    let result = GameSession::create_or_join(
        config(),
        net.transport(),
        Some(PeerId::parse("nobody").expect("valid id")),
    );
    assert!(result.is_err());
}

// ============================================================================
// Conflicts and malformed input
// ============================================================================

#[test]
fn concurrent_moves_resolve_last_writer_wins_at_the_host() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut a = join(&net, &host);
    let mut b = join(&net, &host);
    exchange(&mut host, &mut [&mut a, &mut b], t0);

    a.send_action(move_to(1.0, 1.0), t0).expect("a moves");
    b.send_action(move_to(2.0, 2.0), t0).expect("b moves");
    exchange(&mut host, &mut [&mut a, &mut b], t0);
    for session in [&host, &a, &b] {
        assert_eq!(pawn(session)["position"]["x"], json!(2.0));
    }

    b.send_action(move_to(3.0, 3.0), t0).expect("b moves");
    a.send_action(move_to(4.0, 4.0), t0).expect("a moves");
    exchange(&mut host, &mut [&mut a, &mut b], t0);
    for session in [&host, &a, &b] {
        assert_eq!(pawn(session)["position"]["x"], json!(4.0));
    }
}

#[test]
fn malformed_payloads_are_skipped_in_both_directions() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut a = join(&net, &host);
    let mut b = join(&net, &host);
    exchange(&mut host, &mut [&mut a, &mut b], t0);
    let host_id = peer_id(&host);
    let a_id = peer_id(&a);

    // Peer → host garbage.
    assert!(net.inject(&a_id, &host_id, b"not json".to_vec()));
    let events = exchange(&mut host, &mut [&mut a, &mut b], t0);
    assert!(events[0].iter().any(|e| matches!(e, SessionEvent::PayloadSkipped { .. })));
    assert_eq!(host.peer_count(), 2);

    // Host → peer garbage, then a partial document that omits fields.
    let before = a.store().tree().snapshot();
    assert!(net.inject(&host_id, &a_id, b"[1, 2, 3]".to_vec()));
    assert!(net.inject(&host_id, &a_id, br#"{"id": "game"}"#.to_vec()));
    let events = exchange(&mut host, &mut [&mut a, &mut b], t0);
    assert!(events[1].iter().any(|e| matches!(e, SessionEvent::PayloadSkipped { .. })));
    assert!(events[1].contains(&SessionEvent::StateApplied { patches: 0 }));
    assert_eq!(a.store().tree().snapshot(), before);

    // The session keeps working for everyone.
    a.send_action(move_to(8.0, 0.0), t0).expect("move after garbage");
    exchange(&mut host, &mut [&mut a, &mut b], t0);
    assert_eq!(pawn(&b)["position"]["x"], json!(8.0));
}

#[test]
fn rejected_peer_actions_are_reported_not_fatal() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);

    peer.send_action(ActionRequest::new("teleport", json!({})), t0)
        .expect("forwarded");
    let events = exchange(&mut host, &mut [&mut peer], t0);
    assert!(events[0].iter().any(|e| matches!(
        e,
        SessionEvent::ActionRejected { action, .. } if action == "teleport"
    )));
    assert_eq!(host.peer_count(), 1);
}

// ============================================================================
// Host-executed requests
// ============================================================================

#[test]
fn peer_requested_undo_and_redo_run_on_the_host() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);

    peer.send_action(move_to(6.0, 0.0), t0).expect("move");
    exchange(&mut host, &mut [&mut peer], t0);
    assert_eq!(pawn(&peer)["position"]["x"], json!(6.0));

    peer.send_action(ActionRequest::new("undo", Value::Null), t0).expect("undo");
    exchange(&mut host, &mut [&mut peer], t0);
    assert_eq!(pawn(&host)["position"]["x"], json!(0.0));
    assert_eq!(pawn(&peer)["position"]["x"], json!(0.0));

    peer.send_action(ActionRequest::new("redo", Value::Null), t0).expect("redo");
    exchange(&mut host, &mut [&mut peer], t0);
    assert_eq!(pawn(&peer)["position"]["x"], json!(6.0));
    assert!(!host.store().can_redo());
}

#[test]
fn dice_roll_settles_after_its_duration() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    host.send_action(
        ActionRequest::new(
            ADD_ENTITY,
            json!({"id": "d6", "kind": "dice", "faces": 6, "value": 1}),
        ),
        t0,
    )
    .expect("dice added");
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);

    peer.send_action(ActionRequest::new(ROLL_DICE, json!({"id": "d6"})), t0)
        .expect("roll requested");
    exchange(&mut host, &mut [&mut peer], t0);
    assert_eq!(host.pending_rolls(), 1);
    assert_eq!(peer.store().tree().root()["entities"]["d6"]["rolling"], json!(true));

    // Another action lands while the dice is rolling.
    host.send_action(move_to(1.0, 1.0), t0).expect("move during roll");

    exchange(&mut host, &mut [&mut peer], t0 + Duration::from_millis(100));
    assert_eq!(host.pending_rolls(), 0);
    let die = &peer.store().tree().root()["entities"]["d6"];
    assert_eq!(die["rolling"], json!(false));
    let value = die["value"].as_u64().expect("numeric face");
    assert!((1..=6).contains(&value));

    // The roll finished last, so it is the most recent undo step.
    assert_eq!(host.store().undo_manager().next_undo_name(), Some(ROLL_DICE));
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn host_retries_signalling_and_keeps_serving_peers() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);
    let host_id = peer_id(&host);

    net.drop_signalling(&host_id);
    net.refuse_reconnect(&host_id, true);
    assert_eq!(host.pump(t0), vec![SessionEvent::SignallingLost]);

    assert_eq!(
        host.pump(t0 + Duration::from_millis(10)),
        vec![SessionEvent::Reconnecting { attempt: 1 }]
    );
    assert_eq!(
        host.pump(t0 + Duration::from_millis(20)),
        vec![SessionEvent::ReconnectFailed { attempts: 2 }]
    );

    // Existing links survive the outage.
    peer.send_action(move_to(9.0, 9.0), t0).expect("move during outage");
    exchange(&mut host, &mut [&mut peer], t0 + Duration::from_millis(25));
    assert_eq!(pawn(&peer)["position"]["x"], json!(9.0));

    net.refuse_reconnect(&host_id, false);
    assert_eq!(
        host.pump(t0 + Duration::from_millis(30)),
        vec![SessionEvent::Reconnected]
    );
}

#[test]
fn peer_reconnects_after_losing_the_host_link() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);
    let me = peer.local_player_id().clone();

    net.sever(&peer_id(&peer));
    let events = exchange(&mut host, &mut [&mut peer], t0);
    assert!(events[0].contains(&SessionEvent::PlayerLeft(me.clone())));
    assert!(events[1].contains(&SessionEvent::ConnectionLost));

    host.send_action(move_to(7.0, 0.0), t0).expect("move while peer is away");
    let events = exchange(&mut host, &mut [&mut peer], t0 + Duration::from_millis(10));
    assert!(events[0].contains(&SessionEvent::PlayerJoined(me)));
    assert!(events[1].contains(&SessionEvent::Reconnected));
    assert_eq!(pawn(&peer)["position"]["x"], json!(7.0));
    assert_eq!(peer.store().tree().snapshot(), host.store().tree().snapshot());
}

#[test]
fn failure_on_an_established_link_is_a_lost_connection() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);
    let me = peer.local_player_id().clone();

    net.fail_links(&peer_id(&peer), TransportError::Unreachable);
    let events = exchange(&mut host, &mut [&mut peer], t0);
    assert!(events[0].contains(&SessionEvent::PlayerLeft(me.clone())));
    assert!(events[1].contains(&SessionEvent::ConnectionLost));
    assert!(
        !events[1]
            .iter()
            .any(|e| matches!(e, SessionEvent::JoinFailed(_))),
        "{:?}",
        events[1]
    );

    let events = exchange(&mut host, &mut [&mut peer], t0 + Duration::from_millis(10));
    assert!(events[0].contains(&SessionEvent::PlayerJoined(me)));
    assert!(events[1].contains(&SessionEvent::Reconnected));
}

#[test]
fn failure_before_the_handshake_is_a_failed_join() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    net.stall(&peer_id(&host), true);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);

    net.fail_links(&peer_id(&peer), TransportError::Unreachable);
    assert_eq!(
        peer.pump(t0),
        vec![SessionEvent::JoinFailed(TransportError::Unreachable)]
    );
    assert_eq!(host.peer_count(), 0);
}

#[test]
fn shutdown_closes_peer_connections() {
    let net = MemoryNetwork::new();
    let t0 = Instant::now();
    let mut host = host(&net, config(), t0);
    let mut peer = join(&net, &host);
    exchange(&mut host, &mut [&mut peer], t0);
    let host_id = peer_id(&host);

    let _transport = host.shutdown();
    assert_eq!(net.open_links(&host_id), 0);
    assert!(peer.pump(t0).contains(&SessionEvent::ConnectionLost));
}
