#![forbid(unsafe_code)]

//! Host/peer replication.
//!
//! Replication is full-state, host to peers. The host is authoritative: it
//! executes action requests relayed by peers and fans out the whole
//! serialized document whenever it changes. Peers reconcile each incoming
//! document into their replica and never mutate it otherwise.
//!
//! ```text
//!  Host                                      Peer
//!  Idle ─listen─▶ Listening                  Idle ─connect─▶ Connecting
//!                   │ Open(conn) ──────────────────────────▶ │ Open
//!                   │ add Player, send state ─────Data──────▶ Connected
//!                   │ ◀──────────── Data {type, data} ────── │ send_action
//!   tree commit ──▶ │ mark dirty
//!   flush(now) ───▶ │ debounce, send state ───Data─────────▶ │ apply_snapshot
//!                   │ Close(conn): remove Player
//! ```
//!
//! # Coalescing
//!
//! The host subscribes to tree commits and only marks a [`Debouncer`]. The
//! actual serialization happens in [`HostChannel::flush`], once per window,
//! and is skipped when the document is byte-identical to the last broadcast.
//! A burst of mutations therefore reaches peers as one message holding the
//! final state.

use std::collections::{BTreeMap, VecDeque};

use serde_json::Value;
use tracing::{debug, debug_span, trace, warn};
use web_time::{Duration, Instant};

use tabletop_state::model::paths;
use tabletop_state::{ActionRequest, Debouncer, Player, PlayerId, Store, Subscription};

use crate::error::{SessionError, SessionResult};
use crate::transport::{ConnectionId, PeerId, SessionId, Transport, TransportError};
use crate::wire::{self, CodecError};

/// The authoritative side of a session.
pub struct HostChannel {
    session_id: SessionId,
    peers: BTreeMap<ConnectionId, PlayerId>,
    debouncer: Debouncer,
    last_sent: Option<Vec<u8>>,
    broadcasts: u64,
    next_seat: u32,
    _watch: Subscription,
}

impl std::fmt::Debug for HostChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostChannel")
            .field("session_id", &self.session_id)
            .field("peers", &self.peers)
            .field("broadcasts", &self.broadcasts)
            .finish()
    }
}

impl HostChannel {
    /// Start listening: every later commit on `store`'s tree marks the
    /// broadcast dirty.
    #[must_use]
    pub fn listen(session_id: SessionId, store: &Store, window: Duration) -> Self {
        let debouncer = Debouncer::new(window);
        let flag = debouncer.flag();
        let watch = store.tree().subscribe(move |_| flag.mark());
        debug!(target: "tabletop.replication", session = %session_id, "host listening");
        Self {
            session_id,
            peers: BTreeMap::new(),
            debouncer,
            last_sent: None,
            broadcasts: 0,
            next_seat: 2,
            _watch: watch,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Connected players, by connection.
    pub fn peers(&self) -> impl Iterator<Item = (ConnectionId, &PlayerId)> {
        self.peers.iter().map(|(conn, player)| (*conn, player))
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn connection_of(&self, player: &PlayerId) -> Option<ConnectionId> {
        self.peers
            .iter()
            .find_map(|(conn, p)| (p == player).then_some(*conn))
    }

    /// Number of state fan-outs so far.
    #[must_use]
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts
    }

    /// Whether a coalesced broadcast is owed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// A peer completed its handshake: seat it and send it the current state.
    pub fn on_open(
        &mut self,
        store: &mut Store,
        transport: &mut dyn Transport,
        conn: ConnectionId,
        remote: &PeerId,
    ) -> SessionResult<PlayerId> {
        let id = remote.to_player_id();
        if !store.tree().contains(&id.path()) {
            let player = Player::new(id.clone(), format!("Player {}", self.next_seat));
            self.next_seat += 1;
            store.tree_mut().set_as(&id.path(), &player)?;
        }
        self.peers.insert(conn, id.clone());
        debug!(
            target: "tabletop.replication",
            player = %id,
            conn = conn.raw(),
            peers = self.peers.len(),
            "peer joined"
        );
        self.broadcast_now(store, transport, Some(conn))?;
        Ok(id)
    }

    /// A connection closed: remove exactly its player.
    pub fn on_close(&mut self, store: &mut Store, conn: ConnectionId) -> Option<PlayerId> {
        let id = self.peers.remove(&conn)?;
        if self.connection_of(&id).is_none() {
            remove_player(store, &id);
        }
        debug!(
            target: "tabletop.replication",
            player = %id,
            conn = conn.raw(),
            peers = self.peers.len(),
            "peer left"
        );
        Some(id)
    }

    /// Decode an action request from a seated peer.
    ///
    /// `Ok(None)` when the connection is not seated (data before open).
    pub fn decode_request(
        &self,
        conn: ConnectionId,
        payload: &[u8],
    ) -> Result<Option<(PlayerId, ActionRequest)>, CodecError> {
        let Some(player) = self.peers.get(&conn) else {
            trace!(target: "tabletop.replication", conn = conn.raw(), "data from unseated connection");
            return Ok(None);
        };
        let request = wire::decode_action(payload)?;
        Ok(Some((player.clone(), request)))
    }

    /// Broadcast if the debounce window has elapsed. Returns whether a
    /// message was sent.
    pub fn flush(
        &mut self,
        store: &Store,
        transport: &mut dyn Transport,
        now: Instant,
    ) -> SessionResult<bool> {
        if !self.debouncer.poll(now) {
            return Ok(false);
        }
        self.broadcast_now(store, transport, None)
    }

    /// Serialize and fan out immediately. `include` is sent the state even
    /// when it is unchanged since the last broadcast.
    fn broadcast_now(
        &mut self,
        store: &Store,
        transport: &mut dyn Transport,
        include: Option<ConnectionId>,
    ) -> SessionResult<bool> {
        let _span = debug_span!(target: "tabletop.replication", "broadcast").entered();
        self.debouncer.reset();
        let bytes = wire::encode_state(&store.tree().snapshot());
        if self.last_sent.as_deref() == Some(bytes.as_slice()) {
            if let Some(conn) = include {
                transport.send(conn, bytes);
            }
            return Ok(false);
        }
        for conn in self.peers.keys() {
            transport.send(*conn, bytes.clone());
        }
        self.broadcasts += 1;
        trace!(
            target: "tabletop.replication",
            bytes = bytes.len(),
            peers = self.peers.len(),
            broadcasts = self.broadcasts,
            "state broadcast"
        );
        self.last_sent = Some(bytes);
        Ok(true)
    }

    /// Drop player records that have no live connection, keeping `keep`.
    ///
    /// Used after restoring a saved document whose players left long ago.
    pub fn prune_players(&self, store: &mut Store, keep: &PlayerId) -> usize {
        let stale: Vec<PlayerId> = store
            .tree()
            .get(&paths::players())
            .and_then(Value::as_object)
            .map(|players| {
                players
                    .keys()
                    .map(|key| PlayerId::new(key.as_str()))
                    .filter(|id| id != keep && self.connection_of(id).is_none())
                    .collect()
            })
            .unwrap_or_default();
        for id in &stale {
            remove_player(store, id);
        }
        stale.len()
    }

    /// Close every peer connection.
    pub fn shutdown(&mut self, transport: &mut dyn Transport) {
        for conn in std::mem::take(&mut self.peers).into_keys() {
            transport.close(conn);
        }
    }
}

fn remove_player(store: &mut Store, id: &PlayerId) {
    let tree = store.tree_mut();
    for path in [id.path(), id.selection_path()] {
        if tree.contains(&path)
            && let Err(err) = tree.remove(&path)
        {
            warn!(target: "tabletop.replication", player = %id, error = %err, "player cleanup failed");
        }
    }
}

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
}

/// The replica side of a session.
#[derive(Debug)]
pub struct PeerChannel {
    host: SessionId,
    conn: Option<ConnectionId>,
    state: PeerState,
    outbox: VecDeque<Vec<u8>>,
    applied: u64,
}

impl PeerChannel {
    /// Start connecting to the host identified by `host`.
    pub fn connect(host: SessionId, transport: &mut dyn Transport) -> Result<Self, TransportError> {
        let mut channel = Self {
            host,
            conn: None,
            state: PeerState::Idle,
            outbox: VecDeque::new(),
            applied: 0,
        };
        channel.reconnect(transport)?;
        Ok(channel)
    }

    /// Open a fresh connection to the host, abandoning any pending one.
    pub fn reconnect(&mut self, transport: &mut dyn Transport) -> Result<(), TransportError> {
        if let Some(old) = self.conn.take() {
            transport.close(old);
        }
        self.state = PeerState::Idle;
        let conn = transport.connect(&self.host)?;
        debug!(target: "tabletop.replication", host = %self.host, conn = conn.raw(), "connecting");
        self.conn = Some(conn);
        self.state = PeerState::Connecting;
        Ok(())
    }

    #[must_use]
    pub fn host(&self) -> &SessionId {
        &self.host
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    #[must_use]
    pub fn owns(&self, conn: ConnectionId) -> bool {
        self.conn == Some(conn)
    }

    /// Requests waiting for the connection to open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Number of state documents applied.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Our connection opened: flush queued requests. Returns whether `conn`
    /// was ours.
    pub fn on_open(&mut self, transport: &mut dyn Transport, conn: ConnectionId) -> bool {
        if !self.owns(conn) {
            return false;
        }
        self.state = PeerState::Connected;
        debug!(
            target: "tabletop.replication",
            host = %self.host,
            queued = self.outbox.len(),
            "connected to host"
        );
        for payload in self.outbox.drain(..) {
            transport.send(conn, payload);
        }
        true
    }

    /// Reconcile an inbound state document into the replica.
    ///
    /// Returns the number of patches committed. Unparseable payloads are an
    /// error and leave the replica untouched.
    pub fn on_data(
        &mut self,
        store: &mut Store,
        conn: ConnectionId,
        payload: &[u8],
    ) -> SessionResult<usize> {
        if !self.owns(conn) {
            return Ok(0);
        }
        let doc = wire::decode_state(payload)?;
        let patches = store.apply_snapshot(doc)?;
        self.applied += 1;
        trace!(target: "tabletop.replication", patches, "state applied");
        Ok(patches)
    }

    /// Returns whether the closed connection was ours.
    pub fn on_close(&mut self, conn: ConnectionId) -> bool {
        if !self.owns(conn) {
            return false;
        }
        self.conn = None;
        self.state = PeerState::Idle;
        true
    }

    /// Forward an action request to the host, queuing it while connecting.
    pub fn send(&mut self, transport: &mut dyn Transport, request: &ActionRequest) -> SessionResult<()> {
        let payload = wire::encode_action(request)?;
        match (self.state, self.conn) {
            (PeerState::Connected, Some(conn)) => {
                transport.send(conn, payload);
                Ok(())
            }
            (PeerState::Connecting, _) => {
                self.outbox.push_back(payload);
                Ok(())
            }
            _ => Err(SessionError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::transport::TransportEvent;
    use serde_json::json;
    use tabletop_state::{Entity, EntityId, EntityKind, GameState, HistoryConfig, Position};

    fn host_store() -> Store {
        let state = GameState::default().with_entity(Entity::new(
            EntityId::new("pawn"),
            EntityKind::Piece {
                color: "red".into(),
                label: "P".into(),
            },
        ));
        Store::new(state.into_tree().unwrap(), HistoryConfig::default())
    }

    #[test]
    fn open_seats_player_and_sends_state() {
        let net = MemoryNetwork::new();
        let mut host_t = net.transport();
        let mut peer_t = net.transport();
        let host_id = host_t.open().unwrap();
        let peer_id = peer_t.open().unwrap();

        let mut store = host_store();
        let mut host = HostChannel::listen(host_id.clone(), &store, Duration::ZERO);
        peer_t.connect(&host_id).unwrap();

        let opened = host_t.poll_events();
        let [TransportEvent::Open { conn, remote }] = &opened[..] else {
            panic!("expected one open");
        };
        let player = host.on_open(&mut store, &mut host_t, *conn, remote).unwrap();
        assert_eq!(player, peer_id.to_player_id());
        assert_eq!(
            store.tree().root()["players"][peer_id.as_str()]["name"],
            json!("Player 2")
        );
        assert_eq!(host.connection_of(&player), Some(*conn));
        assert_eq!(host.peers().count(), 1);
        assert_eq!(host.broadcasts(), 1);

        let events = peer_t.poll_events();
        let sent = events.iter().find_map(|event| match event {
            TransportEvent::Data { payload, .. } => Some(wire::decode_state(payload).unwrap()),
            _ => None,
        });
        assert_eq!(sent, Some(store.tree().snapshot()));
        assert!(!store.can_undo());
    }

    #[test]
    fn flush_skips_unchanged_state() {
        let net = MemoryNetwork::new();
        let mut host_t = net.transport();
        let host_id = host_t.open().unwrap();
        let mut store = host_store();
        let mut host = HostChannel::listen(host_id, &store, Duration::from_millis(10));
        let t0 = Instant::now();

        store
            .tree_mut()
            .set_as(&EntityId::new("pawn").field("position"), &Position::new(1.0, 0.0, 0.0))
            .unwrap();
        assert!(host.is_dirty());
        assert!(!host.flush(&store, &mut host_t, t0).unwrap());
        assert!(host.flush(&store, &mut host_t, t0 + Duration::from_millis(10)).unwrap());

        // Same value again commits nothing, so nothing is owed.
        store
            .tree_mut()
            .set_as(&EntityId::new("pawn").field("position"), &Position::new(1.0, 0.0, 0.0))
            .unwrap();
        assert!(!host.is_dirty());
        assert_eq!(host.broadcasts(), 1);
    }

    #[test]
    fn peer_queues_until_open() {
        let net = MemoryNetwork::new();
        let mut host_t = net.transport();
        let mut peer_t = net.transport();
        let host_id = host_t.open().unwrap();
        let peer_id = peer_t.open().unwrap();
        net.stall(&peer_id, true);

        let mut peer = PeerChannel::connect(host_id, &mut peer_t).unwrap();
        peer.send(&mut peer_t, &ActionRequest::new("flipCard", json!({"id": "c"})))
            .expect("queued while connecting");
        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.queued(), 1);

        net.stall(&peer_id, false);
        for event in peer_t.poll_events() {
            if let TransportEvent::Open { conn, .. } = event {
                assert!(peer.on_open(&mut peer_t, conn));
            }
        }
        assert!(peer.is_connected());
        assert_eq!(peer.queued(), 0);
        let delivered: Vec<_> = host_t
            .poll_events()
            .into_iter()
            .filter(|e| matches!(e, TransportEvent::Data { .. }))
            .collect();
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn peer_skips_garbage_and_keeps_replica() {
        let net = MemoryNetwork::new();
        let mut host_t = net.transport();
        let mut peer_t = net.transport();
        let host_id = host_t.open().unwrap();
        peer_t.open().unwrap();
        let mut peer = PeerChannel::connect(host_id, &mut peer_t).unwrap();
        let mut conn = None;
        for event in peer_t.poll_events() {
            if let TransportEvent::Open { conn: c, .. } = event {
                peer.on_open(&mut peer_t, c);
                conn = Some(c);
            }
        }
        let conn = conn.unwrap();
        let mut replica = Store::new(GameState::default().into_tree().unwrap(), HistoryConfig::default());
        let before = replica.tree().snapshot();

        assert!(peer.on_data(&mut replica, conn, b"{\"id\":").is_err());
        assert!(peer.on_data(&mut replica, conn, b"42").is_err());
        assert_eq!(replica.tree().snapshot(), before);
        assert_eq!(peer.applied(), 0);
    }

    #[test]
    fn send_without_connection_is_an_error() {
        let net = MemoryNetwork::new();
        let mut host_t = net.transport();
        let mut peer_t = net.transport();
        let host_id = host_t.open().unwrap();
        peer_t.open().unwrap();
        let mut peer = PeerChannel::connect(host_id, &mut peer_t).unwrap();
        let conn = peer.conn.unwrap();
        assert!(peer.on_close(conn));
        assert!(matches!(
            peer.send(&mut peer_t, &ActionRequest::new("undo", Value::Null)),
            Err(SessionError::NotConnected)
        ));
    }
}
