#![forbid(unsafe_code)]

//! Session roles.
//!
//! [`GameSession::create_or_join`] decides the role: without a session id
//! this runtime hosts, with one it joins that host as a peer. Everything
//! afterwards is driven by [`GameSession::pump`], which the embedding loop
//! calls with the current time:
//!
//! 1. drain transport events (joins, leaves, inbound data, disconnects)
//! 2. settle dice rolls whose duration has elapsed
//! 3. flush the debounced state broadcast (host)
//! 4. attempt a scheduled reconnect
//!
//! User-visible outcomes are returned as [`SessionEvent`]s; a failure tied to
//! one peer never tears down the session for the others.

use std::fmt;

use rand::{RngCore, SeedableRng};
use rand_pcg::Pcg32;
use serde_json::Value;
use tracing::{debug, info, warn};
use web_time::Instant;

use tabletop_state::actions::{ROLL_DICE, SHUFFLE_DECK};
use tabletop_state::{
    ActionError, ActionRegistry, ActionRequest, DiceRoll, Entity, EntityKind, GameState, Player,
    PlayerId, StateTree, Store, begin_roll, roll_value, settle_roll,
};

use crate::config::SessionConfig;
use crate::error::SessionResult;
use crate::persistence::{StorageBackend, StorageError};
use crate::replication::{HostChannel, PeerChannel, PeerState};
use crate::retry::ReconnectSchedule;
use crate::transport::{ConnectionId, SessionId, Transport, TransportError, TransportEvent};
use crate::wire::{self, CodecError};

/// Request type that undoes the host's last undoable step.
pub const UNDO: &str = "undo";
/// Request type that redoes the host's last undone step.
pub const REDO: &str = "redo";

/// Storage key of the serialized game document.
pub const STATE_KEY: &str = "game-state";
/// Storage key of the serialized undo history.
pub const HISTORY_KEY: &str = "undo-history";

/// Outcomes reported by [`GameSession::pump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Host: a peer completed its handshake and was seated.
    PlayerJoined(PlayerId),
    /// Host: a peer's connection closed and its player was removed.
    PlayerLeft(PlayerId),
    /// Peer: the connection to the host opened.
    Connected,
    /// Peer: a state document from the host was reconciled.
    StateApplied { patches: usize },
    /// Peer: the connection to the host could not be established.
    JoinFailed(TransportError),
    /// Peer: the connection to the host closed.
    ConnectionLost,
    /// The transport lost its signalling registration.
    SignallingLost,
    /// Host: an action request relayed from a peer failed.
    ActionRejected {
        player: PlayerId,
        action: String,
        reason: String,
    },
    /// An inbound payload could not be decoded and was skipped.
    PayloadSkipped { conn: ConnectionId, reason: String },
    /// A reconnect attempt failed; another one is scheduled.
    Reconnecting { attempt: u32 },
    Reconnected,
    /// Reconnecting has failed `attempts` times in a row. Retrying continues.
    ReconnectFailed { attempts: u32 },
    /// A transport error not tied to the host link.
    TransportFailure(TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Re-register with the signalling network.
    Signalling,
    /// Peer only: reopen the connection to the host.
    HostLink,
}

#[derive(Debug)]
enum Role {
    Host(HostChannel),
    Peer(PeerChannel),
}

#[derive(Debug)]
struct PendingRoll {
    roll: DiceRoll,
    due: Instant,
}

/// One runtime's view of a shared table.
pub struct GameSession<T: Transport> {
    config: SessionConfig,
    transport: T,
    store: Store,
    registry: ActionRegistry,
    role: Role,
    session_id: SessionId,
    local_id: PlayerId,
    rng: Pcg32,
    rolls: Vec<PendingRoll>,
    reconnect: ReconnectSchedule,
    recovery: Option<Recovery>,
    events: Vec<SessionEvent>,
}

impl<T: Transport> fmt::Debug for GameSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameSession")
            .field("session_id", &self.session_id)
            .field("local_id", &self.local_id)
            .field("role", &self.role)
            .field("pending_rolls", &self.rolls.len())
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl<T: Transport> GameSession<T> {
    /// Host a new session when `session_id` is `None`, otherwise join it.
    ///
    /// A peer's join completes asynchronously; [`SessionEvent::Connected`]
    /// or [`SessionEvent::JoinFailed`] is reported by a later
    /// [`pump`](Self::pump).
    pub fn create_or_join(
        config: SessionConfig,
        mut transport: T,
        session_id: Option<SessionId>,
    ) -> SessionResult<Self> {
        let local = transport.open()?;
        let tree = StateTree::new(GameState::default().to_value().map_err(CodecError::from)?);
        let mut store = Store::with_scope(tree, config.history.clone(), config.undo_scope_path());
        let local_id = local.to_player_id();

        let (role, session_id) = match session_id {
            None => {
                let name = config.player_name.clone().unwrap_or_else(|| "Host".into());
                store
                    .tree_mut()
                    .set_as(&local_id.path(), &Player::new(local_id.clone(), name))?;
                let channel = HostChannel::listen(local.clone(), &store, config.broadcast_debounce());
                info!(target: "tabletop.session", session = %local, "hosting session");
                (Role::Host(channel), local)
            }
            Some(host) => {
                let mut channel = PeerChannel::connect(host.clone(), &mut transport)?;
                if let Some(name) = &config.player_name {
                    channel.send(
                        &mut transport,
                        &ActionRequest::new(
                            tabletop_state::actions::SET_PLAYER_NAME,
                            serde_json::json!({ "name": name }),
                        ),
                    )?;
                }
                info!(target: "tabletop.session", session = %host, peer = %local, "joining session");
                (Role::Peer(channel), host)
            }
        };

        let seed = config.rng_seed.unwrap_or_else(rand::random);
        let reconnect = ReconnectSchedule::new(config.reconnect.clone());
        Ok(Self {
            config,
            transport,
            store,
            registry: ActionRegistry::with_builtins(),
            role,
            session_id,
            local_id,
            rng: Pcg32::seed_from_u64(seed),
            rolls: Vec::new(),
            reconnect,
            recovery: None,
            events: Vec::new(),
        })
    }

    /// True iff this runtime hosts the session.
    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self.role, Role::Host(_))
    }

    /// The identifier peers use to join.
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    #[must_use]
    pub fn local_player_id(&self) -> &PlayerId {
        &self.local_id
    }

    /// The local player's record, once the tree holds it (a peer waits for
    /// the host's first state).
    #[must_use]
    pub fn local_player(&self) -> Option<Player> {
        self.store.tree().get_as(&self.local_id.path()).ok()
    }

    /// The local tree: authoritative on the host, a replica on peers.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register custom actions. Only the host executes them.
    pub fn registry_mut(&mut self) -> &mut ActionRegistry {
        &mut self.registry
    }

    /// Host: number of seated peers. Peers report 0.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        match &self.role {
            Role::Host(channel) => channel.peer_count(),
            Role::Peer(_) => 0,
        }
    }

    /// Host: state fan-outs so far. Peers report 0.
    #[must_use]
    pub fn broadcasts(&self) -> u64 {
        match &self.role {
            Role::Host(channel) => channel.broadcasts(),
            Role::Peer(_) => 0,
        }
    }

    /// Dice rolls started but not yet settled.
    #[must_use]
    pub fn pending_rolls(&self) -> usize {
        self.rolls.len()
    }

    /// Perform a user action.
    ///
    /// On the host the action runs immediately. On a peer it is forwarded to
    /// the host (queued while connecting) and its effect arrives with the
    /// next state broadcast.
    pub fn send_action(&mut self, request: ActionRequest, now: Instant) -> SessionResult<()> {
        match &mut self.role {
            Role::Peer(channel) => channel.send(&mut self.transport, &request),
            Role::Host(_) => {
                let player = self.local_id.clone();
                self.execute(&request, &player, now)
            }
        }
    }

    fn execute(&mut self, request: &ActionRequest, player: &PlayerId, now: Instant) -> SessionResult<()> {
        match request.kind.as_str() {
            UNDO => self.store.undo()?,
            REDO => self.store.redo()?,
            ROLL_DICE => self.start_roll(request, now)?,
            SHUFFLE_DECK if request.data.get("seed").is_none() => {
                let mut seeded = request.clone();
                if let Value::Object(data) = &mut seeded.data {
                    data.insert("seed".into(), Value::from(self.rng.next_u64()));
                }
                self.registry.dispatch(&mut self.store, &seeded, player)?;
            }
            _ => self.registry.dispatch(&mut self.store, request, player)?,
        }
        Ok(())
    }

    fn start_roll(&mut self, request: &ActionRequest, now: Instant) -> Result<(), ActionError> {
        let Some(id) = request.target_id() else {
            return Err(ActionError::payload(ROLL_DICE, "missing dice id"));
        };
        let faces = match self.store.tree().get_as::<Entity>(&id.path()) {
            Ok(Entity {
                kind: EntityKind::Dice { faces, .. },
                ..
            }) => faces,
            Ok(other) => {
                return Err(ActionError::Rejected(format!(
                    "'{id}' is a {}, not a dice",
                    other.kind.name()
                )));
            }
            Err(_) => return Err(ActionError::EntityNotFound(id)),
        };
        let value = roll_value(&mut self.rng, faces);
        let roll = begin_roll(&mut self.store, &id, value)?;
        debug!(target: "tabletop.session", dice = %id, value, "roll started");
        self.rolls.push(PendingRoll {
            roll,
            due: now + self.config.roll_duration(),
        });
        Ok(())
    }

    /// Advance the session to `now` and report what happened.
    pub fn pump(&mut self, now: Instant) -> Vec<SessionEvent> {
        for event in self.transport.poll_events() {
            self.handle(event, now);
        }
        self.settle_rolls(now);
        if let Role::Host(channel) = &mut self.role
            && let Err(err) = channel.flush(&self.store, &mut self.transport, now)
        {
            warn!(target: "tabletop.session", error = %err, "broadcast failed");
        }
        self.drive_recovery(now);
        std::mem::take(&mut self.events)
    }

    fn handle(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Disconnected => {
                warn!(target: "tabletop.session", "signalling connection lost");
                self.events.push(SessionEvent::SignallingLost);
                self.begin_recovery(Recovery::Signalling, now);
            }
            event if self.is_host() => self.handle_host(event, now),
            event => self.handle_peer(event, now),
        }
    }

    fn handle_host(&mut self, event: TransportEvent, now: Instant) {
        let Role::Host(channel) = &mut self.role else {
            return;
        };
        match event {
            TransportEvent::Open { conn, remote } => {
                match channel.on_open(&mut self.store, &mut self.transport, conn, &remote) {
                    Ok(player) => self.events.push(SessionEvent::PlayerJoined(player)),
                    Err(err) => {
                        warn!(target: "tabletop.session", remote = %remote, error = %err, "seating peer failed");
                    }
                }
            }
            TransportEvent::Close { conn } => {
                if let Some(player) = channel.on_close(&mut self.store, conn) {
                    self.events.push(SessionEvent::PlayerLeft(player));
                }
            }
            TransportEvent::Data { conn, payload } => match channel.decode_request(conn, &payload) {
                Ok(Some((player, request))) => {
                    if let Err(err) = self.execute(&request, &player, now) {
                        debug!(
                            target: "tabletop.session",
                            player = %player,
                            action = %request.kind,
                            error = %err,
                            "peer action rejected"
                        );
                        self.events.push(SessionEvent::ActionRejected {
                            player,
                            action: request.kind,
                            reason: err.to_string(),
                        });
                    }
                }
                Ok(None) => {}
                Err(err) => self.skip_payload(conn, &err),
            },
            TransportEvent::Error { error, .. } => self.transport_failure(error),
            TransportEvent::Disconnected => {}
        }
    }

    fn handle_peer(&mut self, event: TransportEvent, now: Instant) {
        let Role::Peer(channel) = &mut self.role else {
            return;
        };
        match event {
            TransportEvent::Open { conn, .. } => {
                if channel.on_open(&mut self.transport, conn) {
                    if self.recovery == Some(Recovery::HostLink) {
                        self.recovered();
                    } else {
                        self.events.push(SessionEvent::Connected);
                    }
                }
            }
            TransportEvent::Data { conn, payload } => {
                match channel.on_data(&mut self.store, conn, &payload) {
                    Ok(patches) => self.events.push(SessionEvent::StateApplied { patches }),
                    Err(err) => self.skip_payload(conn, &err),
                }
            }
            TransportEvent::Close { conn } => {
                if channel.on_close(conn) {
                    warn!(target: "tabletop.session", host = %self.session_id, "lost connection to host");
                    self.events.push(SessionEvent::ConnectionLost);
                    self.begin_recovery(Recovery::HostLink, now);
                }
            }
            TransportEvent::Error {
                conn: Some(conn),
                error,
            } if channel.owns(conn) => {
                let was_connected = channel.is_connected();
                channel.on_close(conn);
                if self.recovery.is_some() {
                    self.failed_attempt(now);
                } else if was_connected {
                    warn!(target: "tabletop.session", host = %self.session_id, error = %error, "host link failed");
                    self.events.push(SessionEvent::ConnectionLost);
                    self.begin_recovery(Recovery::HostLink, now);
                } else {
                    self.events.push(SessionEvent::JoinFailed(error));
                }
            }
            TransportEvent::Error { error, .. } => self.transport_failure(error),
            TransportEvent::Disconnected => {}
        }
    }

    fn transport_failure(&mut self, error: TransportError) {
        warn!(target: "tabletop.session", error = %error, "transport error");
        self.events.push(SessionEvent::TransportFailure(error));
    }

    fn skip_payload(&mut self, conn: ConnectionId, err: &dyn std::error::Error) {
        warn!(target: "tabletop.session", conn = conn.raw(), error = %err, "skipping malformed payload");
        self.events.push(SessionEvent::PayloadSkipped {
            conn,
            reason: err.to_string(),
        });
    }

    fn settle_rolls(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.rolls)
            .into_iter()
            .partition(|pending| pending.due <= now);
        self.rolls = waiting;
        for PendingRoll { roll, .. } in due {
            if let Err(err) = settle_roll(&mut self.store, &roll) {
                warn!(target: "tabletop.session", dice = %roll.dice, error = %err, "roll could not settle");
            }
        }
    }

    fn begin_recovery(&mut self, kind: Recovery, now: Instant) {
        // Signalling outranks the host link: the link cannot reopen without it.
        if self.recovery != Some(Recovery::Signalling) {
            self.recovery = Some(kind);
        }
        self.reconnect.start(now);
    }

    fn drive_recovery(&mut self, now: Instant) {
        let Some(kind) = self.recovery else {
            return;
        };
        if !self.reconnect.is_due(now) {
            return;
        }
        let attempt = match (kind, &mut self.role) {
            (Recovery::Signalling, _) => self.transport.reconnect(),
            (Recovery::HostLink, Role::Peer(channel)) => channel.reconnect(&mut self.transport),
            (Recovery::HostLink, Role::Host(_)) => Ok(()),
        };
        match (kind, attempt) {
            (_, Err(err)) => {
                debug!(target: "tabletop.session", error = %err, "reconnect attempt failed");
                self.failed_attempt(now);
            }
            (Recovery::Signalling, Ok(())) => {
                let host_link_down =
                    matches!(&self.role, Role::Peer(channel) if channel.state() == PeerState::Idle);
                self.recovered();
                if host_link_down {
                    self.begin_recovery(Recovery::HostLink, now);
                }
            }
            // The handshake completes with an Open event; until then nothing is due.
            (Recovery::HostLink, Ok(())) => self.reconnect.reset(),
        }
    }

    fn failed_attempt(&mut self, now: Instant) {
        let exhausted = self.reconnect.record_failure(now);
        let attempts = self.reconnect.attempts();
        if exhausted {
            warn!(target: "tabletop.session", attempts, "reconnect keeps failing");
            self.events.push(SessionEvent::ReconnectFailed { attempts });
        } else {
            self.events.push(SessionEvent::Reconnecting { attempt: attempts });
        }
    }

    fn recovered(&mut self) {
        info!(target: "tabletop.session", attempts = self.reconnect.attempts(), "reconnected");
        self.reconnect.reset();
        self.recovery = None;
        self.events.push(SessionEvent::Reconnected);
    }

    /// Persist the game document and the undo history.
    pub fn save_to(&self, storage: &dyn StorageBackend) -> SessionResult<()> {
        storage.save(STATE_KEY, &wire::encode_state(&self.store.tree().snapshot()))?;
        let history = self.store.undo_manager().serialize()?;
        storage.save(
            HISTORY_KEY,
            &serde_json::to_vec(&history).map_err(CodecError::from)?,
        )?;
        debug!(target: "tabletop.session", backend = storage.name(), "session saved");
        Ok(())
    }

    /// Host: restore a saved document and undo history.
    ///
    /// Returns `false` when nothing was saved or this runtime is a peer
    /// (peers take their state from the host). Saved players without a live
    /// connection are dropped; the local player and every seated peer keep
    /// their current records.
    pub fn restore_from(&mut self, storage: &dyn StorageBackend) -> SessionResult<bool> {
        let Role::Host(channel) = &self.role else {
            return Ok(false);
        };
        let Some(blob) = storage.load(STATE_KEY)? else {
            return Ok(false);
        };
        let doc = wire::decode_state(&blob)
            .map_err(|err| StorageError::Corruption(format!("{STATE_KEY}: {err}")))?;

        let live: Vec<(PlayerId, Value)> = std::iter::once(self.local_id.clone())
            .chain(channel.peers().map(|(_, id)| id.clone()))
            .filter_map(|id| {
                let record = self.store.tree().get(&id.path())?.clone();
                Some((id, record))
            })
            .collect();
        self.store.apply_snapshot(doc)?;
        for (id, record) in live {
            if !self.store.tree().contains(&id.path()) {
                self.store.tree_mut().set(&id.path(), record)?;
            }
        }
        channel.prune_players(&mut self.store, &self.local_id);

        if let Some(blob) = storage.load(HISTORY_KEY)? {
            let history: Value = serde_json::from_slice(&blob)
                .map_err(|err| StorageError::Corruption(format!("{HISTORY_KEY}: {err}")))?;
            self.store.undo_manager_mut().apply_snapshot(history)?;
        }
        info!(
            target: "tabletop.session",
            backend = storage.name(),
            undo_depth = self.store.undo_manager().undo_depth(),
            "session restored"
        );
        Ok(true)
    }

    /// Close every connection and leave the signalling network.
    pub fn shutdown(mut self) -> T {
        if let Role::Host(channel) = &mut self.role {
            channel.shutdown(&mut self.transport);
        }
        self.transport.shutdown();
        info!(target: "tabletop.session", session = %self.session_id, "session shut down");
        self.transport
    }
}
