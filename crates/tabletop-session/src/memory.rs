#![forbid(unsafe_code)]

//! In-process transport with fault injection.
//!
//! A [`MemoryNetwork`] plays the role of the signalling server and the data
//! channels between endpoints. Every [`MemoryTransport`] created from it is
//! one endpoint. Events are queued per endpoint and delivered on
//! [`poll_events`](Transport::poll_events), so delivery interleaves the same
//! way it does over a real network: nothing happens until the owner polls.
//!
//! Fault helpers let tests sever links, stall handshakes, drop an endpoint's
//! signalling registration, refuse reconnects and inject raw bytes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::transport::{ConnectionId, PeerId, Transport, TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// Handshake never completes while either end is stalled.
    Pending,
    Open,
    Closed,
}

#[derive(Debug)]
struct Link {
    /// `(endpoint, connection id on that endpoint)` for initiator and acceptor.
    ends: [(usize, ConnectionId); 2],
    state: LinkState,
}

impl Link {
    fn side_of(&self, endpoint: usize, conn: ConnectionId) -> Option<usize> {
        self.ends.iter().position(|&end| end == (endpoint, conn))
    }

    fn involves(&self, endpoint: usize) -> bool {
        self.ends.iter().any(|&(e, _)| e == endpoint)
    }
}

#[derive(Debug, Default)]
struct Endpoint {
    requested: Option<PeerId>,
    id: Option<PeerId>,
    online: bool,
    stalled: bool,
    refuse_reconnect: bool,
    inbox: VecDeque<TransportEvent>,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: Vec<Endpoint>,
    links: Vec<Link>,
    next_conn: u64,
    next_peer: u64,
}

impl NetworkState {
    fn endpoint_of(&self, id: &PeerId) -> Option<usize> {
        self.endpoints
            .iter()
            .position(|e| e.online && e.id.as_ref() == Some(id))
    }

    fn alloc_conn(&mut self) -> ConnectionId {
        self.next_conn += 1;
        ConnectionId::new(self.next_conn)
    }

    fn open_link(&mut self, index: usize) {
        let link = &mut self.links[index];
        link.state = LinkState::Open;
        let [(a, conn_a), (b, conn_b)] = link.ends;
        let id_a = self.endpoints[a].id.clone();
        let id_b = self.endpoints[b].id.clone();
        if let (Some(id_a), Some(id_b)) = (id_a, id_b) {
            self.endpoints[a].inbox.push_back(TransportEvent::Open {
                conn: conn_a,
                remote: id_b,
            });
            self.endpoints[b].inbox.push_back(TransportEvent::Open {
                conn: conn_b,
                remote: id_a,
            });
        }
    }

    fn close_link(&mut self, index: usize) {
        let link = &mut self.links[index];
        let was_open = link.state == LinkState::Open;
        link.state = LinkState::Closed;
        if was_open {
            for (endpoint, conn) in link.ends {
                self.endpoints[endpoint]
                    .inbox
                    .push_back(TransportEvent::Close { conn });
            }
        }
    }
}

/// Shared in-process network. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Rc<RefCell<NetworkState>>,
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("MemoryNetwork")
            .field("endpoints", &state.endpoints.len())
            .field("links", &state.links.len())
            .finish()
    }
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A new endpoint that receives a generated identity (`peer-N`) on open.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        self.add_endpoint(None)
    }

    /// A new endpoint that registers as `id` on open.
    #[must_use]
    pub fn transport_with_id(&self, id: PeerId) -> MemoryTransport {
        self.add_endpoint(Some(id))
    }

    fn add_endpoint(&self, requested: Option<PeerId>) -> MemoryTransport {
        let mut state = self.state.borrow_mut();
        state.endpoints.push(Endpoint {
            requested,
            ..Endpoint::default()
        });
        MemoryTransport {
            network: self.clone(),
            endpoint: state.endpoints.len() - 1,
        }
    }

    fn with_endpoint(&self, peer: &PeerId, f: impl FnOnce(&mut NetworkState, usize)) -> bool {
        let mut state = self.state.borrow_mut();
        // Before `open`, an endpoint is addressable by the id it requested.
        let found = state
            .endpoints
            .iter()
            .position(|e| e.id.as_ref().or(e.requested.as_ref()) == Some(peer));
        match found {
            Some(index) => {
                f(&mut state, index);
                true
            }
            None => false,
        }
    }

    /// Drop every open link of `peer`; both ends observe `Close`.
    pub fn sever(&self, peer: &PeerId) -> bool {
        self.with_endpoint(peer, |state, endpoint| {
            let affected: Vec<usize> = state
                .links
                .iter()
                .enumerate()
                .filter(|(_, link)| link.involves(endpoint) && link.state != LinkState::Closed)
                .map(|(i, _)| i)
                .collect();
            for index in affected {
                state.close_link(index);
            }
        })
    }

    /// Fail every live or pending link of `peer` with `error`.
    ///
    /// `peer` observes `Error` on its end; the far end of an open link
    /// observes `Close`.
    pub fn fail_links(&self, peer: &PeerId, error: TransportError) -> bool {
        self.with_endpoint(peer, |state, endpoint| {
            for link in &mut state.links {
                if link.state == LinkState::Closed || !link.involves(endpoint) {
                    continue;
                }
                let was_open = link.state == LinkState::Open;
                link.state = LinkState::Closed;
                for (end, conn) in link.ends {
                    let event = if end == endpoint {
                        TransportEvent::Error {
                            conn: Some(conn),
                            error: error.clone(),
                        }
                    } else if was_open {
                        TransportEvent::Close { conn }
                    } else {
                        continue;
                    };
                    state.endpoints[end].inbox.push_back(event);
                }
            }
        })
    }

    /// While stalled, handshakes involving `peer` never complete.
    pub fn stall(&self, peer: &PeerId, stalled: bool) -> bool {
        self.with_endpoint(peer, |state, endpoint| {
            state.endpoints[endpoint].stalled = stalled;
            if stalled {
                return;
            }
            let pending: Vec<usize> = state
                .links
                .iter()
                .enumerate()
                .filter(|(_, link)| {
                    link.state == LinkState::Pending
                        && link.involves(endpoint)
                        && link.ends.iter().all(|&(e, _)| !state.endpoints[e].stalled)
                })
                .map(|(i, _)| i)
                .collect();
            for index in pending {
                state.open_link(index);
            }
        })
    }

    /// Deliver raw bytes from `from` to `to` over their open link.
    pub fn inject(&self, from: &PeerId, to: &PeerId, payload: Vec<u8>) -> bool {
        let mut state = self.state.borrow_mut();
        let (Some(a), Some(b)) = (
            state.endpoints.iter().position(|e| e.id.as_ref() == Some(from)),
            state.endpoints.iter().position(|e| e.id.as_ref() == Some(to)),
        ) else {
            return false;
        };
        let target = state.links.iter().find_map(|link| {
            if link.state != LinkState::Open {
                return None;
            }
            match link.ends {
                [(x, _), (y, conn)] | [(y, conn), (x, _)] if x == a && y == b => Some(conn),
                _ => None,
            }
        });
        match target {
            Some(conn) => {
                state.endpoints[b]
                    .inbox
                    .push_back(TransportEvent::Data { conn, payload });
                true
            }
            None => false,
        }
    }

    /// Unregister `peer` from signalling; it observes `Disconnected`.
    ///
    /// Existing data links stay open.
    pub fn drop_signalling(&self, peer: &PeerId) -> bool {
        self.with_endpoint(peer, |state, endpoint| {
            let endpoint = &mut state.endpoints[endpoint];
            if endpoint.online {
                endpoint.online = false;
                endpoint.inbox.push_back(TransportEvent::Disconnected);
            }
        })
    }

    /// Make reconnect attempts by `peer` fail with `Unreachable`.
    pub fn refuse_reconnect(&self, peer: &PeerId, refuse: bool) -> bool {
        self.with_endpoint(peer, |state, endpoint| {
            state.endpoints[endpoint].refuse_reconnect = refuse;
        })
    }

    /// `from`'s connection id of its open link to `to`.
    #[must_use]
    pub fn connection_to(&self, from: &PeerId, to: &PeerId) -> Option<ConnectionId> {
        let state = self.state.borrow();
        let a = state
            .endpoints
            .iter()
            .position(|e| e.id.as_ref() == Some(from))?;
        let b = state
            .endpoints
            .iter()
            .position(|e| e.id.as_ref() == Some(to))?;
        state.links.iter().find_map(|link| {
            if link.state != LinkState::Open {
                return None;
            }
            match link.ends {
                [(x, conn), (y, _)] | [(y, _), (x, conn)] if x == a && y == b => Some(conn),
                _ => None,
            }
        })
    }

    /// Number of open links involving `peer`.
    #[must_use]
    pub fn open_links(&self, peer: &PeerId) -> usize {
        let state = self.state.borrow();
        let Some(endpoint) = state
            .endpoints
            .iter()
            .position(|e| e.id.as_ref() == Some(peer))
        else {
            return 0;
        };
        state
            .links
            .iter()
            .filter(|link| link.state == LinkState::Open && link.involves(endpoint))
            .count()
    }
}

/// One endpoint of a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    endpoint: usize,
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("endpoint", &self.endpoint)
            .field("id", &self.local_id())
            .finish()
    }
}

impl MemoryTransport {
    #[must_use]
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self) -> Result<PeerId, TransportError> {
        let mut state = self.network.state.borrow_mut();
        if let Some(id) = state.endpoints[self.endpoint].id.clone() {
            state.endpoints[self.endpoint].online = true;
            return Ok(id);
        }
        let id = match state.endpoints[self.endpoint].requested.clone() {
            Some(id) => id,
            None => {
                state.next_peer += 1;
                PeerId::parse(&format!("peer-{}", state.next_peer))?
            }
        };
        if state.endpoint_of(&id).is_some() {
            return Err(TransportError::InvalidPeerId(id.to_string()));
        }
        let endpoint = &mut state.endpoints[self.endpoint];
        endpoint.id = Some(id.clone());
        endpoint.online = true;
        trace!(target: "tabletop.transport", peer = %id, "endpoint registered");
        Ok(id)
    }

    fn local_id(&self) -> Option<PeerId> {
        self.network.state.borrow().endpoints[self.endpoint].id.clone()
    }

    fn connect(&mut self, remote: &PeerId) -> Result<ConnectionId, TransportError> {
        let mut state = self.network.state.borrow_mut();
        if !state.endpoints[self.endpoint].online {
            return Err(TransportError::NotOpen);
        }
        let target = state
            .endpoint_of(remote)
            .ok_or_else(|| TransportError::PeerUnavailable(remote.to_string()))?;

        let local_conn = state.alloc_conn();
        let remote_conn = state.alloc_conn();
        state.links.push(Link {
            ends: [(self.endpoint, local_conn), (target, remote_conn)],
            state: LinkState::Pending,
        });
        let index = state.links.len() - 1;
        let stalled = state.endpoints[self.endpoint].stalled || state.endpoints[target].stalled;
        if !stalled {
            state.open_link(index);
        }
        trace!(
            target: "tabletop.transport",
            remote = %remote,
            conn = local_conn.raw(),
            stalled,
            "connect"
        );
        Ok(local_conn)
    }

    fn send(&mut self, conn: ConnectionId, payload: Vec<u8>) {
        let mut state = self.network.state.borrow_mut();
        let delivery = state.links.iter().find_map(|link| {
            let side = link.side_of(self.endpoint, conn)?;
            (link.state == LinkState::Open).then(|| link.ends[1 - side])
        });
        match delivery {
            Some((endpoint, remote_conn)) => state.endpoints[endpoint]
                .inbox
                .push_back(TransportEvent::Data {
                    conn: remote_conn,
                    payload,
                }),
            None => trace!(
                target: "tabletop.transport",
                conn = conn.raw(),
                "send on closed connection dropped"
            ),
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        let mut state = self.network.state.borrow_mut();
        let index = state
            .links
            .iter()
            .position(|link| link.side_of(self.endpoint, conn).is_some());
        if let Some(index) = index {
            state.close_link(index);
        }
    }

    fn poll_events(&mut self) -> Vec<TransportEvent> {
        self.network.state.borrow_mut().endpoints[self.endpoint]
            .inbox
            .drain(..)
            .collect()
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.network.state.borrow_mut();
        let endpoint = &mut state.endpoints[self.endpoint];
        if endpoint.refuse_reconnect || endpoint.id.is_none() {
            return Err(TransportError::Unreachable);
        }
        endpoint.online = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.network.state.borrow_mut();
        let affected: Vec<usize> = state
            .links
            .iter()
            .enumerate()
            .filter(|(_, link)| link.involves(self.endpoint) && link.state != LinkState::Closed)
            .map(|(i, _)| i)
            .collect();
        for index in affected {
            state.close_link(index);
        }
        state.endpoints[self.endpoint].online = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (MemoryNetwork, MemoryTransport, MemoryTransport, PeerId, PeerId) {
        let net = MemoryNetwork::new();
        let mut host = net.transport();
        let mut peer = net.transport();
        let host_id = host.open().unwrap();
        let peer_id = peer.open().unwrap();
        (net, host, peer, host_id, peer_id)
    }

    #[test]
    fn connect_opens_both_ends_and_carries_data() {
        let (_net, mut host, mut peer, host_id, peer_id) = pair();
        let conn = peer.connect(&host_id).unwrap();

        let host_events = host.poll_events();
        let TransportEvent::Open { conn: host_conn, remote } = host_events[0].clone() else {
            panic!("expected open, got {host_events:?}");
        };
        assert_eq!(remote, peer_id);
        assert_eq!(
            peer.poll_events(),
            vec![TransportEvent::Open {
                conn,
                remote: host_id
            }]
        );

        host.send(host_conn, b"hello".to_vec());
        assert_eq!(
            peer.poll_events(),
            vec![TransportEvent::Data {
                conn,
                payload: b"hello".to_vec()
            }]
        );
    }

    #[test]
    fn connect_to_unknown_peer_fails() {
        let (_net, _host, mut peer, _, _) = pair();
        let ghost = PeerId::parse("ghost").unwrap();
        assert_eq!(
            peer.connect(&ghost),
            Err(TransportError::PeerUnavailable("ghost".into()))
        );
    }

    #[test]
    fn generated_ids_are_unique_and_requested_ids_are_exclusive() {
        let net = MemoryNetwork::new();
        let a = net.transport().open().unwrap();
        let b = net.transport().open().unwrap();
        assert_ne!(a, b);

        let id = PeerId::parse("table").unwrap();
        net.transport_with_id(id.clone()).open().unwrap();
        assert!(matches!(
            net.transport_with_id(id).open(),
            Err(TransportError::InvalidPeerId(_))
        ));
    }

    #[test]
    fn send_after_close_is_a_no_op() {
        let (_net, mut host, mut peer, host_id, _) = pair();
        let conn = peer.connect(&host_id).unwrap();
        host.poll_events();
        peer.poll_events();

        peer.close(conn);
        assert!(matches!(host.poll_events()[..], [TransportEvent::Close { .. }]));
        peer.send(conn, b"late".to_vec());
        assert!(host.poll_events().is_empty());
    }

    #[test]
    fn stalled_handshake_completes_on_release() {
        let (net, mut host, mut peer, host_id, peer_id) = pair();
        net.stall(&peer_id, true);
        let conn = peer.connect(&host_id).unwrap();
        assert!(host.poll_events().is_empty());
        peer.send(conn, b"early".to_vec());

        net.stall(&peer_id, false);
        assert!(matches!(host.poll_events()[..], [TransportEvent::Open { .. }]));
        assert_eq!(net.open_links(&host_id), 1);
    }

    #[test]
    fn dropped_signalling_keeps_links_and_reconnect_can_be_refused() {
        let (net, mut host, mut peer, host_id, _) = pair();
        peer.connect(&host_id).unwrap();
        host.poll_events();

        net.drop_signalling(&host_id);
        assert_eq!(host.poll_events(), vec![TransportEvent::Disconnected]);
        assert_eq!(net.open_links(&host_id), 1);

        net.refuse_reconnect(&host_id, true);
        assert_eq!(host.reconnect(), Err(TransportError::Unreachable));
        net.refuse_reconnect(&host_id, false);
        assert_eq!(host.reconnect(), Ok(()));
    }

    #[test]
    fn sever_closes_both_ends() {
        let (net, mut host, mut peer, host_id, peer_id) = pair();
        peer.connect(&host_id).unwrap();
        host.poll_events();
        peer.poll_events();

        assert!(net.sever(&peer_id));
        assert!(matches!(host.poll_events()[..], [TransportEvent::Close { .. }]));
        assert!(matches!(peer.poll_events()[..], [TransportEvent::Close { .. }]));
        assert_eq!(net.connection_to(&host_id, &peer_id), None);
    }

    #[test]
    fn failed_link_reports_error_locally_and_close_remotely() {
        let (net, mut host, mut peer, host_id, peer_id) = pair();
        let conn = peer.connect(&host_id).unwrap();
        host.poll_events();
        peer.poll_events();

        assert!(net.fail_links(&peer_id, TransportError::ConnectionClosed(conn)));
        assert_eq!(
            peer.poll_events(),
            vec![TransportEvent::Error {
                conn: Some(conn),
                error: TransportError::ConnectionClosed(conn),
            }]
        );
        assert!(matches!(host.poll_events()[..], [TransportEvent::Close { .. }]));
        assert_eq!(net.open_links(&peer_id), 0);
    }
}
