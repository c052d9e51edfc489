//! Peer connection bookkeeping.
//!
//! Every peer connection is in exactly one of two sets:
//!
//! | Set       | Contents                                               |
//! |-----------|--------------------------------------------------------|
//! | `pending` | outbound streams still handshaking, unmatched inbound  |
//! | `active`  | both banners exchanged, identity confirmed             |
//!
//! Payloads sent to a peer before its stream is active wait in that
//! connection's queue and are written in order once it activates. Streams
//! that must be dropped while their input is being parsed are only marked;
//! [`PeerConnectionManager::apply_deferred`] tears them down after the
//! dispatch pass.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::connection::{Direction, HandshakeState, Membership, PeerConnection};
use super::registry::{InboundMatch, PeerRegistry};
use super::stream::{message_stanza, StreamEvent, STREAM_CLOSE};
use crate::config::PeerConfig;
use crate::connection::{Connection, ConnectionId, Socket};
use crate::error::{EngineError, Result};
use crate::session::{Effect, SessionEvent};

/// Owns every peer stream of one session.
#[derive(Debug)]
pub struct PeerConnectionManager {
    local_identity: String,
    registry: PeerRegistry,
    connections: HashMap<ConnectionId, PeerConnection>,
    pending: BTreeSet<ConnectionId>,
    active: BTreeSet<ConnectionId>,
    by_identity: HashMap<String, ConnectionId>,
    deferred: Vec<(ConnectionId, String)>,
    max_buffered: usize,
    handshake_timeout: Option<Duration>,
}

impl PeerConnectionManager {
    /// Create a manager announcing `config.local_identity`.
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            local_identity: config.local_identity.clone(),
            registry: PeerRegistry::new(),
            connections: HashMap::new(),
            pending: BTreeSet::new(),
            active: BTreeSet::new(),
            by_identity: HashMap::new(),
            deferred: Vec::new(),
            max_buffered: config.max_buffered_bytes,
            handshake_timeout: (config.handshake_timeout_secs > 0)
                .then(|| config.handshake_timeout()),
        }
    }

    /// Identity we announce
    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    /// Discovery state
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Whether `id` is one of ours
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Stream state for `id`
    pub fn get(&self, id: ConnectionId) -> Option<&PeerConnection> {
        self.connections.get(&id)
    }

    /// Connection currently bound to `identity`
    pub fn connection_for(&self, identity: &str) -> Option<ConnectionId> {
        self.by_identity.get(identity).copied()
    }

    /// Handshaking or unmatched connections
    pub fn pending(&self) -> &BTreeSet<ConnectionId> {
        &self.pending
    }

    /// Fully established connections
    pub fn active(&self) -> &BTreeSet<ConnectionId> {
        &self.active
    }

    fn deadline(&self, now: Instant) -> Option<Instant> {
        self.handshake_timeout.and_then(|t| now.checked_add(t))
    }

    // --- discovery -------------------------------------------------------

    /// A peer was announced or re-announced.
    pub fn peer_appeared(&mut self, identity: &str, addresses: Vec<IpAddr>, port: u16) -> bool {
        self.registry.appeared(identity, addresses, port)
    }

    /// A peer's attributes changed.
    pub fn peer_updated(&mut self, identity: &str, metadata: HashMap<String, String>) -> bool {
        self.registry.updated(identity, metadata)
    }

    /// A peer left the network; its stream goes with it.
    pub fn peer_departed(&mut self, identity: &str, out: &mut Vec<Effect>) {
        if self.registry.departed(identity).is_some() {
            self.close(identity, "peer departed", out);
        }
    }

    // --- outbound --------------------------------------------------------

    /// Start a stream to `identity` unless one exists. `id` is used only if
    /// a new connection is created.
    pub fn open(
        &mut self,
        identity: &str,
        id: ConnectionId,
        out: &mut Vec<Effect>,
    ) -> Result<ConnectionId> {
        if let Some(&existing) = self.by_identity.get(identity) {
            return Ok(existing);
        }
        let record = self
            .registry
            .get(identity)
            .ok_or_else(|| EngineError::Peer(format!("unknown peer {identity}")))?;
        let candidates: Vec<SocketAddr> = record
            .addresses
            .iter()
            .map(|ip| SocketAddr::new(*ip, record.port))
            .collect();
        let first = candidates
            .first()
            .copied()
            .ok_or_else(|| EngineError::Peer(format!("no address for {identity}")))?;

        let mut pc = PeerConnection::outbound(id, identity, candidates, self.max_buffered);
        pc.conn.begin_connect(&first.ip().to_string(), first.port())?;
        debug!(conn = %id, identity, candidate = %first, "opening peer stream");

        self.connections.insert(id, pc);
        self.pending.insert(id);
        self.by_identity.insert(identity.to_string(), id);
        out.push(Effect::Connect {
            conn: id,
            host: first.ip().to_string(),
            port: first.port(),
        });
        Ok(id)
    }

    /// Send a chat message, opening the stream first if needed.
    pub fn send_message(
        &mut self,
        identity: &str,
        body: &str,
        id: ConnectionId,
        out: &mut Vec<Effect>,
    ) -> Result<()> {
        let stanza = message_stanza(&self.local_identity, identity, body);
        self.send(identity, Bytes::from(stanza), id, out)
    }

    /// Send raw stream bytes to `identity`.
    ///
    /// Written immediately on an active stream, queued otherwise.
    pub fn send(
        &mut self,
        identity: &str,
        payload: Bytes,
        id: ConnectionId,
        out: &mut Vec<Effect>,
    ) -> Result<()> {
        let id = self.open(identity, id, out)?;
        let Some(pc) = self.connections.get_mut(&id) else {
            return Err(EngineError::Peer(format!("{id} vanished")));
        };
        if pc.membership() == Membership::Pending {
            trace!(conn = %id, identity, "queueing until handshake completes");
            pc.enqueue(payload);
            return Ok(());
        }
        if let Err(e) = pc.conn.send(&payload) {
            out.push(Effect::Event(SessionEvent::SendFailed {
                peer: identity.to_string(),
                detail: e.to_string(),
            }));
            self.teardown(id, &e.to_string(), out);
            return Err(e);
        }
        Ok(())
    }

    // --- inbound ---------------------------------------------------------

    /// Take an unsolicited connection.
    pub fn accept(&mut self, id: ConnectionId, socket: Box<dyn Socket>, now: Instant) {
        let conn = Connection::accepted(id, socket, self.max_buffered);
        let pc = PeerConnection::inbound(conn, self.deadline(now));
        debug!(conn = %id, source = ?pc.observed_addr(), "accepted peer connection");
        self.connections.insert(id, pc);
        self.pending.insert(id);
    }

    // --- connection events -----------------------------------------------

    /// A connect attempt succeeded.
    pub fn on_connected(
        &mut self,
        id: ConnectionId,
        socket: Box<dyn Socket>,
        now: Instant,
        out: &mut Vec<Effect>,
    ) {
        let deadline = self.deadline(now);
        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        let observed = socket.peer_addr().map(|a| a.ip());
        if let Err(e) = pc.conn.connected(socket) {
            warn!(conn = %id, error = %e, "unexpected connect result");
            return;
        }
        pc.set_observed(observed);
        pc.set_deadline(deadline);
        if let Err(e) = pc.send_banner(&self.local_identity) {
            self.teardown(id, &e.to_string(), out);
            return;
        }
        self.try_activate(id, out);
    }

    /// A connect attempt failed; try the next candidate or give up.
    pub fn on_connect_failed(&mut self, id: ConnectionId, detail: &str, out: &mut Vec<Effect>) {
        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        pc.conn.connect_failed();
        let failed = pc.current_candidate();
        if let Some(next) = pc.next_candidate() {
            debug!(conn = %id, ?failed, next = %next, detail, "trying next candidate");
            if pc.conn.begin_connect(&next.ip().to_string(), next.port()).is_ok() {
                out.push(Effect::Connect {
                    conn: id,
                    host: next.ip().to_string(),
                    port: next.port(),
                });
                return;
            }
        }

        let identity = pc.identity().unwrap_or_default().to_string();
        warn!(conn = %id, identity = %identity, detail, "no candidate address reachable");
        let lost = self.teardown(id, "no candidate address reachable", out);
        if lost == 0 {
            out.push(Effect::Event(SessionEvent::SendFailed {
                peer: identity,
                detail: format!("connect failed: {detail}"),
            }));
        }
    }

    /// Bytes arrived on a peer stream.
    pub fn on_data(&mut self, id: ConnectionId, data: &[u8], out: &mut Vec<Effect>) {
        match self.connections.get_mut(&id) {
            Some(pc) => pc.parser.push(data),
            None => return,
        }
        loop {
            if self.is_deferred(id) {
                break;
            }
            let Some(pc) = self.connections.get_mut(&id) else {
                break;
            };
            match pc.parser.next_event() {
                Ok(Some(event)) => self.handle_event(id, event, out),
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = %id, error = %e, "malformed peer stream");
                    self.defer_close(id, &e.to_string());
                }
            }
        }
    }

    /// The socket can take more bytes.
    pub fn on_writable(&mut self, id: ConnectionId, out: &mut Vec<Effect>) {
        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = pc.conn.flush() {
            self.teardown(id, &e.to_string(), out);
            return;
        }
        pc.refresh_local();
        self.try_activate(id, out);
    }

    /// The remote end closed or the read failed.
    pub fn on_closed(&mut self, id: ConnectionId, reason: &str, out: &mut Vec<Effect>) {
        self.teardown(id, reason, out);
    }

    fn handle_event(&mut self, id: ConnectionId, event: StreamEvent, out: &mut Vec<Effect>) {
        match event {
            StreamEvent::Opened { from, .. } => self.on_remote_opened(id, from, out),
            StreamEvent::Message { body, .. } => {
                let Some(identity) = self.connections.get(&id).and_then(|pc| pc.identity()) else {
                    return;
                };
                if let Some(body) = body {
                    out.push(Effect::Event(SessionEvent::MessageReceived {
                        from: identity.to_string(),
                        body,
                    }));
                }
            }
            StreamEvent::Stanza(raw) => trace!(conn = %id, len = raw.len(), "ignoring stanza"),
            StreamEvent::Closed => self.defer_close(id, "stream closed by peer"),
        }
    }

    fn on_remote_opened(&mut self, id: ConnectionId, from: Option<String>, out: &mut Vec<Effect>) {
        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        pc.mark_remote_opened();

        if pc.direction() == Direction::Outbound {
            if let (Some(declared), Some(expected)) = (from.as_deref(), pc.identity()) {
                if declared != expected {
                    debug!(conn = %id, declared, expected, "peer banner names another identity");
                }
            }
            self.try_activate(id, out);
            return;
        }

        let source = pc.observed_addr();
        let matched = match source {
            Some(ip) => self.registry.resolve_inbound(from.as_deref(), ip),
            None => InboundMatch::Unknown,
        };
        let identity = match matched {
            InboundMatch::Bound(identity) => identity,
            other => {
                info!(conn = %id, declared = ?from, ?source, result = ?other, "unmatched inbound stream");
                self.defer_close(id, "unknown peer");
                return;
            }
        };
        if let Some(existing) = self.by_identity.get(&identity) {
            info!(conn = %id, identity, existing = %existing, "peer already connected, dropping newcomer");
            self.defer_close(id, "duplicate stream");
            return;
        }

        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = pc.bind(&identity) {
            self.defer_close(id, &e.to_string());
            return;
        }
        self.by_identity.insert(identity, id);
        if let Err(e) = pc.send_banner(&self.local_identity) {
            self.defer_close(id, &e.to_string());
            return;
        }
        self.try_activate(id, out);
    }

    fn try_activate(&mut self, id: ConnectionId, out: &mut Vec<Effect>) {
        let Some(pc) = self.connections.get_mut(&id) else {
            return;
        };
        if !pc.is_ready() {
            return;
        }
        let flushed = pc.activate();
        let identity = pc.identity().unwrap_or_default().to_string();
        self.pending.remove(&id);
        self.active.insert(id);
        info!(conn = %id, identity = %identity, queued = flushed.len(), "peer stream active");
        out.push(Effect::Event(SessionEvent::PeerConnected {
            identity: identity.clone(),
        }));

        for payload in flushed {
            if let Err(e) = pc.conn.send(&payload) {
                out.push(Effect::Event(SessionEvent::SendFailed {
                    peer: identity,
                    detail: e.to_string(),
                }));
                self.teardown(id, &e.to_string(), out);
                return;
            }
        }
    }

    // --- teardown --------------------------------------------------------

    /// Close the stream bound to `identity`, if any.
    pub fn close(&mut self, identity: &str, reason: &str, out: &mut Vec<Effect>) {
        if let Some(id) = self.by_identity.get(identity).copied() {
            self.teardown(id, reason, out);
        }
    }

    /// Close one connection by id.
    pub fn close_connection(&mut self, id: ConnectionId, reason: &str, out: &mut Vec<Effect>) {
        self.teardown(id, reason, out);
    }

    fn is_deferred(&self, id: ConnectionId) -> bool {
        self.deferred.iter().any(|(d, _)| *d == id)
    }

    fn defer_close(&mut self, id: ConnectionId, reason: &str) {
        if !self.is_deferred(id) {
            self.deferred.push((id, reason.to_string()));
        }
    }

    /// Tear down every connection marked during dispatch.
    pub fn apply_deferred(&mut self, out: &mut Vec<Effect>) {
        for (id, reason) in std::mem::take(&mut self.deferred) {
            self.teardown(id, &reason, out);
        }
    }

    /// Drop streams that did not finish their handshake in time.
    pub fn expire(&mut self, now: Instant, out: &mut Vec<Effect>) {
        let overdue: Vec<ConnectionId> = self
            .pending
            .iter()
            .filter(|id| {
                self.connections
                    .get(id)
                    .and_then(|pc| pc.handshake_deadline())
                    .is_some_and(|d| d <= now)
            })
            .copied()
            .collect();
        for id in overdue {
            self.teardown(id, "handshake timed out", out);
        }
    }

    /// Close everything.
    pub fn close_all(&mut self, reason: &str, out: &mut Vec<Effect>) {
        self.deferred.clear();
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.teardown(id, reason, out);
        }
    }

    /// Queue writable watches for connections with a backlog.
    pub fn arm_writes(&mut self, out: &mut Vec<Effect>) {
        for (id, pc) in self.connections.iter_mut() {
            if pc.conn.arm_write_watch() {
                out.push(Effect::WatchWritable(*id));
            }
        }
    }

    /// Remove a connection from every set and release it. Returns how many
    /// queued payloads were dropped.
    fn teardown(&mut self, id: ConnectionId, reason: &str, out: &mut Vec<Effect>) -> usize {
        let Some(mut pc) = self.connections.remove(&id) else {
            return 0;
        };
        self.pending.remove(&id);
        let was_active = self.active.remove(&id);
        if let Some(identity) = pc.identity() {
            if self.by_identity.get(identity) == Some(&id) {
                self.by_identity.remove(identity);
            }
        }

        if pc.local_handshake() == HandshakeState::FullySent && pc.conn.is_connected() {
            // Best effort: whatever the socket takes right now.
            let _ = pc.conn.send(STREAM_CLOSE.as_bytes());
        }
        pc.conn.close();
        let lost = pc.discard_queued();
        debug!(conn = %id, identity = ?pc.identity(), reason, lost, "peer stream closed");
        out.push(Effect::Close(id));

        if let Some(identity) = pc.identity() {
            if lost > 0 {
                out.push(Effect::Event(SessionEvent::SendFailed {
                    peer: identity.to_string(),
                    detail: format!("{reason}; {lost} queued message(s) dropped"),
                }));
            }
            if was_active {
                out.push(Effect::Event(SessionEvent::PeerDisconnected {
                    identity: identity.to_string(),
                    reason: reason.to_string(),
                }));
            }
        }
        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryHandle, MemorySocket};
    use crate::peer::stream::stream_open;

    fn config() -> PeerConfig {
        PeerConfig {
            local_identity: "alice@laptop".into(),
            handshake_timeout_secs: 30,
            ..PeerConfig::default()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn manager() -> PeerConnectionManager {
        let mut mgr = PeerConnectionManager::new(&config());
        mgr.peer_appeared("bob@desk", vec![ip("192.168.1.20"), ip("192.168.1.21")], 5298);
        mgr.peer_appeared("carol@nas", vec![ip("192.168.1.30")], 5298);
        mgr
    }

    fn events(out: &[Effect]) -> Vec<SessionEvent> {
        out.iter()
            .filter_map(|e| match e {
                Effect::Event(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn connect(mgr: &mut PeerConnectionManager, id: ConnectionId, out: &mut Vec<Effect>) -> MemoryHandle {
        let (socket, handle) = MemorySocket::with_peer("192.168.1.20:5298".parse().unwrap());
        mgr.on_connected(id, Box::new(socket), Instant::now(), out);
        handle
    }

    #[test]
    fn test_queued_messages_flush_in_order() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(10);
        mgr.send_message("bob@desk", "first", id, &mut out).unwrap();
        mgr.send_message("bob@desk", "second", ConnectionId(11), &mut out).unwrap();
        assert_eq!(
            out[0],
            Effect::Connect {
                conn: id,
                host: "192.168.1.20".into(),
                port: 5298
            }
        );
        assert_eq!(mgr.get(id).unwrap().queued(), 2);

        let handle = connect(&mut mgr, id, &mut out);
        assert!(handle.written_string().starts_with("<?xml"));
        assert!(mgr.pending().contains(&id));

        mgr.on_data(id, stream_open("bob@desk", Some("alice@laptop")).as_bytes(), &mut out);
        assert!(mgr.active().contains(&id));
        let written = handle.written_string();
        let first = written.find("first").unwrap();
        let second = written.find("second").unwrap();
        assert!(first < second);
        assert!(events(&out).contains(&SessionEvent::PeerConnected {
            identity: "bob@desk".into()
        }));
    }

    #[test]
    fn test_candidate_fallback_then_single_failure() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(10);
        mgr.send_message("bob@desk", "hello", id, &mut out).unwrap();
        out.clear();

        mgr.on_connect_failed(id, "refused", &mut out);
        assert_eq!(
            out,
            [Effect::Connect {
                conn: id,
                host: "192.168.1.21".into(),
                port: 5298
            }]
        );
        out.clear();

        mgr.on_connect_failed(id, "refused", &mut out);
        let failures: Vec<_> = events(&out)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::SendFailed { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(out.contains(&Effect::Close(id)));
        assert!(!mgr.contains(id));
        assert!(mgr.connection_for("bob@desk").is_none());
    }

    #[test]
    fn test_join_failure_still_reports_once() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = mgr.open("carol@nas", ConnectionId(20), &mut out).unwrap();
        out.clear();
        mgr.on_connect_failed(id, "timed out", &mut out);
        assert_eq!(events(&out).len(), 1);
    }

    #[test]
    fn test_inbound_bound_by_declared_identity() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(30);
        let (socket, handle) = MemorySocket::with_peer("192.168.1.21:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), Instant::now());
        assert!(mgr.pending().contains(&id));

        mgr.on_data(id, stream_open("bob@desk", None).as_bytes(), &mut out);
        mgr.apply_deferred(&mut out);
        assert!(mgr.active().contains(&id));
        assert_eq!(mgr.connection_for("bob@desk"), Some(id));
        assert!(handle.written_string().contains("to=\"bob@desk\""));
    }

    #[test]
    fn test_inbound_bound_by_address_only() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(31);
        let (socket, _handle) = MemorySocket::with_peer("192.168.1.30:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), Instant::now());
        mgr.on_data(id, b"<stream:stream xmlns='jabber:client'>", &mut out);
        mgr.apply_deferred(&mut out);
        assert_eq!(mgr.connection_for("carol@nas"), Some(id));
    }

    #[test]
    fn test_inbound_from_wrong_address_is_closed() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(32);
        let (socket, handle) = MemorySocket::with_peer("10.9.9.9:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), Instant::now());

        mgr.on_data(id, stream_open("bob@desk", None).as_bytes(), &mut out);
        // Still present until the dispatch pass is over.
        assert!(mgr.contains(id));
        mgr.apply_deferred(&mut out);
        assert!(!mgr.contains(id));
        assert!(out.contains(&Effect::Close(id)));
        assert!(handle.is_shut_down());
        assert!(mgr.connection_for("bob@desk").is_none());
    }

    #[test]
    fn test_duplicate_inbound_is_closed() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let first = ConnectionId(40);
        let (socket, _h1) = MemorySocket::with_peer("192.168.1.20:40000".parse().unwrap());
        mgr.accept(first, Box::new(socket), Instant::now());
        mgr.on_data(first, stream_open("bob@desk", None).as_bytes(), &mut out);

        let second = ConnectionId(41);
        let (socket, _h2) = MemorySocket::with_peer("192.168.1.20:40001".parse().unwrap());
        mgr.accept(second, Box::new(socket), Instant::now());
        mgr.on_data(second, stream_open("bob@desk", None).as_bytes(), &mut out);
        mgr.apply_deferred(&mut out);

        assert_eq!(mgr.connection_for("bob@desk"), Some(first));
        assert!(!mgr.contains(second));
    }

    #[test]
    fn test_message_and_remote_close() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = ConnectionId(50);
        let (socket, handle) = MemorySocket::with_peer("192.168.1.20:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), Instant::now());

        let mut input = stream_open("bob@desk", None);
        input.push_str(&message_stanza("bob@desk", "alice@laptop", "hi &amp; bye"));
        input.push_str(STREAM_CLOSE);
        mgr.on_data(id, input.as_bytes(), &mut out);
        mgr.apply_deferred(&mut out);

        let evs = events(&out);
        assert!(evs.contains(&SessionEvent::MessageReceived {
            from: "bob@desk".into(),
            body: "hi &amp; bye".into(),
        }));
        assert!(evs.contains(&SessionEvent::PeerDisconnected {
            identity: "bob@desk".into(),
            reason: "stream closed by peer".into(),
        }));
        // Our banner went out fully, so the close marker follows it.
        assert!(handle.written_string().ends_with(STREAM_CLOSE));
    }

    #[test]
    fn test_handshake_timeout() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let now = Instant::now();
        let id = ConnectionId(60);
        let (socket, _h) = MemorySocket::with_peer("192.168.1.20:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), now);

        mgr.expire(now + Duration::from_secs(5), &mut out);
        assert!(mgr.contains(id));
        mgr.expire(now + Duration::from_secs(31), &mut out);
        assert!(!mgr.contains(id));
    }

    #[test]
    fn test_unbounded_handshake_timeout() {
        let mut mgr = PeerConnectionManager::new(&PeerConfig {
            handshake_timeout_secs: u64::MAX,
            ..config()
        });
        let mut out = Vec::new();
        let now = Instant::now();
        let id = ConnectionId(61);
        let (socket, _h) = MemorySocket::with_peer("192.168.1.20:40000".parse().unwrap());
        mgr.accept(id, Box::new(socket), now);

        assert!(mgr.get(id).unwrap().handshake_deadline().is_none());
        mgr.expire(now + Duration::from_secs(3600), &mut out);
        assert!(mgr.contains(id));
    }

    #[test]
    fn test_banner_backpressure_delays_activation() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = mgr.open("bob@desk", ConnectionId(70), &mut out).unwrap();
        let (socket, handle) = MemorySocket::with_peer("192.168.1.20:5298".parse().unwrap());
        handle.set_capacity(Some(8));
        mgr.on_connected(id, Box::new(socket), Instant::now(), &mut out);
        mgr.on_data(id, stream_open("bob@desk", None).as_bytes(), &mut out);
        assert_eq!(
            mgr.get(id).unwrap().local_handshake(),
            HandshakeState::PartiallySent
        );
        assert!(mgr.pending().contains(&id));

        out.clear();
        mgr.arm_writes(&mut out);
        assert_eq!(out, [Effect::WatchWritable(id)]);

        handle.set_capacity(None);
        mgr.on_writable(id, &mut out);
        assert!(mgr.active().contains(&id));
    }

    #[test]
    fn test_departure_closes_stream() {
        let mut mgr = manager();
        let mut out = Vec::new();
        let id = mgr.open("bob@desk", ConnectionId(80), &mut out).unwrap();
        mgr.peer_departed("bob@desk", &mut out);
        assert!(!mgr.contains(id));
        assert!(mgr.send_message("bob@desk", "hi", ConnectionId(81), &mut out).is_err());
    }
}
