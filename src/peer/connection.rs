//! One peer stream.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;

use super::stream::{stream_open, StreamParser};
use crate::connection::{Connection, ConnectionId};
use crate::error::{EngineError, Result};

/// How much of our stream-open banner the socket has accepted.
///
/// Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeState {
    /// Nothing written
    NotSent,
    /// Some of the banner is still queued
    PartiallySent,
    /// Every banner byte was accepted
    FullySent,
}

/// Whether the peer's identity has been confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    /// Handshake not finished
    Pending,
    /// Both banners exchanged, identity confirmed
    Active,
}

/// Who opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We dialed
    Outbound,
    /// They dialed
    Inbound,
}

/// Stream state for one peer connection.
#[derive(Debug)]
pub struct PeerConnection {
    pub(crate) conn: Connection,
    pub(crate) parser: StreamParser,
    direction: Direction,
    identity: Option<String>,
    local: HandshakeState,
    banner_end: u64,
    remote_opened: bool,
    membership: Membership,
    candidates: Vec<SocketAddr>,
    candidate: usize,
    queued: VecDeque<Bytes>,
    observed: Option<IpAddr>,
    handshake_deadline: Option<Instant>,
}

impl PeerConnection {
    /// Outbound stream to `identity`, trying `candidates` in order.
    pub fn outbound(
        id: ConnectionId,
        identity: &str,
        candidates: Vec<SocketAddr>,
        max_buffered: usize,
    ) -> Self {
        Self::build(
            Connection::new(id, max_buffered),
            Direction::Outbound,
            Some(identity.to_string()),
            candidates,
        )
    }

    /// Inbound stream on an accepted socket; identity unknown until matched.
    pub fn inbound(conn: Connection, deadline: Option<Instant>) -> Self {
        let observed = conn.peer_addr().map(|a| a.ip());
        let mut pc = Self::build(conn, Direction::Inbound, None, Vec::new());
        pc.observed = observed;
        pc.handshake_deadline = deadline;
        pc
    }

    fn build(
        conn: Connection,
        direction: Direction,
        identity: Option<String>,
        candidates: Vec<SocketAddr>,
    ) -> Self {
        Self {
            conn,
            parser: StreamParser::new(),
            direction,
            identity,
            local: HandshakeState::NotSent,
            banner_end: 0,
            remote_opened: false,
            membership: Membership::Pending,
            candidates,
            candidate: 0,
            queued: VecDeque::new(),
            observed: None,
            handshake_deadline: None,
        }
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Who opened the stream
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bound identity, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Local banner progress
    pub fn local_handshake(&self) -> HandshakeState {
        self.local
    }

    /// Whether the remote banner arrived
    pub fn remote_opened(&self) -> bool {
        self.remote_opened
    }

    /// Pending or active
    pub fn membership(&self) -> Membership {
        self.membership
    }

    /// Source address of the socket
    pub fn observed_addr(&self) -> Option<IpAddr> {
        self.observed
    }

    /// Payloads waiting for the handshake
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// When the handshake must be done
    pub fn handshake_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    /// Candidate currently being tried
    pub fn current_candidate(&self) -> Option<SocketAddr> {
        self.candidates.get(self.candidate).copied()
    }

    /// Move to the next candidate address.
    pub fn next_candidate(&mut self) -> Option<SocketAddr> {
        self.candidate += 1;
        self.current_candidate()
    }

    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.handshake_deadline = deadline;
    }

    pub(crate) fn set_observed(&mut self, ip: Option<IpAddr>) {
        self.observed = ip;
    }

    /// Attach an identity to an unbound stream.
    pub fn bind(&mut self, identity: &str) -> Result<()> {
        match &self.identity {
            Some(existing) if existing != identity => Err(EngineError::Peer(format!(
                "{} already bound to {existing}",
                self.id()
            ))),
            _ => {
                self.identity = Some(identity.to_string());
                Ok(())
            }
        }
    }

    /// Write our banner. Only the first call writes anything.
    pub fn send_banner(&mut self, local_identity: &str) -> Result<()> {
        if self.local != HandshakeState::NotSent {
            return Ok(());
        }
        let banner = stream_open(local_identity, self.identity.as_deref());
        self.banner_end = self.conn.bytes_written() + banner.len() as u64;
        self.advance_local(HandshakeState::PartiallySent);
        self.conn.send(banner.as_bytes())?;
        self.refresh_local();
        Ok(())
    }

    /// Recompute local banner progress from bytes written.
    pub fn refresh_local(&mut self) {
        if self.local == HandshakeState::PartiallySent && self.conn.bytes_written() >= self.banner_end {
            self.advance_local(HandshakeState::FullySent);
        }
    }

    fn advance_local(&mut self, next: HandshakeState) {
        if next > self.local {
            self.local = next;
        }
    }

    /// Note that the remote banner arrived.
    pub fn mark_remote_opened(&mut self) {
        self.remote_opened = true;
    }

    /// Whether everything needed to become active is in place.
    pub fn is_ready(&self) -> bool {
        self.membership == Membership::Pending
            && self.local == HandshakeState::FullySent
            && self.remote_opened
            && self.identity.is_some()
    }

    /// Become active, handing back whatever was queued, oldest first.
    pub fn activate(&mut self) -> Vec<Bytes> {
        self.membership = Membership::Active;
        self.handshake_deadline = None;
        self.queued.drain(..).collect()
    }

    /// Hold a payload until the stream is active.
    pub fn enqueue(&mut self, payload: Bytes) {
        self.queued.push_back(payload);
    }

    /// Drop everything queued, returning how many payloads were lost.
    pub fn discard_queued(&mut self) -> usize {
        let n = self.queued.len();
        self.queued.clear();
        n
    }
}
