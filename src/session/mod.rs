//! Session: the composition root of the engine.
//!
//! A [`Session`] owns the control-channel command processor, the login
//! state machine and the peer connection manager. It performs no I/O: each
//! input (bytes read, connect results, writable readiness, ticket results,
//! clock ticks, discovery events, API calls) updates state and queues
//! [`Effect`]s, which the runtime driver drains with
//! [`Session::drain_effects`] and executes.
//!
//! ```text
//!            inputs                           effects
//!  on_data / on_connected ──┐          ┌──> Connect { conn, host, port }
//!  on_writable / on_closed ─┤          ├──> WatchWritable(conn)
//!  on_ticket / tick ────────┼─> Session┼──> Close(conn)
//!  peer_appeared / ... ─────┤          ├──> RequestTicket(..)
//!  send_message / join ... ─┘          └──> Event(SessionEvent)
//! ```
//!
//! Connection ids are allocated by the Session and never reused, so results
//! that arrive for a connection that has since been closed are recognised
//! and ignored.

mod events;
mod notification;

pub use events::{Effect, SessionEvent};

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connection::{Connection, ConnectionId, Socket};
use crate::error::{EngineError, ErrorKind, Result};
use crate::login::{LoginStateMachine, LoginStep, TicketRequest};
use crate::peer::PeerConnectionManager;
use crate::protocol::{cmdproc, CmdProc, CmdProcHost, Transaction, VERSION_SUFFIX};

/// Contact list sync progress.
#[derive(Debug, Clone, Copy, Default)]
struct SyncProgress {
    expected: Option<u32>,
    received: u32,
}

/// One signed-in account: control channel plus peer streams.
pub struct Session {
    id: String,
    config: Config,
    cmdproc: CmdProc<Session>,
    login: LoginStateMachine,
    peers: PeerConnectionManager,
    effects: Vec<Effect>,
    next_conn: u64,
    sync: SyncProgress,
    friendly_name: String,
    closed: bool,
}

impl CmdProcHost for Session {
    fn cmdproc(&mut self) -> &mut CmdProc<Self> {
        &mut self.cmdproc
    }
}

impl Session {
    /// Create a session; nothing happens until [`Session::login`].
    pub fn new(config: Config) -> Self {
        let control = Connection::new(ConnectionId(1), config.peer.max_buffered_bytes);
        let cmdproc = CmdProc::new(
            control,
            notification::table(),
            config.timeouts.transaction(),
        );
        Self {
            id: Uuid::new_v4().to_string(),
            login: LoginStateMachine::new(config.timeouts.login_step()),
            peers: PeerConnectionManager::new(&config.peer),
            friendly_name: config.account.account.clone(),
            config,
            cmdproc,
            effects: Vec::new(),
            next_conn: 2,
            sync: SyncProgress::default(),
            closed: false,
        }
    }

    /// Session ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current login step
    pub fn login_step(&self) -> LoginStep {
        self.login.step()
    }

    /// Id of the current control connection
    pub fn control_id(&self) -> ConnectionId {
        self.cmdproc.id()
    }

    /// Friendly name the server reported for us
    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Peer streams
    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    /// Control-channel transactions awaiting a reply
    pub fn pending_transactions(&self) -> usize {
        self.cmdproc.transactions().len()
    }

    /// Whether the control session is over (failed or closed)
    pub fn is_finished(&self) -> bool {
        self.closed || self.login.is_failed()
    }

    /// Take every queued effect, oldest first.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn alloc_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_conn);
        self.next_conn += 1;
        id
    }

    // --- API -------------------------------------------------------------

    /// Start logging in: connect to the configured server.
    pub fn login(&mut self) -> Result<()> {
        if self.login.step() != LoginStep::Start || self.closed {
            return Err(EngineError::InvalidState(format!(
                "login already started ({})",
                self.login.step()
            )));
        }
        self.config.validate()?;
        let host = self.config.server.host.clone();
        let port = self.config.server.port;
        self.cmdproc.connection_mut().begin_connect(&host, port)?;
        self.login.begin(Instant::now());
        info!(session = %self.id, account = %self.config.account.account, server = %self.config.server.addr(), "logging in");
        self.effects.push(Effect::Connect {
            conn: self.cmdproc.id(),
            host,
            port,
        });
        Ok(())
    }

    /// Send a chat message to a peer, opening a stream if needed.
    pub fn send_message(&mut self, peer: &str, body: &str) -> Result<()> {
        let id = self.alloc_id();
        let result = self.peers.send_message(peer, body, id, &mut self.effects);
        self.finish_turn();
        result
    }

    /// Open a stream to a peer ahead of any message.
    pub fn join(&mut self, peer: &str) -> Result<ConnectionId> {
        let id = self.alloc_id();
        let result = self.peers.open(peer, id, &mut self.effects);
        self.finish_turn();
        result
    }

    /// Close the stream to a peer.
    pub fn leave(&mut self, peer: &str) {
        self.peers.close(peer, "closed locally", &mut self.effects);
        self.finish_turn();
    }

    /// Change our presence.
    pub fn set_status(&mut self, status: &str) -> Result<u32> {
        self.send_command(Transaction::new("CHG").param(status))
    }

    /// Add a contact to `list` (`FL`, `AL`, `BL`).
    pub fn add_contact(&mut self, list: &str, account: &str, friendly_name: &str) -> Result<u32> {
        self.send_command(
            Transaction::new("ADD")
                .param(list)
                .param(account)
                .param(notification::encode_friendly_name(friendly_name)),
        )
    }

    /// Remove a contact from `list`.
    pub fn remove_contact(&mut self, list: &str, account: &str) -> Result<u32> {
        self.send_command(Transaction::new("REM").param(list).param(account))
    }

    /// Send an arbitrary command on the control channel once logged in.
    pub fn send_command(&mut self, txn: Transaction<Session>) -> Result<u32> {
        if !self.login.is_connected() || self.closed {
            return Err(EngineError::InvalidState(format!(
                "cannot send {} while {}",
                txn.verb(),
                self.login.step()
            )));
        }
        let result = self.cmdproc.send(txn, Instant::now());
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                self.fail(e.kind(), e.to_string());
            }
        }
        self.finish_turn();
        result
    }

    /// Sign off and release every connection.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        info!(session = %self.id, "closing session");
        self.closed = true;
        if self.cmdproc.connection().is_connected() && !self.login.is_failed() {
            let _ = self.cmdproc.send_untracked("OUT", &[]);
        }
        self.close_control("session closed");
        self.peers.close_all("session closed", &mut self.effects);
    }

    // --- discovery ---------------------------------------------------------

    /// A peer was announced on the local network.
    pub fn peer_appeared(&mut self, identity: &str, addresses: Vec<IpAddr>, port: u16) {
        self.peers.peer_appeared(identity, addresses, port);
    }

    /// A peer's attributes changed.
    pub fn peer_updated(&mut self, identity: &str, metadata: HashMap<String, String>) {
        if !self.peers.peer_updated(identity, metadata) {
            debug!(identity, "update for unknown peer");
        }
    }

    /// A peer left the local network.
    pub fn peer_departed(&mut self, identity: &str) {
        self.peers.peer_departed(identity, &mut self.effects);
        self.finish_turn();
    }

    // --- I/O inputs --------------------------------------------------------

    /// A connect requested through [`Effect::Connect`] succeeded.
    pub fn on_connected(&mut self, conn: ConnectionId, socket: Box<dyn Socket>) {
        if conn == self.cmdproc.id() && !self.is_finished() {
            if let Err(e) = self.cmdproc.connection_mut().connected(socket) {
                warn!(conn = %conn, error = %e, "unexpected connect result");
                return;
            }
            info!(conn = %conn, "control connection established");
            if matches!(self.login.step(), LoginStep::Start | LoginStep::Transferring)
                && self.advance(LoginStep::Handshake)
            {
                self.send_version();
            }
        } else if self.peers.contains(conn) {
            self.peers
                .on_connected(conn, socket, Instant::now(), &mut self.effects);
        } else {
            debug!(conn = %conn, "connect result for a connection no longer wanted");
            self.effects.push(Effect::Close(conn));
        }
        self.finish_turn();
    }

    /// A connect requested through [`Effect::Connect`] failed.
    pub fn on_connect_failed(&mut self, conn: ConnectionId, detail: &str) {
        if conn == self.cmdproc.id() && !self.is_finished() {
            self.cmdproc.connection_mut().connect_failed();
            self.fail(ErrorKind::ConnectFailed, detail.to_string());
        } else if self.peers.contains(conn) {
            self.peers.on_connect_failed(conn, detail, &mut self.effects);
        }
        self.finish_turn();
    }

    /// Bytes were read from `conn`.
    pub fn on_data(&mut self, conn: ConnectionId, data: &[u8]) {
        if conn == self.cmdproc.id() {
            if !self.is_finished() {
                cmdproc::process(self, data);
            }
        } else if self.peers.contains(conn) {
            self.peers.on_data(conn, data, &mut self.effects);
        } else {
            debug!(conn = %conn, len = data.len(), "data for unknown connection");
        }
        self.finish_turn();
    }

    /// `conn` reached end of stream.
    pub fn on_closed(&mut self, conn: ConnectionId) {
        if conn == self.cmdproc.id() {
            if !self.is_finished() {
                let detail = match cmdproc::finish(self) {
                    Err(e) => e.to_string(),
                    Ok(()) => "server closed the connection".to_string(),
                };
                self.fail(ErrorKind::UnexpectedClose, detail);
            }
        } else if self.peers.contains(conn) {
            self.peers
                .on_closed(conn, "closed by peer", &mut self.effects);
        }
        self.finish_turn();
    }

    /// Reading from `conn` failed.
    pub fn on_read_error(&mut self, conn: ConnectionId, detail: &str) {
        if conn == self.cmdproc.id() {
            if !self.is_finished() {
                self.fail(ErrorKind::ReadError, detail.to_string());
            }
        } else if self.peers.contains(conn) {
            self.peers.on_closed(conn, detail, &mut self.effects);
        }
        self.finish_turn();
    }

    /// `conn` can accept more bytes.
    pub fn on_writable(&mut self, conn: ConnectionId) {
        if conn == self.cmdproc.id() {
            if let Err(e) = self.cmdproc.connection_mut().flush() {
                if !self.is_finished() {
                    self.fail(ErrorKind::WriteError, e.to_string());
                }
            }
        } else if self.peers.contains(conn) {
            self.peers.on_writable(conn, &mut self.effects);
        }
        self.finish_turn();
    }

    /// An unsolicited peer connection was accepted.
    pub fn on_inbound(&mut self, socket: Box<dyn Socket>) -> ConnectionId {
        let id = self.alloc_id();
        self.peers.accept(id, socket, Instant::now());
        self.finish_turn();
        id
    }

    /// The ticket exchange requested through [`Effect::RequestTicket`] ended.
    pub fn on_ticket(&mut self, result: Result<String>) {
        if self.login.step() != LoginStep::AuthStart {
            debug!(step = %self.login.step(), "ticket result arrived late, ignoring");
            return;
        }
        match result {
            Ok(ticket) => {
                let txn = Transaction::new("USR").params(["TWN", "S"]).param(ticket);
                if self.send_control(txn).is_some() {
                    self.advance(LoginStep::AuthEnd);
                }
            }
            Err(e) => self.fail(ErrorKind::AuthenticationFailed, e.to_string()),
        }
        self.finish_turn();
    }

    /// Check deadlines.
    pub fn tick(&mut self, now: Instant) {
        if !self.is_finished() {
            cmdproc::expire(self, now);
            if self.login.is_overdue(now) {
                let step = self.login.step();
                self.fail(ErrorKind::Timeout, format!("login step {step} timed out"));
            }
        }
        self.peers.expire(now, &mut self.effects);
        self.finish_turn();
    }

    // --- internals used by the notification handlers ---------------------

    fn finish_turn(&mut self) {
        self.peers.apply_deferred(&mut self.effects);
        self.peers.arm_writes(&mut self.effects);
        if self.cmdproc.connection_mut().arm_write_watch() {
            self.effects.push(Effect::WatchWritable(self.cmdproc.id()));
        }
    }

    pub(crate) fn emit(&mut self, event: SessionEvent) {
        self.effects.push(Effect::Event(event));
    }

    /// Move the login forward, failing the session on an illegal edge.
    pub(crate) fn advance(&mut self, step: LoginStep) -> bool {
        match self.login.advance(step, Instant::now()) {
            Ok(()) => {
                self.emit(SessionEvent::LoginProgress { step });
                true
            }
            Err(e) => {
                let kind = if step == LoginStep::Transferring {
                    ErrorKind::InvalidRedirect
                } else {
                    ErrorKind::ProtocolViolation
                };
                self.fail(kind, e.to_string());
                false
            }
        }
    }

    /// Send on the control channel; a write failure ends the session.
    pub(crate) fn send_control(&mut self, txn: Transaction<Session>) -> Option<u32> {
        match self.cmdproc.send(txn, Instant::now()) {
            Ok(id) => Some(id),
            Err(e) => {
                self.fail(e.kind(), e.to_string());
                None
            }
        }
    }

    /// End the control session with `kind`. Only the first failure counts.
    pub(crate) fn fail(&mut self, kind: ErrorKind, detail: String) {
        if self.closed || !self.login.fail(kind) {
            debug!(kind = %kind, detail = %detail, "session already ended");
            return;
        }
        warn!(session = %self.id, kind = %kind, detail = %detail, "session failed");
        self.emit(SessionEvent::LoginProgress {
            step: LoginStep::Failed(kind),
        });
        self.emit(SessionEvent::Error { kind, detail });
        self.close_control("session failed");
    }

    /// Release the control connection and fail what was pending on it.
    fn close_control(&mut self, reason: &str) {
        self.cmdproc.close();
        self.effects.push(Effect::Close(self.cmdproc.id()));
        cmdproc::fail_all(self, reason);
    }

    /// Server ended the session without an error.
    pub(crate) fn signed_off(&mut self, reason: Option<String>) {
        if self.closed {
            return;
        }
        info!(session = %self.id, ?reason, "signed off by server");
        self.closed = true;
        self.emit(SessionEvent::SignedOff { reason });
        self.close_control("signed off");
    }

    pub(crate) fn send_version(&mut self) {
        let versions = self.config.server.protocol_versions.clone();
        let txn = Transaction::new("VER").params(versions).param(VERSION_SUFFIX);
        self.send_control(txn);
    }

    /// Follow a redirect to another server.
    pub(crate) fn redirect(&mut self, host: String, port: u16) {
        if !self.advance(LoginStep::Transferring) {
            return;
        }
        info!(host = %host, port, "redirected");
        let old = self.cmdproc.id();
        let id = self.alloc_id();
        let mut conn = Connection::new(id, self.config.peer.max_buffered_bytes);
        if let Err(e) = conn.begin_connect(&host, port) {
            self.fail(ErrorKind::InvalidRedirect, e.to_string());
            return;
        }
        let mut previous = self.cmdproc.replace_connection(conn);
        previous.close();
        self.effects.push(Effect::Close(old));
        cmdproc::fail_all(self, "redirected");
        self.effects.push(Effect::Connect { conn: id, host, port });
    }

    pub(crate) fn request_ticket(&mut self, challenge: String) {
        let request = TicketRequest {
            account: self.config.account.account.clone(),
            password: self.config.account.password.clone(),
            challenge,
        };
        self.effects.push(Effect::RequestTicket(request));
    }

    pub(crate) fn begin_sync(&mut self, expected: u32) {
        self.sync = SyncProgress {
            expected: Some(expected),
            received: 0,
        };
        if expected == 0 {
            self.finish_sync();
        }
    }

    /// Count one contact list entry; the last one completes the login.
    pub(crate) fn note_listed(&mut self) {
        if self.login.step() != LoginStep::Syncing {
            return;
        }
        self.sync.received += 1;
        if self.sync.expected.is_some_and(|n| self.sync.received >= n) {
            self.finish_sync();
        }
    }

    fn finish_sync(&mut self) {
        if !self.advance(LoginStep::Connected) {
            return;
        }
        let status = self.config.account.initial_status.clone();
        if self.send_control(Transaction::new("CHG").param(status)).is_none() {
            return;
        }
        let account = self.config.account.account.clone();
        let friendly_name = self.friendly_name.clone();
        info!(account = %account, contacts = self.sync.received, "signed on");
        self.emit(SessionEvent::SignedOn {
            account,
            friendly_name,
        });
    }

    pub(crate) fn set_friendly_name(&mut self, name: String) {
        self.friendly_name = name;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("step", &self.login.step())
            .field("control", &self.cmdproc)
            .field("peers", &self.peers)
            .field("closed", &self.closed)
            .finish()
    }
}
