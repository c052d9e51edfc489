//! Tokio driver for a [`Session`].
//!
//! The driver is the only task that touches the Session. Socket readers,
//! connect attempts, writable watches and ticket requests run as spawned
//! tasks that report back over one channel, so every Session input is
//! handled in arrival order on a single task.
//!
//! ```text
//!   SessionHandle ──commands──┐
//!   reader tasks ───IoEvent───┼──> Driver ──> Session ──> Effects ──> spawn / write / events
//!   listener / tick ──────────┘
//! ```

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionId, TcpSocket};
use crate::error::{EngineError, Result};
use crate::login::TicketService;
use crate::session::{Effect, Session, SessionEvent};

/// Bytes requested per socket read.
const READ_CHUNK: usize = 4096;

/// Results of spawned I/O work.
#[derive(Debug)]
pub enum IoEvent {
    /// Outbound connect finished
    Connected {
        /// Connection the connect was for
        conn: ConnectionId,
        /// Write half of the new socket
        socket: TcpSocket,
    },
    /// Outbound connect failed
    ConnectFailed {
        /// Connection the connect was for
        conn: ConnectionId,
        /// Reason
        detail: String,
    },
    /// Bytes read
    Data {
        /// Source connection
        conn: ConnectionId,
        /// Bytes, in stream order
        data: Bytes,
    },
    /// End of stream
    Closed(ConnectionId),
    /// Read failed
    ReadError {
        /// Source connection
        conn: ConnectionId,
        /// Reason
        detail: String,
    },
    /// Socket can take more bytes
    Writable(ConnectionId),
    /// Ticket exchange finished
    Ticket(Result<String>),
}

/// Requests from the application.
#[derive(Debug)]
pub enum SessionCommand {
    /// Chat message to a peer
    SendMessage {
        /// Peer identity
        peer: String,
        /// Message text
        body: String,
    },
    /// Open a peer stream
    Join(String),
    /// Close a peer stream
    Leave(String),
    /// Change our presence
    SetStatus(String),
    /// Add a contact
    AddContact {
        /// List name
        list: String,
        /// Contact account
        account: String,
        /// Friendly name
        friendly_name: String,
    },
    /// Remove a contact
    RemoveContact {
        /// List name
        list: String,
        /// Contact account
        account: String,
    },
    /// Discovery: peer announced
    PeerAppeared {
        /// Peer identity
        identity: String,
        /// Announced addresses
        addresses: Vec<IpAddr>,
        /// Stream port
        port: u16,
    },
    /// Discovery: peer attributes changed
    PeerUpdated {
        /// Peer identity
        identity: String,
        /// New attributes
        metadata: HashMap<String, String>,
    },
    /// Discovery: peer left
    PeerDeparted(String),
    /// Sign off and stop the driver
    Shutdown,
}

/// Cloneable handle for talking to a running [`Driver`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Queue a command for the driver.
    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| EngineError::Closed("session driver stopped".to_string()))
    }

    /// Send a chat message to a peer.
    pub fn send_message(&self, peer: &str, body: &str) -> Result<()> {
        self.send(SessionCommand::SendMessage {
            peer: peer.to_string(),
            body: body.to_string(),
        })
    }

    /// Change our presence.
    pub fn set_status(&self, status: &str) -> Result<()> {
        self.send(SessionCommand::SetStatus(status.to_string()))
    }

    /// Report a discovered peer.
    pub fn peer_appeared(&self, identity: &str, addresses: Vec<IpAddr>, port: u16) -> Result<()> {
        self.send(SessionCommand::PeerAppeared {
            identity: identity.to_string(),
            addresses,
            port,
        })
    }

    /// Sign off.
    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown)
    }
}

/// Owns a [`Session`] and executes its effects on Tokio.
pub struct Driver {
    session: Session,
    tickets: Arc<dyn TicketService>,
    events: mpsc::UnboundedSender<SessionEvent>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    writers: HashMap<ConnectionId, Arc<OwnedWriteHalf>>,
    readers: HashMap<ConnectionId, JoinHandle<()>>,
    watches: HashMap<ConnectionId, JoinHandle<()>>,
    ticket: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

impl Driver {
    /// Wrap `session`; events for the application go to `events`.
    pub fn new(
        session: Session,
        tickets: Arc<dyn TicketService>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        let connect_timeout = session.config().peer.connect_timeout();
        let driver = Self {
            session,
            tickets,
            events,
            commands,
            io_tx,
            io_rx,
            writers: HashMap::new(),
            readers: HashMap::new(),
            watches: HashMap::new(),
            ticket: None,
            connect_timeout,
        };
        (driver, SessionHandle { tx })
    }

    /// The session being driven
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Log in and run until the session ends or is shut down.
    ///
    /// When `listener` is given, accepted connections become inbound peer
    /// streams.
    pub async fn run(mut self, listener: Option<TcpListener>) -> Result<Session> {
        self.session.login()?;
        let mut tick = tokio::time::interval(self.session.config().timeouts.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.execute_effects();
            if self.session.is_finished() {
                break;
            }

            tokio::select! {
                Some(event) = self.io_rx.recv() => self.handle_io(event),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => {
                        self.session.close();
                    }
                    Some(command) => self.handle_command(command),
                },
                accepted = accept(listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => self.handle_inbound(stream, addr),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = tick.tick() => self.session.tick(Instant::now()),
            }
        }

        self.execute_effects();
        self.stop_tasks();
        info!(session = %self.session.id(), step = %self.session.login_step(), "driver stopped");
        Ok(self.session)
    }

    fn handle_io(&mut self, event: IoEvent) {
        match event {
            IoEvent::Connected { conn, socket } => {
                self.writers.insert(conn, socket.writer());
                self.session.on_connected(conn, Box::new(socket));
            }
            IoEvent::ConnectFailed { conn, detail } => {
                self.readers.remove(&conn);
                self.session.on_connect_failed(conn, &detail);
            }
            IoEvent::Data { conn, data } => self.session.on_data(conn, &data),
            IoEvent::Closed(conn) => {
                self.readers.remove(&conn);
                self.session.on_closed(conn);
            }
            IoEvent::ReadError { conn, detail } => {
                self.readers.remove(&conn);
                self.session.on_read_error(conn, &detail);
            }
            IoEvent::Writable(conn) => {
                self.watches.remove(&conn);
                self.session.on_writable(conn);
            }
            IoEvent::Ticket(result) => {
                self.ticket = None;
                self.session.on_ticket(result);
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        let result = match command {
            SessionCommand::SendMessage { peer, body } => self.session.send_message(&peer, &body),
            SessionCommand::Join(peer) => self.session.join(&peer).map(|_| ()),
            SessionCommand::Leave(peer) => {
                self.session.leave(&peer);
                Ok(())
            }
            SessionCommand::SetStatus(status) => self.session.set_status(&status).map(|_| ()),
            SessionCommand::AddContact {
                list,
                account,
                friendly_name,
            } => self
                .session
                .add_contact(&list, &account, &friendly_name)
                .map(|_| ()),
            SessionCommand::RemoveContact { list, account } => {
                self.session.remove_contact(&list, &account).map(|_| ())
            }
            SessionCommand::PeerAppeared {
                identity,
                addresses,
                port,
            } => {
                self.session.peer_appeared(&identity, addresses, port);
                Ok(())
            }
            SessionCommand::PeerUpdated { identity, metadata } => {
                self.session.peer_updated(&identity, metadata);
                Ok(())
            }
            SessionCommand::PeerDeparted(identity) => {
                self.session.peer_departed(&identity);
                Ok(())
            }
            SessionCommand::Shutdown => {
                self.session.close();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "command rejected");
            self.publish(SessionEvent::Warning {
                code: None,
                detail: e.to_string(),
            });
        }
    }

    fn handle_inbound(&mut self, stream: TcpStream, addr: std::net::SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        let writer = Arc::new(write);
        let conn = self
            .session
            .on_inbound(Box::new(TcpSocket::new(writer.clone(), addr)));
        debug!(conn = %conn, peer = %addr, "accepted inbound stream");
        self.writers.insert(conn, writer);
        let tx = self.io_tx.clone();
        self.readers
            .insert(conn, tokio::spawn(read_loop(conn, read, tx)));
    }

    fn execute_effects(&mut self) {
        for effect in self.session.drain_effects() {
            match effect {
                Effect::Connect { conn, host, port } => {
                    debug!(conn = %conn, host = %host, port, "connecting");
                    let tx = self.io_tx.clone();
                    let task = tokio::spawn(connect_and_read(conn, host, port, self.connect_timeout, tx));
                    if let Some(old) = self.readers.insert(conn, task) {
                        old.abort();
                    }
                }
                Effect::WatchWritable(conn) => self.watch_writable(conn),
                Effect::Close(conn) => self.release(conn),
                Effect::RequestTicket(request) => {
                    let service = self.tickets.clone();
                    let tx = self.io_tx.clone();
                    debug!(service = service.name(), "requesting ticket");
                    let task = tokio::spawn(async move {
                        let result = service.request_ticket(request).await;
                        let _ = tx.send(IoEvent::Ticket(result));
                    });
                    if let Some(old) = self.ticket.replace(task) {
                        old.abort();
                    }
                }
                Effect::Event(event) => self.publish(event),
            }
        }
    }

    fn watch_writable(&mut self, conn: ConnectionId) {
        let Some(writer) = self.writers.get(&conn).cloned() else {
            debug!(conn = %conn, "no socket to watch");
            return;
        };
        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            if writer.writable().await.is_ok() {
                let _ = tx.send(IoEvent::Writable(conn));
            }
        });
        if let Some(old) = self.watches.insert(conn, task) {
            old.abort();
        }
    }

    fn release(&mut self, conn: ConnectionId) {
        if let Some(task) = self.readers.remove(&conn) {
            task.abort();
        }
        if let Some(task) = self.watches.remove(&conn) {
            task.abort();
        }
        self.writers.remove(&conn);
    }

    fn publish(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn stop_tasks(&mut self) {
        for (_, task) in self.readers.drain().chain(self.watches.drain()) {
            task.abort();
        }
        if let Some(task) = self.ticket.take() {
            task.abort();
        }
        self.writers.clear();
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("session", &self.session)
            .field("readers", &self.readers.len())
            .field("watches", &self.watches.len())
            .field("ticket_pending", &self.ticket.is_some())
            .finish()
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, std::net::SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = None;
    for addr in lookup_host((host, port)).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{host} did not resolve"))
    }))
}

async fn connect_and_read(
    conn: ConnectionId,
    host: String,
    port: u16,
    timeout: Duration,
    tx: mpsc::UnboundedSender<IoEvent>,
) {
    let stream = match tokio::time::timeout(timeout, connect(&host, port)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = tx.send(IoEvent::ConnectFailed {
                conn,
                detail: format!("{host}:{port}: {e}"),
            });
            return;
        }
        Err(_) => {
            let _ = tx.send(IoEvent::ConnectFailed {
                conn,
                detail: format!("{host}:{port}: timed out after {timeout:?}"),
            });
            return;
        }
    };
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(e) => {
            let _ = tx.send(IoEvent::ConnectFailed {
                conn,
                detail: e.to_string(),
            });
            return;
        }
    };
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    let socket = TcpSocket::new(Arc::new(write), peer);
    if tx.send(IoEvent::Connected { conn, socket }).is_err() {
        return;
    }
    read_loop(conn, read, tx).await;
}

async fn read_loop(conn: ConnectionId, mut read: OwnedReadHalf, tx: mpsc::UnboundedSender<IoEvent>) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        let event = match read.read_buf(&mut buf).await {
            Ok(0) => IoEvent::Closed(conn),
            Ok(_) => IoEvent::Data {
                conn,
                data: buf.split().freeze(),
            },
            Err(e) => IoEvent::ReadError {
                conn,
                detail: e.to_string(),
            },
        };
        let done = !matches!(event, IoEvent::Data { .. });
        if tx.send(event).is_err() || done {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_reports_refusal() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        connect_and_read(ConnectionId(9), "127.0.0.1".into(), port, Duration::from_secs(5), tx).await;
        match rx.recv().await {
            Some(IoEvent::ConnectFailed { conn, detail }) => {
                assert_eq!(conn, ConnectionId(9));
                assert!(detail.contains("127.0.0.1"));
            }
            other => panic!("expected connect failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reader_forwards_data_then_close() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connect_and_read(
            ConnectionId(2),
            "127.0.0.1".into(),
            port,
            Duration::from_secs(5),
            tx,
        ));

        let (mut server, _) = listener.accept().await.unwrap();
        assert!(matches!(rx.recv().await, Some(IoEvent::Connected { .. })));
        server.write_all(b"QNG 50\r\n").await.unwrap();
        drop(server);

        let mut received = Vec::new();
        loop {
            match rx.recv().await {
                Some(IoEvent::Data { data, .. }) => received.extend_from_slice(&data),
                Some(IoEvent::Closed(conn)) => {
                    assert_eq!(conn, ConnectionId(2));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, b"QNG 50\r\n");
        task.await.unwrap();
    }
}
