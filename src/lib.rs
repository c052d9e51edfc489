//! # imengine - Instant Messaging Session Engine
//!
//! Protocol core for a multi-protocol instant messaging client: a
//! line-oriented control channel with correlated request/reply
//! transactions, a staged login with server redirects and an external ticket
//! exchange, and direct peer-to-peer streams opened with an XML banner.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────────────────── Session ───────────────────────────┐
//!  bytes ──> Connection │ FrameReader ──> CmdProc ──> DispatchTable ──> handlers         │
//!                       │                   │                              │              │
//!                       │            TransactionManager           LoginStateMachine       │
//!                       │                                                                 │
//!  bytes ──> Connection │ StreamParser ──> PeerConnectionManager ──> PeerRegistry         │
//!                       └──────────────────────────────┬──────────────────────────────────┘
//!                                                      v
//!                                        Effects (connect, close, watch,
//!                                        ticket request, SessionEvent)
//! ```
//!
//! The [`Session`] performs no I/O. The Tokio [`runtime::Driver`] feeds it
//! socket reads, connect results, writable readiness, ticket results and
//! clock ticks, and executes the [`Effect`]s it queues.
//!
//! ### Wire Format
//!
//! ```text
//! VER 1 MSNP8 CVR0\r\n              command: VERB [trid] params...
//! MSG alice@x Alice 118\r\n<118 bytes>  payload command: length in the last param
//! 911 5\r\n                         error reply: numeric verb, trid
//! ```
//!
//! ### Login
//!
//! ```text
//! Start ─> Handshake ─> Handshake2 ─> AuthStart ─> AuthEnd ─> Syncing ─> Connected
//!              ^            │                          │
//!              └── Transferring <──────────────────────┘   (redirect, at most 5)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use imengine::{Config, NexusClient, Session, runtime::Driver};
//!
//! let config = Config::from_file("config.toml")?;
//! let tickets = Arc::new(NexusClient::new(&config.nexus)?);
//! let (events_tx, mut events) = tokio::sync::mpsc::unbounded_channel();
//! let (driver, handle) = Driver::new(Session::new(config), tickets, events_tx);
//! tokio::spawn(driver.run(None));
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Non-blocking sockets with output buffering
//! - [`protocol`]: Framing, transactions, dispatch and reply codes
//! - [`login`]: Login state machine and ticket service
//! - [`peer`]: Direct peer streams and the peer registry
//! - [`session`]: Composition root and events
//! - [`runtime`]: Tokio driver
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod config;
pub mod connection;
pub mod error;
pub mod login;
pub mod peer;
pub mod protocol;
pub mod runtime;
pub mod session;

// Re-exports for convenience
pub use config::Config;
pub use connection::{Connection, ConnectionId, MemorySocket, Socket, TcpSocket};
pub use error::{EngineError, ErrorKind, Result};
pub use login::{LoginStateMachine, LoginStep, NexusClient, TicketRequest, TicketService};
pub use peer::{PeerConnectionManager, PeerRegistry};
pub use protocol::{Command, DispatchTable, FrameReader, Transaction, TransactionManager};
pub use runtime::{Driver, SessionCommand, SessionHandle};
pub use session::{Effect, Session, SessionEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
