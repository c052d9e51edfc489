//! Session outputs.
//!
//! The Session never touches sockets or the clock itself. Every input it
//! handles may queue [`Effect`]s; the runtime driver drains and executes
//! them. [`SessionEvent`]s are the subset meant for the application.

use serde::Serialize;

use crate::connection::ConnectionId;
use crate::error::ErrorKind;
use crate::login::{LoginStep, TicketRequest};

/// Application-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Login moved to a new step
    LoginProgress {
        /// New step
        step: LoginStep,
    },
    /// Login finished and the contact list is in
    SignedOn {
        /// Our account
        account: String,
        /// Friendly name the server reported
        friendly_name: String,
    },
    /// The control session ended with an error
    Error {
        /// Error category
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
    /// A transient server error; the session continues
    Warning {
        /// Server reply code, if any
        code: Option<u16>,
        /// Human-readable detail
        detail: String,
    },
    /// One contact list entry received during sync
    ContactListed {
        /// Contact account
        account: String,
        /// Contact friendly name
        friendly_name: String,
        /// List membership bit mask
        lists: u32,
    },
    /// A contact's presence changed
    BuddyUpdate {
        /// Contact account
        account: String,
        /// Presence code (`NLN`, `BSY`, `FLN`, ...)
        status: String,
        /// Friendly name, when the update carried one
        friendly_name: Option<String>,
    },
    /// A contact list change was confirmed
    ContactChanged {
        /// Verb of the change (`ADD`, `REM`)
        action: String,
        /// List name (`FL`, `AL`, `BL`, ...)
        list: String,
        /// Contact account
        account: String,
    },
    /// Our own presence was confirmed
    StatusChanged {
        /// Presence code
        status: String,
    },
    /// A chat message arrived
    MessageReceived {
        /// Sender identity
        from: String,
        /// Message text
        body: String,
    },
    /// Informational server payload (profile, mail counts, notifications)
    ServerNotice {
        /// Payload content type
        content_type: String,
        /// `Key: value` fields from the payload
        fields: Vec<(String, String)>,
    },
    /// A peer stream finished its handshake
    PeerConnected {
        /// Peer identity
        identity: String,
    },
    /// A peer stream went away
    PeerDisconnected {
        /// Peer identity
        identity: String,
        /// Why
        reason: String,
    },
    /// Outbound peer traffic could not be delivered
    SendFailed {
        /// Peer identity
        peer: String,
        /// Why
        detail: String,
    },
    /// The server ended the session without an error
    SignedOff {
        /// Reason the server gave, if any
        reason: Option<String>,
    },
}

/// Work for the runtime driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Resolve `host` and connect; report back under `conn`
    Connect {
        /// Connection the result belongs to
        conn: ConnectionId,
        /// Host name or address literal
        host: String,
        /// Port
        port: u16,
    },
    /// Report once `conn` can accept more bytes
    WatchWritable(ConnectionId),
    /// Release `conn` and stop reading from it
    Close(ConnectionId),
    /// Run the external ticket exchange
    RequestTicket(TicketRequest),
    /// Deliver to the application
    Event(SessionEvent),
}
