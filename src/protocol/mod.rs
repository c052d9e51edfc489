//! Command-line protocol plumbing shared by every control connection.
//!
//! The control channel speaks a line protocol: each command is one
//! CRLF-terminated header line, optionally followed by a raw payload whose
//! length the header declares.
//!
//! ## Message Flow
//!
//! ```text
//! Client                                   Server
//!    |                                       |
//!    |------- VER 1 MSNP8 CVR0 ------------->|  request, trid 1
//!    |<------ VER 1 MSNP8 CVR0 --------------|  reply matched by trid
//!    |                                       |
//!    |------- ADD 5 FL bob@example.com ----->|
//!    |<------ ADD 5 208 ---------------------|  error reply to trid 5
//!    |                                       |
//!    |<------ NLN NLN bob@example.com Bob ---|  unsolicited, no trid
//!    |<------ MSG Hotmail Hotmail 120 -------|  header + 120 payload bytes
//! ```
//!
//! ## Layers
//!
//! | Type                   | Role                                          |
//! |------------------------|-----------------------------------------------|
//! | [`FrameReader`]        | bytes to [`Command`]s, payload continuations  |
//! | [`CommandGrammar`]     | per-verb payload rules, untracked verbs       |
//! | [`TransactionManager`] | correlation ids and reply callbacks           |
//! | [`DispatchTable`]      | handlers by (context, verb) and content type  |
//! | [`CmdProc`]            | one connection tying the above together       |
//! | [`ServerError`]        | reply code table                              |
//!
//! # Usage
//!
//! ```rust,ignore
//! use imengine::protocol::{cmdproc, CmdProc, CmdProcHost, Transaction};
//!
//! let id = host.cmdproc().send(
//!     Transaction::new("ADD")
//!         .params(["FL", "bob@example.com", "bob@example.com"])
//!         .on_reply(|host, reply| { /* ... */ }),
//!     Instant::now(),
//! )?;
//!
//! // Later, with bytes from the socket:
//! cmdproc::process(&mut host, &bytes);
//! ```

pub mod cmdproc;
mod command;
mod dispatch;
mod error_codes;
mod frame;
mod mime;
mod transaction;

pub use cmdproc::{CmdProc, CmdProcHost};
pub use command::{encode_line, Command};
pub use dispatch::{CommandHandler, DispatchTable, ErrorHandler, PayloadHandler};
pub use error_codes::{ServerError, Severity};
pub use frame::{CommandGrammar, FrameReader, PayloadRule, MAX_LINE_LEN, MAX_PAYLOAD_LEN};
pub use mime::MimeMessage;
pub use transaction::{Transaction, TransactionError, TransactionInfo, TransactionManager};

/// Pseudo-version appended to every version offer
pub const VERSION_SUFFIX: &str = "CVR0";
