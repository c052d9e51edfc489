//! Control-channel login progression.
//!
//! ## State Machine
//!
//! ```text
//!  [Start] ──connect──> [Handshake] ──VER ok──> [Handshake2]
//!                           │                      │    │
//!                           │ XFR                  │    │ USR TWN S
//!                           v                      │    v
//!                     [Transferring] <── XFR ──────┘ [AuthStart]
//!                           │                      │    │ ticket
//!                           │ reconnect            │    v
//!                           └──> [Handshake]       │ [AuthEnd]
//!                                                  │    │ USR OK
//!                                     USR OK       v    v
//!                                               [Syncing] ──list done──> [Connected]
//!
//!  any step ──error──> [Failed(kind)]   (absorbing)
//! ```
//!
//! | Step           | Waiting for                                    |
//! |----------------|------------------------------------------------|
//! | `Start`        | TCP connect                                    |
//! | `Handshake`    | version negotiation reply                      |
//! | `Handshake2`   | client version reply, then credential reply    |
//! | `AuthStart`    | external ticket                                |
//! | `AuthEnd`      | ticket acceptance                              |
//! | `Syncing`      | contact list                                   |
//! | `Transferring` | connect to the redirect target                 |
//! | `Connected`    | nothing; logged in                             |
//! | `Failed`       | nothing; terminal                              |

pub mod nexus;

pub use nexus::{NexusClient, TicketRequest, TicketService};

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{EngineError, ErrorKind, Result};

/// Redirects followed before the login is declared broken.
pub const MAX_REDIRECTS: u32 = 5;

/// Login progression step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", content = "error", rename_all = "snake_case")]
pub enum LoginStep {
    /// Not connected yet
    Start,
    /// Version negotiation sent
    Handshake,
    /// Client identification and credentials sent
    Handshake2,
    /// Waiting for the external ticket
    AuthStart,
    /// Ticket sent, waiting for acceptance
    AuthEnd,
    /// Receiving the contact list
    Syncing,
    /// Moving to another server
    Transferring,
    /// Logged in
    Connected,
    /// Login ended with an error
    Failed(ErrorKind),
}

impl LoginStep {
    /// Step name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Handshake => "handshake",
            Self::Handshake2 => "handshake2",
            Self::AuthStart => "auth_start",
            Self::AuthEnd => "auth_end",
            Self::Syncing => "syncing",
            Self::Transferring => "transferring",
            Self::Connected => "connected",
            Self::Failed(_) => "failed",
        }
    }

    /// Whether `next` is a legal successor.
    pub fn can_advance_to(&self, next: LoginStep) -> bool {
        use LoginStep::*;
        if matches!(self, Failed(_)) {
            return false;
        }
        if matches!(next, Failed(_)) {
            return true;
        }
        matches!(
            (self, next),
            (Start, Handshake)
                | (Handshake, Handshake2)
                | (Handshake, Transferring)
                | (Handshake2, AuthStart)
                | (Handshake2, Syncing)
                | (Handshake2, Transferring)
                | (AuthStart, AuthEnd)
                | (AuthEnd, Syncing)
                | (AuthEnd, Transferring)
                | (Syncing, Connected)
                | (Transferring, Handshake)
        )
    }

    /// Whether no further step can follow
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for LoginStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(kind) => write!(f, "failed({kind})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Tracks one session's login.
#[derive(Debug, Clone)]
pub struct LoginStateMachine {
    step: LoginStep,
    step_timeout: Option<Duration>,
    deadline: Option<Instant>,
    redirects: u32,
}

impl LoginStateMachine {
    /// Create a machine at `Start`; each step until `Connected` must finish
    /// within `step_timeout`.
    pub fn new(step_timeout: Option<Duration>) -> Self {
        Self {
            step: LoginStep::Start,
            step_timeout,
            deadline: None,
            redirects: 0,
        }
    }

    /// Current step
    pub fn step(&self) -> LoginStep {
        self.step
    }

    /// Whether login completed
    pub fn is_connected(&self) -> bool {
        self.step == LoginStep::Connected
    }

    /// Whether login failed
    pub fn is_failed(&self) -> bool {
        self.step.is_terminal()
    }

    /// Redirects followed so far
    pub fn redirects(&self) -> u32 {
        self.redirects
    }

    /// Deadline of the current step
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start the step clock at `Start`.
    pub fn begin(&mut self, now: Instant) {
        self.deadline = self.step_timeout.and_then(|t| now.checked_add(t));
    }

    /// Move to `next`, refusing anything off the legal edges.
    pub fn advance(&mut self, next: LoginStep, now: Instant) -> Result<()> {
        if !self.step.can_advance_to(next) {
            warn!(from = %self.step, to = %next, "refused login transition");
            return Err(EngineError::InvalidTransition {
                from: self.step.to_string(),
                to: next.to_string(),
            });
        }
        if next == LoginStep::Transferring {
            if self.redirects >= MAX_REDIRECTS {
                return Err(EngineError::InvalidState(format!(
                    "more than {MAX_REDIRECTS} redirects"
                )));
            }
            self.redirects += 1;
        }

        debug!(from = %self.step, to = %next, "login step");
        self.step = next;
        self.deadline = match next {
            LoginStep::Connected | LoginStep::Failed(_) => None,
            _ => self.step_timeout.and_then(|t| now.checked_add(t)),
        };
        if next == LoginStep::Connected {
            info!("login complete");
        }
        Ok(())
    }

    /// Enter `Failed(kind)`. Returns `false` if already failed.
    pub fn fail(&mut self, kind: ErrorKind) -> bool {
        if self.step.is_terminal() {
            return false;
        }
        warn!(from = %self.step, kind = %kind, "login failed");
        self.step = LoginStep::Failed(kind);
        self.deadline = None;
        true
    }

    /// Whether the current step has run past its deadline.
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }
}

impl Default for LoginStateMachine {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LoginStep::*;

    fn all_steps() -> Vec<LoginStep> {
        vec![
            Start,
            Handshake,
            Handshake2,
            AuthStart,
            AuthEnd,
            Syncing,
            Transferring,
            Connected,
            Failed(ErrorKind::Timeout),
        ]
    }

    #[test]
    fn test_direct_login_path() {
        let now = Instant::now();
        let mut login = LoginStateMachine::default();
        for step in [Handshake, Handshake2, Syncing, Connected] {
            login.advance(step, now).unwrap();
        }
        assert!(login.is_connected());
    }

    #[test]
    fn test_ticket_and_redirect_path() {
        let now = Instant::now();
        let mut login = LoginStateMachine::default();
        for step in [
            Handshake,
            Handshake2,
            Transferring,
            Handshake,
            Handshake2,
            AuthStart,
            AuthEnd,
            Syncing,
            Connected,
        ] {
            login.advance(step, now).unwrap();
        }
        assert_eq!(login.redirects(), 1);
    }

    #[test]
    fn test_syncing_only_from_credential_steps() {
        for from in all_steps() {
            let allowed = from.can_advance_to(Syncing);
            assert_eq!(allowed, matches!(from, Handshake2 | AuthEnd), "{from}");
        }
    }

    #[test]
    fn test_no_backwards_or_skipping() {
        let now = Instant::now();
        let mut login = LoginStateMachine::default();
        assert!(login.advance(Connected, now).is_err());
        login.advance(Handshake, now).unwrap();
        assert!(login.advance(Start, now).is_err());
        assert!(login.advance(AuthStart, now).is_err());
        assert_eq!(login.step(), Handshake);
    }

    #[test]
    fn test_failed_is_absorbing() {
        let now = Instant::now();
        let mut login = LoginStateMachine::default();
        login.advance(Handshake, now).unwrap();
        assert!(login.fail(ErrorKind::UnsupportedVersion));
        assert!(!login.fail(ErrorKind::Timeout));
        assert_eq!(login.step(), Failed(ErrorKind::UnsupportedVersion));
        for next in all_steps() {
            assert!(login.advance(next, now).is_err());
        }
    }

    #[test]
    fn test_redirect_limit() {
        let now = Instant::now();
        let mut login = LoginStateMachine::default();
        login.advance(Handshake, now).unwrap();
        for _ in 0..MAX_REDIRECTS {
            login.advance(Transferring, now).unwrap();
            login.advance(Handshake, now).unwrap();
        }
        assert!(login.advance(Transferring, now).is_err());
    }

    #[test]
    fn test_step_deadline() {
        let now = Instant::now();
        let mut login = LoginStateMachine::new(Some(Duration::from_secs(30)));
        login.begin(now);
        assert!(!login.is_overdue(now + Duration::from_secs(10)));
        login.advance(Handshake, now + Duration::from_secs(20)).unwrap();
        assert!(!login.is_overdue(now + Duration::from_secs(40)));
        assert!(login.is_overdue(now + Duration::from_secs(50)));

        for step in [Handshake2, Syncing, Connected] {
            login.advance(step, now).unwrap();
        }
        assert!(login.deadline().is_none());
    }

    #[test]
    fn test_unrepresentable_deadline_is_none() {
        let now = Instant::now();
        let mut login = LoginStateMachine::new(Some(Duration::from_secs(u64::MAX)));
        login.begin(now);
        assert!(login.deadline().is_none());
        login.advance(Handshake, now).unwrap();
        assert!(login.deadline().is_none());
        assert!(!login.is_overdue(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_step_serializes_with_error() {
        let json = serde_json::to_string(&Failed(ErrorKind::BadCredentials)).unwrap();
        assert_eq!(json, r#"{"step":"failed","error":"bad_credentials"}"#);
        let json = serde_json::to_string(&Syncing).unwrap();
        assert_eq!(json, r#"{"step":"syncing"}"#);
    }
}
