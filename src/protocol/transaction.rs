//! Outgoing request/reply correlation.
//!
//! Every outgoing command gets a fresh correlation id. The reply, error,
//! timeout or connection teardown that ends the transaction fires exactly
//! one of its callbacks, after the transaction has been removed from the
//! pending set.
//!
//! Data the caller wants back in a callback is captured by the callback
//! closure. Whichever callback runs takes ownership of it; when none runs
//! (the reply was routed through the dispatch table instead) it is dropped
//! together with the transaction.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::command::{encode_line, Command};
use super::error_codes::ServerError;
use crate::connection::Connection;
use crate::error::{EngineError, Result};

/// Why a transaction ended without a success reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The server answered with an error code
    Server {
        /// Reply code
        code: u16,
        /// The error line itself
        reply: Command,
    },
    /// No reply before the deadline
    Timeout,
    /// The connection went away first
    Closed(String),
}

impl TransactionError {
    /// Server reply code, if this was a server error
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Equivalent [`EngineError`]
    pub fn to_engine_error(&self) -> EngineError {
        match self {
            Self::Server { code, .. } => EngineError::Server {
                code: *code,
                description: ServerError::describe(*code),
            },
            Self::Timeout => EngineError::InvalidState("transaction timed out".to_string()),
            Self::Closed(reason) => EngineError::Closed(reason.clone()),
        }
    }
}

/// What was sent, handed to callbacks and error handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Correlation id
    pub id: u32,
    /// Outgoing verb
    pub verb: String,
    /// Outgoing parameters
    pub params: Vec<String>,
}

type ReplyFn<S> = Box<dyn FnOnce(&mut S, &Command) + Send>;
type ErrorFn<S> = Box<dyn FnOnce(&mut S, &TransactionInfo, TransactionError) + Send>;
type TimeoutFn<S> = Box<dyn FnOnce(&mut S, &TransactionInfo) + Send>;

/// One outgoing request.
pub struct Transaction<S> {
    info: TransactionInfo,
    payload: Option<Bytes>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    on_reply: Option<ReplyFn<S>>,
    on_error: Option<ErrorFn<S>>,
    on_timeout: Option<TimeoutFn<S>>,
}

impl<S> Transaction<S> {
    /// Start building a request for `verb`.
    pub fn new(verb: &str) -> Self {
        Self {
            info: TransactionInfo {
                id: 0,
                verb: verb.to_string(),
                params: Vec::new(),
            },
            payload: None,
            timeout: None,
            deadline: None,
            on_reply: None,
            on_error: None,
            on_timeout: None,
        }
    }

    /// Append one parameter.
    pub fn param(mut self, param: impl Into<String>) -> Self {
        self.info.params.push(param.into());
        self
    }

    /// Append several parameters.
    pub fn params<I, T>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.info.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Attach a payload; its length is sent as the last parameter.
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Override the manager's default reply deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called with the success reply.
    pub fn on_reply<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut S, &Command) + Send + 'static,
    {
        self.on_reply = Some(Box::new(f));
        self
    }

    /// Called on an error reply, on teardown, and on timeout when no
    /// timeout callback is set.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut S, &TransactionInfo, TransactionError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called when the deadline passes.
    pub fn on_timeout<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut S, &TransactionInfo) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(f));
        self
    }

    /// Correlation id (0 until sent)
    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// Outgoing verb
    pub fn verb(&self) -> &str {
        &self.info.verb
    }

    /// What was sent
    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    /// Reply deadline, once sent
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn encode(&self) -> Vec<u8> {
        match &self.payload {
            Some(payload) => {
                let mut params = self.info.params.clone();
                params.push(payload.len().to_string());
                let mut out = encode_line(&self.info.verb, Some(self.info.id), &params);
                out.extend_from_slice(payload);
                out
            }
            None => encode_line(&self.info.verb, Some(self.info.id), &self.info.params),
        }
    }

    /// Deliver the success reply. Returns the info back when no callback
    /// consumed it.
    pub(crate) fn complete(self, host: &mut S, reply: &Command) -> Option<TransactionInfo> {
        match self.on_reply {
            Some(f) => {
                f(host, reply);
                None
            }
            None => Some(self.info),
        }
    }

    /// Deliver a failure. Returns it back when no callback consumed it.
    pub(crate) fn fail(
        self,
        host: &mut S,
        error: TransactionError,
    ) -> Option<(TransactionInfo, TransactionError)> {
        if error == TransactionError::Timeout {
            if let Some(f) = self.on_timeout {
                f(host, &self.info);
                return None;
            }
        }
        match self.on_error {
            Some(f) => {
                f(host, &self.info, error);
                None
            }
            None => Some((self.info, error)),
        }
    }
}

impl<S> std::fmt::Debug for Transaction<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.info.id)
            .field("verb", &self.info.verb)
            .field("params", &self.info.params)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Pending transactions of one connection.
pub struct TransactionManager<S> {
    next_id: u32,
    pending: BTreeMap<u32, Transaction<S>>,
    default_timeout: Option<Duration>,
}

impl<S> TransactionManager<S> {
    /// Create a manager; ids start at 1.
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            next_id: 1,
            pending: BTreeMap::new(),
            default_timeout,
        }
    }

    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Assign an id, write the command and record it as pending.
    ///
    /// A failed write leaves nothing pending; the error goes to the caller.
    pub fn send(&mut self, conn: &mut Connection, mut txn: Transaction<S>, now: Instant) -> Result<u32> {
        let id = self.allocate();
        txn.info.id = id;
        txn.deadline = txn.timeout.or(self.default_timeout).and_then(|t| now.checked_add(t));
        conn.send(&txn.encode())?;
        self.pending.insert(id, txn);
        Ok(id)
    }

    /// Remove a pending transaction.
    pub fn take(&mut self, id: u32) -> Option<Transaction<S>> {
        self.pending.remove(&id)
    }

    /// Look at a pending transaction without removing it.
    pub fn get(&self, id: u32) -> Option<&Transaction<S>> {
        self.pending.get(&id)
    }

    /// Remove every transaction whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Transaction<S>> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, t)| t.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    /// Remove every pending transaction, oldest first.
    pub fn drain(&mut self) -> Vec<Transaction<S>> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Number of pending transactions
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Id the next send will use, absent collisions
    pub fn next_id(&self) -> u32 {
        self.next_id
    }
}

impl<S> std::fmt::Debug for TransactionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, MemoryHandle, MemorySocket};

    #[derive(Default)]
    struct Log(Vec<String>);

    fn connection() -> (Connection, MemoryHandle) {
        let (socket, handle) = MemorySocket::pair();
        let mut conn = Connection::new(ConnectionId(1), 4096);
        conn.begin_connect("localhost", 1863).unwrap();
        conn.connected(Box::new(socket)).unwrap();
        (conn, handle)
    }

    #[test]
    fn test_ids_increase_and_serialize() {
        let (mut conn, handle) = connection();
        let mut mgr: TransactionManager<Log> = TransactionManager::new(None);
        let now = Instant::now();

        let a = mgr
            .send(&mut conn, Transaction::new("VER").params(["MSNP8", "CVR0"]), now)
            .unwrap();
        let b = mgr
            .send(&mut conn, Transaction::new("CHG").param("NLN"), now)
            .unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(handle.written_string(), "VER 1 MSNP8 CVR0\r\nCHG 2 NLN\r\n");
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_payload_length_appended() {
        let (mut conn, handle) = connection();
        let mut mgr: TransactionManager<Log> = TransactionManager::new(None);
        mgr.send(
            &mut conn,
            Transaction::new("MSG").param("N").payload(&b"hello"[..]),
            Instant::now(),
        )
        .unwrap();
        assert_eq!(handle.written_string(), "MSG 1 N 5\r\nhello");
    }

    #[test]
    fn test_failed_write_leaves_nothing_pending() {
        let (mut conn, handle) = connection();
        handle.fail_writes();
        let mut mgr: TransactionManager<Log> = TransactionManager::new(None);
        assert!(mgr
            .send(&mut conn, Transaction::new("PNG"), Instant::now())
            .is_err());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_callbacks_receive_captured_data() {
        let mut log = Log::default();
        let label = String::from("contact add");
        let txn: Transaction<Log> = Transaction::<Log>::new("ADD").on_reply(move |log, reply| {
            log.0.push(format!("{label}: {}", reply.param(0).unwrap_or_default()));
        });

        let reply = Command::new("ADD", Some(1), vec!["FL".into()]);
        assert!(txn.complete(&mut log, &reply).is_none());
        assert_eq!(log.0, ["contact add: FL"]);
    }

    #[test]
    fn test_timeout_falls_back_to_error_callback() {
        let mut log = Log::default();
        let txn: Transaction<Log> = Transaction::<Log>::new("SYN").on_error(|log, info, err| {
            log.0.push(format!("{} {:?}", info.verb, err));
        });
        assert!(txn.fail(&mut log, TransactionError::Timeout).is_none());
        assert_eq!(log.0, ["SYN Timeout"]);

        let bare: Transaction<Log> = Transaction::new("PNG");
        let (info, err) = bare.fail(&mut log, TransactionError::Timeout).unwrap();
        assert_eq!(info.verb, "PNG");
        assert_eq!(err, TransactionError::Timeout);
    }

    #[test]
    fn test_expire_only_past_deadlines() {
        let (mut conn, _handle) = connection();
        let mut mgr: TransactionManager<Log> =
            TransactionManager::new(Some(Duration::from_secs(30)));
        let now = Instant::now();
        mgr.send(&mut conn, Transaction::new("SYN"), now).unwrap();
        mgr.send(
            &mut conn,
            Transaction::new("CHG").timeout(Duration::from_secs(120)),
            now,
        )
        .unwrap();

        assert!(mgr.expire(now + Duration::from_secs(10)).is_empty());
        let expired = mgr.expire(now + Duration::from_secs(60));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].verb(), "SYN");
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_huge_timeout_never_expires() {
        let (mut conn, _handle) = connection();
        let mut mgr: TransactionManager<Log> = TransactionManager::new(None);
        let now = Instant::now();
        let id = mgr
            .send(
                &mut conn,
                Transaction::new("CHG").timeout(Duration::from_secs(u64::MAX)),
                now,
            )
            .unwrap();
        assert!(mgr.get(id).unwrap().deadline().is_none());
        assert!(mgr.expire(now + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_drain_is_oldest_first() {
        let (mut conn, _handle) = connection();
        let mut mgr: TransactionManager<Log> = TransactionManager::new(None);
        let now = Instant::now();
        for verb in ["ADD", "REM", "CHG"] {
            mgr.send(&mut conn, Transaction::new(verb), now).unwrap();
        }
        let drained: Vec<_> = mgr.drain().iter().map(|t| t.verb().to_string()).collect();
        assert_eq!(drained, ["ADD", "REM", "CHG"]);
        assert!(mgr.is_empty());
        assert_eq!(mgr.next_id(), 4);
    }
}
