//! Per-connection command processor.
//!
//! A [`CmdProc`] ties one [`Connection`] to a frame reader, a transaction
//! manager and a shared [`DispatchTable`]. It lives inside the object that
//! owns it (the host), and handlers receive that host mutably, so the
//! processing entry points are free functions over [`CmdProcHost`] rather
//! than methods: each command is taken out of the processor before its
//! handler runs.
//!
//! # Routing
//!
//! ```text
//! command with trid of a pending transaction
//!   ├─ error code ─> transaction error callback
//!   │                 └─ else table error handler for the outgoing verb
//!   └─ success   ─> transaction reply callback
//!                     └─ else table handler (outgoing verb, verb) / (none, verb)
//! any other command ─> table handler (none, verb), else logged and dropped
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::command::Command;
use super::dispatch::DispatchTable;
use super::error_codes::ServerError;
use super::frame::FrameReader;
use super::mime::MimeMessage;
use super::transaction::{Transaction, TransactionError, TransactionInfo, TransactionManager};
use crate::connection::{Connection, ConnectionId};
use crate::error::{EngineError, Result};

/// Command processor for one connection.
pub struct CmdProc<S> {
    conn: Connection,
    reader: FrameReader,
    transactions: TransactionManager<S>,
    table: Arc<DispatchTable<S>>,
}

impl<S> CmdProc<S> {
    /// Wrap `conn`; transactions without their own deadline use `default_timeout`.
    pub fn new(conn: Connection, table: Arc<DispatchTable<S>>, default_timeout: Option<Duration>) -> Self {
        Self {
            conn,
            reader: FrameReader::new(),
            transactions: TransactionManager::new(default_timeout),
            table,
        }
    }

    /// Id of the underlying connection
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// Underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Underlying connection, mutably
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Pending transactions
    pub fn transactions(&self) -> &TransactionManager<S> {
        &self.transactions
    }

    /// Shared dispatch table
    pub fn table(&self) -> &Arc<DispatchTable<S>> {
        &self.table
    }

    /// Swap in a new connection and forget anything half-read on the old one.
    ///
    /// Pending transactions are kept; fail them first if they belonged to the
    /// old connection.
    pub fn replace_connection(&mut self, conn: Connection) -> Connection {
        self.reader.reset();
        std::mem::replace(&mut self.conn, conn)
    }

    /// Send a tracked command.
    pub fn send(&mut self, txn: Transaction<S>, now: Instant) -> Result<u32> {
        trace!(conn = %self.conn.id(), verb = txn.verb(), "send");
        self.transactions.send(&mut self.conn, txn, now)
    }

    /// Send a command that carries no correlation id.
    pub fn send_untracked(&mut self, verb: &str, params: &[String]) -> Result<()> {
        self.conn
            .send(&super::command::encode_line(verb, None, params))
            .map(|_| ())
    }

    /// Close the connection and drop buffered input.
    ///
    /// Pending transactions stay until [`fail_all`] runs.
    pub fn close(&mut self) {
        self.conn.close();
        self.reader.reset();
    }
}

impl<S> std::fmt::Debug for CmdProc<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmdProc")
            .field("conn", &self.conn)
            .field("transactions", &self.transactions)
            .finish()
    }
}

/// Owner of a [`CmdProc`] whose handlers operate on the owner itself.
pub trait CmdProcHost: Sized {
    /// The processor this host dispatches for.
    fn cmdproc(&mut self) -> &mut CmdProc<Self>;
}

/// Feed bytes read from the connection and dispatch every complete command,
/// in arrival order.
pub fn process<S: CmdProcHost>(host: &mut S, data: &[u8]) {
    if !host.cmdproc().conn.is_connected() {
        debug!(len = data.len(), "dropping bytes for closed connection");
        return;
    }
    let table = host.cmdproc().table.clone();
    host.cmdproc().reader.push(data);

    loop {
        let next = {
            let cp = host.cmdproc();
            cp.reader.next_command(table.grammar())
        };
        match next {
            None => break,
            Some(Err(e)) => warn!(error = %e, "discarding malformed frame"),
            Some(Ok(cmd)) => dispatch(host, &table, cmd),
        }
    }
}

/// The connection reached end of stream.
///
/// Fails with [`EngineError::PayloadTruncated`] if a payload was cut short.
pub fn finish<S: CmdProcHost>(host: &mut S) -> Result<()> {
    host.cmdproc().reader.finish()
}

/// Fail every transaction whose deadline has passed.
pub fn expire<S: CmdProcHost>(host: &mut S, now: Instant) {
    let expired = host.cmdproc().transactions.expire(now);
    if expired.is_empty() {
        return;
    }
    let table = host.cmdproc().table.clone();
    for txn in expired {
        debug!(trid = txn.id(), verb = txn.verb(), "transaction timed out");
        if let Some((info, err)) = txn.fail(host, TransactionError::Timeout) {
            route_failure(host, &table, &info, &err);
        }
    }
}

/// Fail every pending transaction, oldest first, because the connection is
/// going away.
pub fn fail_all<S: CmdProcHost>(host: &mut S, reason: &str) {
    let pending = host.cmdproc().transactions.drain();
    if pending.is_empty() {
        return;
    }
    debug!(count = pending.len(), reason, "failing pending transactions");
    let table = host.cmdproc().table.clone();
    for txn in pending {
        if let Some((info, err)) = txn.fail(host, TransactionError::Closed(reason.to_string())) {
            route_failure(host, &table, &info, &err);
        }
    }
}

fn dispatch<S: CmdProcHost>(host: &mut S, table: &DispatchTable<S>, cmd: Command) {
    trace!(command = %cmd, "recv");
    let grammar = table.grammar();
    let mut context = None;

    if let Some(trid) = cmd.trid() {
        if grammar.is_informational(cmd.verb()) {
            context = host
                .cmdproc()
                .transactions
                .get(trid)
                .map(|t| t.verb().to_string());
        } else if let Some(txn) = host.cmdproc().transactions.take(trid) {
            if let Some(code) = grammar.error_code(&cmd) {
                let error = TransactionError::Server { code, reply: cmd };
                if let Some((info, err)) = txn.fail(host, error) {
                    route_failure(host, table, &info, &err);
                }
                return;
            }
            match txn.complete(host, &cmd) {
                None => return,
                Some(info) => context = Some(info.verb),
            }
        }
    }

    if cmd.is_numeric() {
        let code: u16 = cmd.verb().parse().unwrap_or_default();
        warn!(
            code,
            trid = ?cmd.trid(),
            description = %ServerError::describe(code),
            "server error with no pending transaction"
        );
        return;
    }

    if let Some(handler) = table.command(context.as_deref(), cmd.verb()) {
        handler(host, &cmd);
        return;
    }

    if table.is_payload_verb(cmd.verb()) {
        dispatch_payload(host, table, &cmd);
        return;
    }

    debug!(command = %cmd, context = ?context, "no handler, discarding");
}

fn dispatch_payload<S>(host: &mut S, table: &DispatchTable<S>, cmd: &Command) {
    let Some(payload) = cmd.payload() else {
        return;
    };
    let msg = match MimeMessage::parse(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(verb = cmd.verb(), error = %e, "unparseable payload");
            return;
        }
    };
    let content_type = msg.content_type().unwrap_or_default();
    match table.payload(&content_type) {
        Some(handler) => handler(host, cmd, &msg),
        None => debug!(content_type, "no payload handler, discarding"),
    }
}

fn route_failure<S>(
    host: &mut S,
    table: &DispatchTable<S>,
    info: &TransactionInfo,
    err: &TransactionError,
) {
    match table.error(&info.verb) {
        Some(handler) => handler(host, info, err),
        None => {
            let error: EngineError = err.to_engine_error();
            warn!(trid = info.id, verb = %info.verb, error = %error, "unhandled transaction failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MemoryHandle, MemorySocket};
    use crate::protocol::frame::{CommandGrammar, PayloadRule};

    struct Host {
        cmdproc: CmdProc<Host>,
        log: Vec<String>,
    }

    impl CmdProcHost for Host {
        fn cmdproc(&mut self) -> &mut CmdProc<Self> {
            &mut self.cmdproc
        }
    }

    fn table() -> Arc<DispatchTable<Host>> {
        let grammar = CommandGrammar::new()
            .with_payload("MSG", PayloadRule::LastParam)
            .with_untracked("MSG")
            .with_informational("ILN");
        let mut table = DispatchTable::new(grammar);
        table.add_command(Some("ADD"), "ADD", |h: &mut Host, c| {
            h.log.push(format!("table add {}", c.param(0).unwrap_or_default()))
        });
        table.add_command(None, "NLN", |h: &mut Host, c| {
            h.log.push(format!("online {}", c.param(1).unwrap_or_default()))
        });
        table.add_command(Some("CHG"), "ILN", |h: &mut Host, c| {
            h.log.push(format!("initial {}", c.param(1).unwrap_or_default()))
        });
        table.add_error("ADD", |h: &mut Host, info, err| {
            h.log.push(format!("table error {} {:?}", info.verb, err.code()))
        });
        table.add_payload_verb("MSG");
        table.add_payload("text/plain", |h: &mut Host, _, msg| {
            h.log.push(format!("text {}", msg.body_text()))
        });
        Arc::new(table)
    }

    fn host() -> (Host, MemoryHandle) {
        let (socket, handle) = MemorySocket::pair();
        let mut conn = Connection::new(ConnectionId(1), 4096);
        conn.begin_connect("localhost", 1863).unwrap();
        conn.connected(Box::new(socket)).unwrap();
        let host = Host {
            cmdproc: CmdProc::new(conn, table(), None),
            log: Vec::new(),
        };
        (host, handle)
    }

    #[test]
    fn test_reply_reaches_callback_with_data() {
        let (mut h, handle) = host();
        let contact = "bob@example.com".to_string();
        let id = h
            .cmdproc
            .send(
                Transaction::new("ADD")
                    .params(["FL", contact.as_str()])
                    .on_reply(move |h: &mut Host, reply| {
                        h.log.push(format!("added {contact} ({})", reply.param(0).unwrap_or_default()))
                    }),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(handle.written_string(), format!("ADD {id} FL bob@example.com\r\n"));

        process(&mut h, format!("ADD {id} OK\r\n").as_bytes());
        assert_eq!(h.log, ["added bob@example.com (OK)"]);
        assert!(h.cmdproc.transactions().is_empty());
    }

    #[test]
    fn test_error_reply_reaches_error_callback() {
        let (mut h, _) = host();
        let id = h
            .cmdproc
            .send(
                Transaction::new("ADD").on_error(|h: &mut Host, _, err| {
                    h.log.push(format!("failed {:?}", err.code()))
                }),
                Instant::now(),
            )
            .unwrap();
        process(&mut h, format!("ADD {id} 208\r\n").as_bytes());
        assert_eq!(h.log, ["failed Some(208)"]);
    }

    #[test]
    fn test_reply_without_callback_uses_table() {
        let (mut h, _) = host();
        let ok = h.cmdproc.send(Transaction::new("ADD"), Instant::now()).unwrap();
        let bad = h.cmdproc.send(Transaction::new("ADD"), Instant::now()).unwrap();
        process(&mut h, format!("ADD {bad} 208\r\nADD {ok} OK\r\n").as_bytes());
        assert_eq!(h.log, ["table error ADD Some(208)", "table add OK"]);
    }

    #[test]
    fn test_interleaved_replies_match_by_id() {
        let (mut h, _) = host();
        let mut ids = Vec::new();
        for name in ["first", "second", "third"] {
            let id = h
                .cmdproc
                .send(
                    Transaction::new("ADD").on_reply(move |h: &mut Host, _| h.log.push(name.to_string())),
                    Instant::now(),
                )
                .unwrap();
            ids.push(id);
        }
        let input = format!("ADD {} OK\r\nADD {} OK\r\nADD {} OK\r\n", ids[2], ids[0], ids[1]);
        process(&mut h, input.as_bytes());
        assert_eq!(h.log, ["third", "first", "second"]);
    }

    #[test]
    fn test_unsolicited_and_unknown() {
        let (mut h, _) = host();
        process(&mut h, b"NLN NLN bob@example.com Bob\r\nXYZ 1 2\r\n911 99\r\n");
        assert_eq!(h.log, ["online bob@example.com"]);
    }

    #[test]
    fn test_informational_reply_keeps_transaction() {
        let (mut h, _) = host();
        let id = h.cmdproc.send(Transaction::new("CHG").param("NLN"), Instant::now()).unwrap();
        let input = format!(
            "ILN {id} NLN bob@example.com Bob\r\nILN {id} BSY carol@example.com Carol\r\n"
        );
        process(&mut h, input.as_bytes());
        assert_eq!(h.log, ["initial bob@example.com", "initial carol@example.com"]);
        assert_eq!(h.cmdproc.transactions().len(), 1);
    }

    #[test]
    fn test_payload_routed_by_content_type() {
        let (mut h, _) = host();
        let body = "Content-Type: text/plain; charset=UTF-8\r\n\r\nhi there";
        let input = format!("MSG bob@example.com Bob {}\r\n{body}", body.len());
        let (head, tail) = input.as_bytes().split_at(30);
        process(&mut h, head);
        assert!(h.log.is_empty());
        process(&mut h, tail);
        assert_eq!(h.log, ["text hi there"]);
    }

    #[test]
    fn test_fail_all_fires_each_callback_once() {
        let (mut h, _) = host();
        for verb in ["ADD", "REM"] {
            h.cmdproc
                .send(
                    Transaction::new(verb).on_error(|h: &mut Host, info, err| {
                        h.log.push(format!("{} {:?}", info.verb, err))
                    }),
                    Instant::now(),
                )
                .unwrap();
        }
        fail_all(&mut h, "closed");
        fail_all(&mut h, "closed");
        assert_eq!(
            h.log,
            [
                "ADD Closed(\"closed\")".to_string(),
                "REM Closed(\"closed\")".to_string()
            ]
        );
    }

    #[test]
    fn test_expire_routes_to_table_error_handler() {
        let (mut h, _) = host();
        let now = Instant::now();
        h.cmdproc
            .send(Transaction::new("ADD").timeout(Duration::from_secs(1)), now)
            .unwrap();
        expire(&mut h, now + Duration::from_secs(2));
        assert_eq!(h.log, ["table error ADD None"]);
    }

    #[test]
    fn test_closed_connection_ignores_input() {
        let (mut h, _) = host();
        h.cmdproc.close();
        process(&mut h, b"NLN NLN bob@example.com Bob\r\n");
        assert!(h.log.is_empty());
    }
}
