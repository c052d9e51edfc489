//! End-to-end command processor tests.
//!
//! A small host owns a CmdProc over an in-memory socket, so these tests
//! exercise framing, transaction correlation and table dispatch together
//! without any login logic on top.

use std::sync::Arc;
use std::time::{Duration, Instant};

use imengine::connection::{MemoryHandle, MemorySocket};
use imengine::protocol::{
    cmdproc, CmdProc, CmdProcHost, Command, CommandGrammar, DispatchTable, MimeMessage,
    PayloadRule, Transaction, TransactionError, TransactionInfo,
};
use imengine::{Connection, ConnectionId};

struct Client {
    cmdproc: CmdProc<Client>,
    log: Vec<String>,
}

impl CmdProcHost for Client {
    fn cmdproc(&mut self) -> &mut CmdProc<Self> {
        &mut self.cmdproc
    }
}

fn table() -> DispatchTable<Client> {
    let grammar = CommandGrammar::new()
        .with_payload("MSG", PayloadRule::LastParam)
        .with_untracked("MSG")
        .with_informational("ILN");
    let mut table = DispatchTable::new(grammar);
    table.add_command(Some("CHG"), "CHG", |c: &mut Client, cmd: &Command| {
        c.log.push(format!("chg-reply {}", cmd.params().join(" ")));
    });
    table.add_command(None, "CHG", |c: &mut Client, _: &Command| {
        c.log.push("chg-unsolicited".into());
    });
    table.add_command(None, "ILN", |c: &mut Client, cmd: &Command| {
        c.log.push(format!("iln {}", cmd.param(1).unwrap_or_default()));
    });
    table.add_command(None, "ADD", |c: &mut Client, cmd: &Command| {
        c.log.push(format!("add {}", cmd.params().join(" ")));
    });
    table.add_error(
        "ADD",
        |c: &mut Client, info: &TransactionInfo, err: &TransactionError| {
            c.log.push(format!("add-error {} {:?}", info.id, err.code()));
        },
    );
    table.add_payload_verb("MSG");
    table.add_payload(
        "text/plain",
        |c: &mut Client, cmd: &Command, msg: &MimeMessage| {
            c.log
                .push(format!("text from {}: {}", cmd.param(0).unwrap_or_default(), msg.body_text()));
        },
    );
    table
}

fn client() -> (Client, MemoryHandle) {
    let (socket, handle) = MemorySocket::pair();
    let conn = Connection::accepted(ConnectionId(1), Box::new(socket), 64 * 1024);
    let client = Client {
        cmdproc: CmdProc::new(conn, Arc::new(table()), Some(Duration::from_secs(30))),
        log: Vec::new(),
    };
    (client, handle)
}

/// Test the reply callback receives data captured at send time
#[test]
fn test_reply_callback_with_captured_data() {
    let (mut c, handle) = client();
    let wanted = String::from("BSY");
    let id = c
        .cmdproc
        .send(
            Transaction::new("CHG").param("BSY").on_reply(move |c: &mut Client, cmd: &Command| {
                c.log.push(format!("wanted {wanted} got {}", cmd.param(0).unwrap_or_default()));
            }),
            Instant::now(),
        )
        .unwrap();
    assert_eq!(id, 1);
    assert_eq!(handle.written_string(), "CHG 1 BSY\r\n");

    cmdproc::process(&mut c, b"CHG 1 BSY\r\n");
    assert_eq!(c.log, ["wanted BSY got BSY"]);
    assert!(c.cmdproc.transactions().is_empty());
}

/// Test replies without a callback go to the context-specific handler
#[test]
fn test_reply_routed_by_context() {
    let (mut c, _) = client();
    c.cmdproc.send(Transaction::new("CHG").param("NLN"), Instant::now()).unwrap();
    cmdproc::process(&mut c, b"CHG 1 NLN\r\nCHG 0 AWY\r\n");
    assert_eq!(c.log, ["chg-reply NLN", "chg-unsolicited"]);
}

/// Test informational lines keep the transaction open
#[test]
fn test_informational_lines() {
    let (mut c, _) = client();
    c.cmdproc.send(Transaction::new("CHG").param("NLN"), Instant::now()).unwrap();
    cmdproc::process(&mut c, b"ILN 1 NLN bob@x Bob\r\nILN 1 BSY carol@x Carol\r\n");
    assert_eq!(c.cmdproc.transactions().len(), 1);
    cmdproc::process(&mut c, b"CHG 1 NLN\r\n");
    assert_eq!(c.log, ["iln bob@x", "iln carol@x", "chg-reply NLN"]);
    assert!(c.cmdproc.transactions().is_empty());
}

/// Test a named-verb error reply reaches the error callback
#[test]
fn test_error_reply_with_callback() {
    let (mut c, _) = client();
    c.cmdproc
        .send(
            Transaction::new("ADD").params(["FL", "bob@x", "Bob"]).on_error(
                |c: &mut Client, info: &TransactionInfo, err: TransactionError| {
                    c.log.push(format!("{} failed with {:?}", info.verb, err.code()));
                },
            ),
            Instant::now(),
        )
        .unwrap();
    cmdproc::process(&mut c, b"ADD 1 208\r\n");
    assert_eq!(c.log, ["ADD failed with Some(208)"]);
}

/// Test errors without a callback fall back to the table
#[test]
fn test_error_reply_to_table() {
    let (mut c, _) = client();
    c.cmdproc.send(Transaction::new("ADD").params(["FL", "x"]), Instant::now()).unwrap();
    c.cmdproc.send(Transaction::new("ADD").params(["FL", "y"]), Instant::now()).unwrap();
    cmdproc::process(&mut c, b"ADD 1 FL 12 x x\r\n201 2\r\n");
    assert_eq!(c.log, ["add FL 12 x x", "add-error 2 Some(201)"]);
}

/// Test an error code nobody is waiting for is dropped
#[test]
fn test_stray_error_code() {
    let (mut c, _) = client();
    cmdproc::process(&mut c, b"911 9\r\n");
    assert!(c.log.is_empty());
}

/// Test timeouts fire the timeout callback, once
#[test]
fn test_timeout() {
    let (mut c, _) = client();
    let now = Instant::now();
    c.cmdproc
        .send(
            Transaction::new("CHG")
                .param("NLN")
                .timeout(Duration::from_secs(5))
                .on_timeout(|c: &mut Client, info: &TransactionInfo| {
                    c.log.push(format!("timeout {}", info.id));
                }),
            now,
        )
        .unwrap();

    cmdproc::expire(&mut c, now + Duration::from_secs(4));
    assert!(c.log.is_empty());
    cmdproc::expire(&mut c, now + Duration::from_secs(6));
    cmdproc::expire(&mut c, now + Duration::from_secs(60));
    assert_eq!(c.log, ["timeout 1"]);

    // A late reply is handled as unsolicited.
    cmdproc::process(&mut c, b"CHG 1 NLN\r\n");
    assert_eq!(c.log, ["timeout 1", "chg-unsolicited"]);
}

/// Test teardown fails everything pending in send order
#[test]
fn test_fail_all_in_order() {
    let (mut c, _) = client();
    for status in ["NLN", "BSY", "AWY"] {
        c.cmdproc
            .send(
                Transaction::new("CHG").param(status).on_error(
                    |c: &mut Client, info: &TransactionInfo, err: TransactionError| {
                        c.log.push(format!("{} {:?}", info.id, err));
                    },
                ),
                Instant::now(),
            )
            .unwrap();
    }
    cmdproc::fail_all(&mut c, "gone");
    assert_eq!(
        c.log,
        [
            "1 Closed(\"gone\")",
            "2 Closed(\"gone\")",
            "3 Closed(\"gone\")"
        ]
    );
    assert!(c.cmdproc.transactions().is_empty());
}

/// Test a payload split across reads is delivered once, whole
#[test]
fn test_payload_across_reads() {
    let (mut c, _) = client();
    let body = "MIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\nhello there";
    let wire = format!("MSG bob@x Bob {}\r\n{body}", body.len());
    let (a, b) = wire.as_bytes().split_at(30);
    cmdproc::process(&mut c, a);
    assert!(c.log.is_empty());
    cmdproc::process(&mut c, b);
    assert_eq!(c.log, ["text from bob@x: hello there"]);
}

/// Test a failed write leaves nothing pending
#[test]
fn test_failed_write_is_not_pending() {
    let (mut c, handle) = client();
    handle.fail_writes();
    assert!(c
        .cmdproc
        .send(Transaction::new("CHG").param("NLN"), Instant::now())
        .is_err());
    assert!(c.cmdproc.transactions().is_empty());
}
