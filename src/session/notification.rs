//! Notification-server command handlers.
//!
//! | Context | Verb  | Meaning                                          |
//! |---------|-------|--------------------------------------------------|
//! | VER     | VER   | version accepted (or `0`: none accepted)         |
//! | CVR     | CVR   | client version acknowledged                      |
//! | USR     | USR   | `TWN S <challenge>` or `OK <account> <name>`     |
//! | *       | XFR   | `NS host:port`: move to another server           |
//! | SYN     | SYN   | contact list version and size                    |
//! | -       | LST   | one contact list entry                           |
//! | CHG     | CHG   | our presence confirmed                           |
//! | CHG     | ILN   | initial presence of a contact                    |
//! | -       | NLN   | contact came online or changed presence          |
//! | -       | FLN   | contact went offline                             |
//! | ADD/REM | ADD/REM | contact list change confirmed                  |
//! | -       | OUT   | server ends the session                          |
//! | -       | MSG   | MIME payload, routed by content type             |
//! | -       | NOT   | notification payload                             |

use std::sync::Arc;

use lazy_static::lazy_static;
use tracing::{debug, info};

use super::{Session, SessionEvent};
use crate::error::ErrorKind;
use crate::login::LoginStep;
use crate::protocol::{
    Command, CommandGrammar, DispatchTable, MimeMessage, PayloadRule, ServerError, Severity,
    Transaction, TransactionError, TransactionInfo,
};

/// Verbs that belong to the login sequence.
const LOGIN_VERBS: &[&str] = &["VER", "CVR", "USR", "SYN"];

lazy_static! {
    static ref TABLE: Arc<DispatchTable<Session>> = Arc::new(build());
}

/// Shared handler table for the notification protocol.
pub(crate) fn table() -> Arc<DispatchTable<Session>> {
    TABLE.clone()
}

/// Grammar of the notification protocol.
pub(crate) fn grammar() -> CommandGrammar {
    CommandGrammar::new()
        .with_payload("MSG", PayloadRule::LastParam)
        .with_untracked("MSG")
        .with_payload("NOT", PayloadRule::Param(0))
        .with_untracked("NOT")
        .with_informational("ILN")
        .with_numeric_reply("SYN")
}

fn build() -> DispatchTable<Session> {
    let mut table = DispatchTable::new(grammar());

    table.add_command(Some("VER"), "VER", ver_reply);
    table.add_command(Some("CVR"), "CVR", cvr_reply);
    table.add_command(Some("USR"), "USR", usr_reply);
    table.add_command(None, "XFR", xfr);
    table.add_command(Some("SYN"), "SYN", syn_reply);
    table.add_command(None, "LST", lst);
    table.add_command(None, "CHG", chg);
    table.add_command(None, "ILN", presence);
    table.add_command(None, "NLN", presence);
    table.add_command(None, "FLN", offline);
    table.add_command(None, "ADD", contact_changed);
    table.add_command(None, "REM", contact_changed);
    table.add_command(None, "OUT", out);
    table.add_command(None, "NOT", notification);
    table.add_command(None, "QNG", |_, _| {});

    for verb in ["VER", "CVR", "USR", "SYN", "CHG", "ADD", "REM"] {
        table.add_error(verb, transaction_failed);
    }

    table.add_payload_verb("MSG");
    table.add_payload("text/plain", text_message);
    table.add_payload("text/x-msmsgsprofile", profile);
    table.add_payload("text/x-msmsgsinitialemailnotification", mail_notice);
    table.add_payload("text/x-msmsgsemailnotification", mail_notice);

    table
}

// --- login -----------------------------------------------------------------

fn ver_reply(session: &mut Session, cmd: &Command) {
    let offered = &session.config().server.protocol_versions;
    let accepted = cmd.params().iter().any(|v| offered.contains(v));
    if cmd.param(0) == Some("0") || !accepted {
        session.fail(
            ErrorKind::UnsupportedVersion,
            format!("server accepted none of {offered:?}"),
        );
        return;
    }
    if !session.advance(LoginStep::Handshake2) {
        return;
    }
    let mut params: Vec<String> = session
        .config()
        .server
        .client_version
        .split_whitespace()
        .map(str::to_string)
        .collect();
    params.push(session.config().account.account.clone());
    session.send_control(Transaction::new("CVR").params(params));
}

fn cvr_reply(session: &mut Session, _cmd: &Command) {
    let account = session.config().account.account.clone();
    session.send_control(Transaction::new("USR").params(["TWN", "I"]).param(account));
}

fn usr_reply(session: &mut Session, cmd: &Command) {
    match (cmd.param(0), cmd.param(1)) {
        (Some("TWN"), Some("S")) => {
            let Some(challenge) = cmd.param(2) else {
                session.fail(ErrorKind::ProtocolViolation, "challenge missing".into());
                return;
            };
            if session.advance(LoginStep::AuthStart) {
                session.request_ticket(challenge.to_string());
            }
        }
        (Some("OK"), _) => {
            if let Some(name) = cmd.param(2) {
                session.set_friendly_name(decode_friendly_name(name));
            }
            if session.advance(LoginStep::Syncing) {
                session.send_control(Transaction::new("SYN").param("0"));
            }
        }
        _ => session.fail(
            ErrorKind::ProtocolViolation,
            format!("unexpected credential reply: {cmd}"),
        ),
    }
}

fn xfr(session: &mut Session, cmd: &Command) {
    if cmd.param(0) != Some("NS") || session.login_step() == LoginStep::Connected {
        debug!(command = %cmd, "ignoring non-server transfer");
        return;
    }
    match cmd.param(1).and_then(parse_host_port) {
        Some((host, port)) => session.redirect(host, port),
        None => session.fail(
            ErrorKind::InvalidRedirect,
            format!("unusable redirect target in {cmd}"),
        ),
    }
}

fn syn_reply(session: &mut Session, cmd: &Command) {
    // SYN <version> [<contacts> <groups>]; no count means the cached list is current.
    let expected = cmd.param(1).and_then(|n| n.parse().ok()).unwrap_or(0);
    debug!(version = ?cmd.param(0), expected, "contact list sync");
    session.begin_sync(expected);
}

fn lst(session: &mut Session, cmd: &Command) {
    let (Some(account), Some(name)) = (cmd.param(0), cmd.param(1)) else {
        debug!(command = %cmd, "short list entry");
        return;
    };
    let lists = cmd.param(2).and_then(|l| l.parse().ok()).unwrap_or(0);
    session.emit(SessionEvent::ContactListed {
        account: account.to_string(),
        friendly_name: decode_friendly_name(name),
        lists,
    });
    session.note_listed();
}

// --- presence and contacts ---------------------------------------------------

fn chg(session: &mut Session, cmd: &Command) {
    if let Some(status) = cmd.param(0) {
        session.emit(SessionEvent::StatusChanged {
            status: status.to_string(),
        });
    }
}

fn presence(session: &mut Session, cmd: &Command) {
    let (Some(status), Some(account)) = (cmd.param(0), cmd.param(1)) else {
        return;
    };
    session.emit(SessionEvent::BuddyUpdate {
        account: account.to_string(),
        status: status.to_string(),
        friendly_name: cmd.param(2).map(decode_friendly_name),
    });
}

fn offline(session: &mut Session, cmd: &Command) {
    if let Some(account) = cmd.param(0) {
        session.emit(SessionEvent::BuddyUpdate {
            account: account.to_string(),
            status: "FLN".to_string(),
            friendly_name: None,
        });
    }
}

fn contact_changed(session: &mut Session, cmd: &Command) {
    // ADD <list> <version> <account> [<name>] / REM <list> <version> <account>
    let (Some(list), Some(account)) = (cmd.param(0), cmd.param(2)) else {
        debug!(command = %cmd, "short contact change");
        return;
    };
    session.emit(SessionEvent::ContactChanged {
        action: cmd.verb().to_string(),
        list: list.to_string(),
        account: account.to_string(),
    });
}

fn out(session: &mut Session, cmd: &Command) {
    match cmd.param(0) {
        Some("OTH") => session.fail(
            ErrorKind::SignedOnElsewhere,
            "signed on from another location".into(),
        ),
        Some("SSD") => session.fail(
            ErrorKind::ServerUnavailable,
            "server is shutting down".into(),
        ),
        reason => session.signed_off(reason.map(str::to_string)),
    }
}

fn transaction_failed(session: &mut Session, info: &TransactionInfo, err: &TransactionError) {
    let during_login = LOGIN_VERBS.contains(&info.verb.as_str())
        && session.login_step() != LoginStep::Connected;
    match err {
        TransactionError::Server { code, .. } => {
            let entry = ServerError::lookup(*code);
            let detail = format!("{} failed: {}", info.verb, ServerError::describe(*code));
            let fatal = entry.is_some_and(|e| e.severity == Severity::Fatal);
            if during_login || fatal {
                let kind = entry
                    .and_then(|e| e.kind)
                    .unwrap_or_else(|| login_error_kind(&info.verb));
                session.fail(kind, detail);
            } else {
                session.emit(SessionEvent::Warning {
                    code: Some(*code),
                    detail,
                });
            }
        }
        TransactionError::Timeout if during_login => {
            session.fail(ErrorKind::Timeout, format!("{} timed out", info.verb));
        }
        TransactionError::Timeout => session.emit(SessionEvent::Warning {
            code: None,
            detail: format!("{} timed out", info.verb),
        }),
        TransactionError::Closed(reason) => {
            debug!(trid = info.id, verb = %info.verb, reason = %reason, "dropped with connection");
        }
    }
}

fn login_error_kind(verb: &str) -> ErrorKind {
    match verb {
        "VER" | "CVR" => ErrorKind::UnsupportedVersion,
        "USR" => ErrorKind::BadCredentials,
        _ => ErrorKind::ProtocolViolation,
    }
}

// --- payloads ------------------------------------------------------------------

fn text_message(session: &mut Session, cmd: &Command, msg: &MimeMessage) {
    session.emit(SessionEvent::MessageReceived {
        from: cmd.param(0).unwrap_or_default().to_string(),
        body: msg.body_text(),
    });
}

fn profile(session: &mut Session, _cmd: &Command, msg: &MimeMessage) {
    let fields = msg
        .headers()
        .iter()
        .filter(|(k, _)| {
            !k.eq_ignore_ascii_case("Content-Type") && !k.eq_ignore_ascii_case("MIME-Version")
        })
        .cloned()
        .collect();
    info!("profile received");
    session.emit(SessionEvent::ServerNotice {
        content_type: "text/x-msmsgsprofile".to_string(),
        fields,
    });
}

fn mail_notice(session: &mut Session, _cmd: &Command, msg: &MimeMessage) {
    session.emit(SessionEvent::ServerNotice {
        content_type: msg.content_type().unwrap_or_default(),
        fields: msg.body_fields(),
    });
}

fn notification(session: &mut Session, cmd: &Command) {
    let body = cmd
        .payload()
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .unwrap_or_default();
    session.emit(SessionEvent::ServerNotice {
        content_type: "notification".to_string(),
        fields: vec![("body".to_string(), body)],
    });
}

// --- helpers -------------------------------------------------------------------

/// `host:port` from a redirect reply.
pub(crate) fn parse_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}

/// Friendly names travel percent-encoded.
pub(crate) fn decode_friendly_name(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn encode_friendly_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b' ' | b'%' | b'\r' | b'\n' => out.push_str(&format!("%{b:02X}")),
            _ if b.is_ascii() => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
