//! Line framing with payload continuations.
//!
//! The control stream is a sequence of CRLF-terminated header lines. A
//! header may declare that a fixed number of raw payload bytes follow it;
//! those bytes are collected verbatim (they may contain CRLF) before the
//! command is handed out.
//!
//! ```text
//! "MSG 1 200\r\n" ──> header, payload_len = 200 ──> awaiting payload
//!      120 bytes  ──> still awaiting (120/200)
//!       80 bytes  ──> command complete, back to line mode
//! "PNG\r\n"       ──> header-only command
//! ```

use std::collections::{HashMap, HashSet};

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::command::{is_reply_code, Command};
use crate::error::{EngineError, Result};

/// Longest header line accepted before the stream is declared malformed.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Largest payload a header may declare.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Where a verb keeps its payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    /// Last parameter
    LastParam,
    /// Parameter at a fixed index (after the correlation id)
    Param(usize),
}

/// Per-protocol knowledge the frame reader needs.
#[derive(Debug, Clone, Default)]
pub struct CommandGrammar {
    payload_rules: HashMap<String, PayloadRule>,
    untracked: HashSet<String>,
    informational: HashSet<String>,
    numeric_replies: HashSet<String>,
}

impl CommandGrammar {
    /// Empty grammar: every line is header-only and may carry a trid.
    pub fn new() -> Self {
        Self::default()
    }

    /// `verb` is followed by a payload whose length sits per `rule`.
    pub fn with_payload(mut self, verb: &str, rule: PayloadRule) -> Self {
        self.payload_rules.insert(verb.to_string(), rule);
        self
    }

    /// `verb` never carries a correlation id.
    pub fn with_untracked(mut self, verb: &str) -> Self {
        self.untracked.insert(verb.to_string());
        self
    }

    /// `verb` answers a transaction without completing it.
    pub fn with_informational(mut self, verb: &str) -> Self {
        self.informational.insert(verb.to_string());
        self
    }

    /// `verb` may answer with a single numeric parameter that is data, not an
    /// error code (`SYN 5 210` is list version 210).
    pub fn with_numeric_reply(mut self, verb: &str) -> Self {
        self.numeric_replies.insert(verb.to_string());
        self
    }

    /// Whether `verb` is a non-final reply
    pub fn is_informational(&self, verb: &str) -> bool {
        self.informational.contains(verb)
    }

    /// Split one header line (without CRLF) into a command.
    pub fn parse_line(&self, line: &str) -> Result<Command> {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let verb = tokens
            .next()
            .ok_or_else(|| EngineError::MalformedFrame("empty line".to_string()))?;
        if !verb.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(EngineError::MalformedFrame(format!("bad verb {verb:?}")));
        }

        let mut params: Vec<String> = tokens.map(str::to_string).collect();
        let mut trid = None;
        if !self.untracked.contains(verb) {
            if let Some(id) = params.first().and_then(|p| p.parse::<u32>().ok()) {
                trid = Some(id);
                params.remove(0);
            }
        }

        let mut cmd = Command::new(verb, trid, params);
        if let Some(len) = self.payload_len(&cmd)? {
            cmd.expect_payload(len);
        }
        Ok(cmd)
    }

    fn payload_len(&self, cmd: &Command) -> Result<Option<usize>> {
        let Some(rule) = self.payload_rules.get(cmd.verb()) else {
            return Ok(None);
        };
        let raw = match rule {
            PayloadRule::LastParam => cmd.params().last(),
            PayloadRule::Param(i) => cmd.params().get(*i),
        };
        let raw = raw.ok_or_else(|| {
            EngineError::MalformedFrame(format!("{} without payload length", cmd.verb()))
        })?;
        let len: usize = raw.parse().map_err(|_| {
            EngineError::MalformedFrame(format!("{} payload length {raw:?}", cmd.verb()))
        })?;
        if len > MAX_PAYLOAD_LEN {
            return Err(EngineError::MalformedFrame(format!(
                "{} payload of {len} bytes exceeds limit",
                cmd.verb()
            )));
        }
        Ok(Some(len))
    }

    /// Server error code carried by a reply, if any.
    ///
    /// A numeric verb is always an error (`911 3`). A named verb is an error
    /// when its only parameter is a three-digit code and it has no payload
    /// (`ADD 5 208`), unless the verb was registered with
    /// [`with_numeric_reply`](Self::with_numeric_reply). Codes missing from
    /// the server table are still errors; their severity decides the rest.
    pub fn error_code(&self, cmd: &Command) -> Option<u16> {
        if cmd.is_numeric() {
            return cmd.verb().parse().ok();
        }
        if cmd.payload_len().is_some()
            || cmd.params().len() != 1
            || self.numeric_replies.contains(cmd.verb())
        {
            return None;
        }
        let token = &cmd.params()[0];
        if !is_reply_code(token) {
            return None;
        }
        token.parse().ok()
    }
}

/// Incremental command reader for one stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
    awaiting: Option<Command>,
}

impl FrameReader {
    /// Create an empty reader
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Whether a header was read and its payload is still incomplete
    pub fn is_awaiting_payload(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Bytes held but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete command.
    ///
    /// `None` means more bytes are needed. A malformed line is consumed and
    /// reported as `Some(Err(..))`; the caller may keep reading after it.
    pub fn next_command(&mut self, grammar: &CommandGrammar) -> Option<Result<Command>> {
        loop {
            if let Some(cmd) = self.awaiting.as_ref() {
                let need = cmd.payload_len().unwrap_or(0);
                if self.buf.len() < need {
                    trace!(have = self.buf.len(), need, "awaiting payload");
                    return None;
                }
                let payload = self.buf.split_to(need).freeze();
                let mut cmd = self.awaiting.take()?;
                cmd.attach_payload(payload);
                return Some(Ok(cmd));
            }

            let Some(end) = find_crlf(&self.buf) else {
                if self.buf.len() > MAX_LINE_LEN {
                    let len = self.buf.len();
                    self.buf.clear();
                    return Some(Err(EngineError::MalformedFrame(format!(
                        "line exceeds {MAX_LINE_LEN} bytes ({len} buffered)"
                    ))));
                }
                return None;
            };

            let line = self.buf.split_to(end);
            self.buf.advance(2);
            if line.is_empty() {
                continue;
            }

            let parsed = std::str::from_utf8(&line)
                .map_err(|_| EngineError::MalformedFrame("line is not UTF-8".to_string()))
                .and_then(|line| grammar.parse_line(line));
            match parsed {
                Ok(cmd) if cmd.payload_len().is_some() => self.awaiting = Some(cmd),
                other => return Some(other),
            }
        }
    }

    /// Report the end of the stream.
    ///
    /// Fails with [`EngineError::PayloadTruncated`] when a declared payload
    /// never completed.
    pub fn finish(&mut self) -> Result<()> {
        let result = match self.awaiting.take() {
            Some(cmd) => Err(EngineError::PayloadTruncated {
                expected: cmd.payload_len().unwrap_or(0),
                received: self.buf.len(),
            }),
            None => Ok(()),
        };
        self.buf.clear();
        result
    }

    /// Drop all buffered state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.awaiting = None;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
