//! Parsed control-channel commands.

use std::fmt;

use bytes::Bytes;

/// One complete command: header line plus optional payload.
///
/// Immutable once the frame reader hands it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    trid: Option<u32>,
    params: Vec<String>,
    payload_len: Option<usize>,
    payload: Option<Bytes>,
}

impl Command {
    /// Build a header-only command.
    pub fn new(verb: impl Into<String>, trid: Option<u32>, params: Vec<String>) -> Self {
        Self {
            verb: verb.into(),
            trid,
            params,
            payload_len: None,
            payload: None,
        }
    }

    pub(crate) fn expect_payload(&mut self, len: usize) {
        self.payload_len = Some(len);
    }

    pub(crate) fn attach_payload(&mut self, payload: Bytes) {
        self.payload_len = Some(payload.len());
        self.payload = Some(payload);
    }

    /// Command verb (`USR`, `MSG`, `911`, ...)
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Correlation id, when the line carried one
    pub fn trid(&self) -> Option<u32> {
        self.trid
    }

    /// Parameters after the verb and correlation id
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Parameter at `index`
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Declared payload length
    pub fn payload_len(&self) -> Option<usize> {
        self.payload_len
    }

    /// Payload bytes, once complete
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Whether the verb is a bare numeric reply code (`911 3`)
    pub fn is_numeric(&self) -> bool {
        is_reply_code(&self.verb)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        if let Some(trid) = self.trid {
            write!(f, " {trid}")?;
        }
        for param in &self.params {
            write!(f, " {param}")?;
        }
        Ok(())
    }
}

/// Three ASCII digits.
pub(crate) fn is_reply_code(token: &str) -> bool {
    token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit())
}

/// Serialize an outgoing header line: `VERB id PARAM...\r\n`.
pub fn encode_line(verb: &str, trid: Option<u32>, params: &[String]) -> Vec<u8> {
    let mut line = String::with_capacity(verb.len() + 16);
    line.push_str(verb);
    if let Some(trid) = trid {
        line.push(' ');
        line.push_str(&trid.to_string());
    }
    for param in params {
        line.push(' ');
        line.push_str(param);
    }
    line.push_str("\r\n");
    line.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let cmd = Command::new(
            "ADD",
            Some(5),
            vec!["FL".into(), "bob@example.com".into(), "Bob".into()],
        );
        assert_eq!(cmd.to_string(), "ADD 5 FL bob@example.com Bob");
        assert_eq!(cmd.param(1), Some("bob@example.com"));
        assert!(cmd.param(3).is_none());
    }

    #[test]
    fn test_encode_line() {
        let line = encode_line("VER", Some(1), &["MSNP8".into(), "CVR0".into()]);
        assert_eq!(line, b"VER 1 MSNP8 CVR0\r\n");
        assert_eq!(encode_line("OUT", None, &[]), b"OUT\r\n");
    }

    #[test]
    fn test_reply_code() {
        assert!(is_reply_code("911"));
        assert!(!is_reply_code("91"));
        assert!(!is_reply_code("USR"));
    }
}
