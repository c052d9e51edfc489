//! MIME-style payloads carried by message commands.

use bytes::Bytes;

use crate::error::{EngineError, Result};

/// Header block plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeMessage {
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl MimeMessage {
    /// Split a payload at the first blank line and parse the header block.
    pub fn parse(payload: &Bytes) -> Result<Self> {
        let split = payload
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| EngineError::MalformedFrame("payload has no header block".into()))?;

        let head = std::str::from_utf8(&payload[..split])
            .map_err(|_| EngineError::MalformedFrame("payload headers are not UTF-8".into()))?;
        let headers = parse_headers(head);
        let body = payload.slice(split + 4..);
        Ok(Self { headers, body })
    }

    /// Header value, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in arrival order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Media type without parameters, lowercased.
    pub fn content_type(&self) -> Option<String> {
        self.header("Content-Type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Raw body
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text, replacing invalid UTF-8
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body parsed as another `Key: value` block.
    ///
    /// Several server notices put their fields in the body rather than the
    /// header block.
    pub fn body_fields(&self) -> Vec<(String, String)> {
        parse_headers(&self.body_text())
    }
}

fn parse_headers(block: &str) -> Vec<(String, String)> {
    block
        .split("\r\n")
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        let payload = Bytes::from_static(
            b"MIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\nhello\r\nworld",
        );
        let msg = MimeMessage::parse(&payload).unwrap();
        assert_eq!(msg.content_type().as_deref(), Some("text/plain"));
        assert_eq!(msg.header("mime-version"), Some("1.0"));
        assert_eq!(msg.body_text(), "hello\r\nworld");
    }

    #[test]
    fn test_body_fields() {
        let payload = Bytes::from_static(
            b"Content-Type: text/x-msmsgsinitialemailnotification\r\n\r\nInbox-Unread: 3\r\nFolders-Unread: 0\r\n",
        );
        let msg = MimeMessage::parse(&payload).unwrap();
        let fields = msg.body_fields();
        assert_eq!(fields[0], ("Inbox-Unread".to_string(), "3".to_string()));
    }

    #[test]
    fn test_missing_separator() {
        let payload = Bytes::from_static(b"Content-Type: text/plain");
        assert!(MimeMessage::parse(&payload).is_err());
    }
}
