//! Peer stream framing.
//!
//! A peer stream opens with an XML declaration and a `<stream:stream>`
//! banner carrying the sender's identity, continues with top-level stanzas,
//! and ends with `</stream:stream>`.
//!
//! ```text
//! <?xml version='1.0' encoding='UTF-8' ?>
//! <stream:stream xmlns="jabber:client" xmlns:stream="..." from="alice@laptop" to="bob@desk">
//!   <message to='bob@desk' from='alice@laptop' type='chat'><body>hi</body></message>
//! </stream:stream>
//! ```

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{EngineError, Result};

/// Stream close marker
pub const STREAM_CLOSE: &str = "</stream:stream>";

const XML_DECL: &str = "<?xml version='1.0' encoding='UTF-8' ?>";
const STREAM_OPEN_TAG: &str = "<stream:stream";

/// Bytes allowed before the banner is complete.
const MAX_BANNER_LEN: usize = 4096;

/// Bytes allowed for one unfinished stanza.
const MAX_STANZA_LEN: usize = 256 * 1024;

lazy_static! {
    /// `name='value'` or `name="value"` attribute pairs
    static ref ATTR_RE: Option<Regex> =
        Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:'([^']*)'|"([^"]*)")"#).ok();

    /// Text of the first `<body>` element
    static ref BODY_RE: Option<Regex> = Regex::new(r"(?s)<body(?:\s[^>]*)?>(.*?)</body>").ok();
}

/// Build the stream-open banner.
pub fn stream_open(from: &str, to: Option<&str>) -> String {
    let mut banner = format!(
        "{XML_DECL}{STREAM_OPEN_TAG} xmlns=\"jabber:client\" \
         xmlns:stream=\"http://etherx.jabber.org/streams\" from=\"{}\"",
        escape(from)
    );
    if let Some(to) = to {
        banner.push_str(&format!(" to=\"{}\"", escape(to)));
    }
    banner.push('>');
    banner
}

/// Build a chat message stanza.
pub fn message_stanza(from: &str, to: &str, body: &str) -> String {
    format!(
        "<message to='{}' from='{}' type='chat'><body>{}</body></message>",
        escape(to),
        escape(from),
        escape(body)
    )
}

/// Escape the five XML entities.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Undo [`escape`].
pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn attribute(tag: &str, name: &str) -> Option<String> {
    ATTR_RE
        .as_ref()?
        .captures_iter(tag)
        .find(|c| c.get(1).is_some_and(|m| m.as_str() == name))
        .and_then(|c| c.get(2).or_else(|| c.get(3)))
        .map(|m| unescape(m.as_str()))
}

/// Something the remote end sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Remote banner, with the identity it declared
    Opened {
        /// `from` attribute
        from: Option<String>,
        /// `to` attribute
        to: Option<String>,
    },
    /// A `<message>` stanza
    Message {
        /// `from` attribute
        from: Option<String>,
        /// Unescaped body text
        body: Option<String>,
    },
    /// Any other top-level stanza, raw
    Stanza(String),
    /// Remote closed the stream
    Closed,
}

/// Incremental parser for one peer stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
    opened: bool,
    closed: bool,
}

impl StreamParser {
    /// Create a parser expecting a banner
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the remote banner has been seen
    pub fn is_opened(&self) -> bool {
        self.opened
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        if !self.closed {
            self.buf.extend_from_slice(data);
        }
    }

    /// Next complete event, or `Ok(None)` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        if self.closed {
            return Ok(None);
        }
        self.skip_whitespace();
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.opened {
            self.next_stanza()
        } else {
            self.next_banner()
        }
    }

    fn skip_whitespace(&mut self) {
        let n = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.drain(..n);
    }

    fn next_banner(&mut self) -> Result<Option<StreamEvent>> {
        if self.buf.starts_with(b"<?") {
            let Some(end) = find(&self.buf, b"?>") else {
                return self.need_more(MAX_BANNER_LEN, "declaration");
            };
            self.buf.drain(..end + 2);
            self.skip_whitespace();
            if self.buf.is_empty() {
                return Ok(None);
            }
        }

        let open = STREAM_OPEN_TAG.as_bytes();
        let prefix = open.len().min(self.buf.len());
        if self.buf[..prefix] != open[..prefix] {
            return Err(EngineError::MalformedFrame(
                "peer stream does not start with a stream banner".into(),
            ));
        }
        let Some(end) = self.buf.iter().position(|&b| b == b'>') else {
            return self.need_more(MAX_BANNER_LEN, "banner");
        };

        let tag: Vec<u8> = self.buf.drain(..=end).collect();
        let tag = String::from_utf8_lossy(&tag);
        self.opened = true;
        Ok(Some(StreamEvent::Opened {
            from: attribute(&tag, "from"),
            to: attribute(&tag, "to"),
        }))
    }

    fn next_stanza(&mut self) -> Result<Option<StreamEvent>> {
        if self.buf.starts_with(STREAM_CLOSE.as_bytes()) {
            self.closed = true;
            self.buf.clear();
            return Ok(Some(StreamEvent::Closed));
        }
        if STREAM_CLOSE.as_bytes().starts_with(&self.buf) {
            return Ok(None);
        }
        if self.buf[0] != b'<' {
            return Err(EngineError::MalformedFrame(
                "text outside of a stanza".into(),
            ));
        }

        let Some(tag_end) = self.buf.iter().position(|&b| b == b'>') else {
            return self.need_more(MAX_STANZA_LEN, "stanza");
        };
        let name_len = self.buf[1..tag_end]
            .iter()
            .take_while(|b| !b.is_ascii_whitespace() && **b != b'/')
            .count();
        let name = String::from_utf8_lossy(&self.buf[1..1 + name_len]).into_owned();
        if name.is_empty() {
            return Err(EngineError::MalformedFrame("stanza without a name".into()));
        }

        let stanza_end = if self.buf[tag_end - 1] == b'/' {
            tag_end + 1
        } else {
            let closing = format!("</{name}>");
            match find(&self.buf[tag_end..], closing.as_bytes()) {
                Some(pos) => tag_end + pos + closing.len(),
                None => return self.need_more(MAX_STANZA_LEN, "stanza"),
            }
        };

        let raw: Vec<u8> = self.buf.drain(..stanza_end).collect();
        let raw = String::from_utf8_lossy(&raw).into_owned();
        if name == "message" {
            let open_tag = raw.split_once('>').map_or(raw.as_str(), |(tag, _)| tag);
            let body = BODY_RE
                .as_ref()
                .and_then(|re| re.captures(&raw))
                .and_then(|c| c.get(1))
                .map(|m| unescape(m.as_str()));
            return Ok(Some(StreamEvent::Message {
                from: attribute(open_tag, "from"),
                body,
            }));
        }
        Ok(Some(StreamEvent::Stanza(raw)))
    }

    fn need_more(&self, limit: usize, what: &str) -> Result<Option<StreamEvent>> {
        if self.buf.len() > limit {
            return Err(EngineError::MalformedFrame(format!(
                "{what} exceeds {limit} bytes"
            )));
        }
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
