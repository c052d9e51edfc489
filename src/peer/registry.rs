//! Peers known from local discovery.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use serde::Serialize;
use tracing::debug;

/// One discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    /// Announced identity
    pub identity: String,
    /// Candidate addresses, in preference order
    pub addresses: Vec<IpAddr>,
    /// Stream port
    pub port: u16,
    /// Free-form attributes (status, nickname, ...)
    pub metadata: HashMap<String, String>,
}

/// Outcome of matching an unsolicited inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMatch {
    /// Exactly one known peer fits
    Bound(String),
    /// The declared identity is known but none of its addresses is the source
    AddressMismatch,
    /// Several peers share the source address and none was declared
    Ambiguous(usize),
    /// Nobody fits
    Unknown,
}

/// Discovery state: identity to record.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<String, PeerRecord>,
}

impl PeerRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a peer. Returns `true` if it was not known before.
    pub fn appeared(&mut self, identity: &str, addresses: Vec<IpAddr>, port: u16) -> bool {
        debug!(identity, ?addresses, port, "peer appeared");
        match self.peers.get_mut(identity) {
            Some(record) => {
                record.addresses = addresses;
                record.port = port;
                false
            }
            None => {
                self.peers.insert(
                    identity.to_string(),
                    PeerRecord {
                        identity: identity.to_string(),
                        addresses,
                        port,
                        metadata: HashMap::new(),
                    },
                );
                true
            }
        }
    }

    /// Merge attributes into a known peer. Returns `false` if unknown.
    pub fn updated(&mut self, identity: &str, metadata: HashMap<String, String>) -> bool {
        match self.peers.get_mut(identity) {
            Some(record) => {
                record.metadata.extend(metadata);
                true
            }
            None => false,
        }
    }

    /// Forget a peer.
    pub fn departed(&mut self, identity: &str) -> Option<PeerRecord> {
        debug!(identity, "peer departed");
        self.peers.remove(identity)
    }

    /// Record for `identity`
    pub fn get(&self, identity: &str) -> Option<&PeerRecord> {
        self.peers.get(identity)
    }

    /// Every known peer, by identity
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is known
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Attribute an inbound connection from `source` to a known peer.
    ///
    /// With a declared identity, that peer must list `source` among its
    /// addresses. Without one, the source address alone must single out
    /// exactly one peer.
    pub fn resolve_inbound(&self, declared: Option<&str>, source: IpAddr) -> InboundMatch {
        if let Some(identity) = declared {
            return match self.peers.get(identity) {
                Some(record) if record.addresses.contains(&source) => {
                    InboundMatch::Bound(identity.to_string())
                }
                Some(_) => InboundMatch::AddressMismatch,
                None => InboundMatch::Unknown,
            };
        }

        let mut matches = self
            .peers
            .values()
            .filter(|r| r.addresses.contains(&source));
        match (matches.next(), matches.count()) {
            (Some(record), 0) => InboundMatch::Bound(record.identity.clone()),
            (Some(_), others) => InboundMatch::Ambiguous(others + 1),
            (None, _) => InboundMatch::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn registry() -> PeerRegistry {
        let mut reg = PeerRegistry::new();
        reg.appeared("bob@desk", vec![ip("192.168.1.20"), ip("fe80::20")], 5298);
        reg.appeared("carol@nas", vec![ip("192.168.1.30")], 5298);
        reg.appeared("dave@vm", vec![ip("192.168.1.30")], 5299);
        reg
    }

    #[test]
    fn test_declared_identity_must_match_address() {
        let reg = registry();
        assert_eq!(
            reg.resolve_inbound(Some("bob@desk"), ip("fe80::20")),
            InboundMatch::Bound("bob@desk".into())
        );
        assert_eq!(
            reg.resolve_inbound(Some("bob@desk"), ip("192.168.1.99")),
            InboundMatch::AddressMismatch
        );
        assert_eq!(
            reg.resolve_inbound(Some("eve@evil"), ip("192.168.1.20")),
            InboundMatch::Unknown
        );
    }

    #[test]
    fn test_address_only_match() {
        let reg = registry();
        assert_eq!(
            reg.resolve_inbound(None, ip("192.168.1.20")),
            InboundMatch::Bound("bob@desk".into())
        );
        assert_eq!(
            reg.resolve_inbound(None, ip("192.168.1.30")),
            InboundMatch::Ambiguous(2)
        );
        assert_eq!(
            reg.resolve_inbound(None, ip("10.0.0.1")),
            InboundMatch::Unknown
        );
    }

    #[test]
    fn test_lifecycle() {
        let mut reg = registry();
        assert!(!reg.appeared("bob@desk", vec![ip("192.168.1.21")], 5298));
        assert_eq!(reg.get("bob@desk").unwrap().addresses, [ip("192.168.1.21")]);

        let mut meta = HashMap::new();
        meta.insert("status".to_string(), "avail".to_string());
        assert!(reg.updated("bob@desk", meta.clone()));
        assert!(!reg.updated("nobody", meta));

        assert!(reg.departed("bob@desk").is_some());
        assert!(reg.get("bob@desk").is_none());
        assert_eq!(reg.len(), 2);
    }
}
