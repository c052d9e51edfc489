//! Direct peer-to-peer streams.
//!
//! Peers on the local network are learned from discovery events (appeared,
//! updated, departed) and reached over plain TCP streams that open with an
//! XML stream banner.
//!
//! ## Handshake
//!
//! ```text
//! Outbound                                 Inbound
//!    |                                        |
//!    |--- connect (candidate 1, 2, ...) ----->|
//!    |--- <stream:stream from=us to=them> --->|  local: NotSent -> FullySent
//!    |                                        |  match identity / address
//!    |<-- <stream:stream from=them to=us> ----|
//!    |                                        |
//!    |    both banners done: Pending -> Active, queued messages flushed
//!    |                                        |
//!    |=== <message>...</message> ============>|
//!    |--- </stream:stream> ------------------>|
//! ```

mod connection;
mod manager;
mod registry;
pub mod stream;

pub use connection::{Direction, HandshakeState, Membership, PeerConnection};
pub use manager::PeerConnectionManager;
pub use registry::{InboundMatch, PeerRecord, PeerRegistry};
pub use stream::{StreamEvent, StreamParser};
