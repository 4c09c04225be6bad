// Error types for the session crate.
//
// Two tiers. `SessionError` is the fatal one: the node cannot offer shared
// play, so `start_node` refuses to hand back a half-built node.
// `TransportError` covers single sends; callers log it and move on, since a
// broken link is reported separately as a `PeerLeft` event.

use std::io;

use thiserror::Error;
use xoxo_protocol::PeerHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("synchronization channel unavailable: {0}")]
    SyncChannelUnavailable(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerHandle),

    #[error("link to {0} is closed")]
    LinkClosed(PeerHandle),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}
