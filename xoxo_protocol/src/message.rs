// Protocol messages exchanged between peers.
//
// Three layers, outermost first:
// - `Frame`: what actually travels over a link. Carries the transport
//   handshake (`Hello` / `Admit` / `Decline` / `Goodbye`), opaque
//   application payloads (`Data`), and replication traffic (`Sync`).
// - `SyncMessage`: the explicit replicated-state protocol. Board lifecycle,
//   ownership request/grant/deny, and tile state. Only the sync service in
//   `xoxo_session` produces or consumes these.
// - `AppMessage`: the one application-level message, `SessionID:<uuid>`,
//   carried as raw UTF-8 bytes inside `Frame::Data`. The transport never
//   looks inside `Data`.
//
// All frame types derive `Serialize`/`Deserialize` for JSON framing (see
// `framing.rs`).

use serde::{Deserialize, Serialize};

use crate::types::{BoardId, PeerHandle, Pose, RequestId, SessionId, TileColor, TileIndex};

/// Transport handshake version. Links with a different version are declined.
pub const PROTOCOL_VERSION: u32 = 1;

/// Prefix of the session identifier announcement.
pub const SESSION_ID_PREFIX: &str = "SessionID:";

/// Everything that travels over a link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame on every link, sent by both sides.
    Hello {
        protocol_version: u32,
        peer: PeerHandle,
        display_name: String,
    },
    /// The sender admitted the receiver (answer to `Hello`).
    Admit,
    /// The sender refuses the link; it closes right after.
    Decline { reason: String },
    /// Opaque application payload.
    Data { payload: Vec<u8> },
    /// Replicated-state traffic.
    Sync(SyncMessage),
    /// Graceful close.
    Goodbye,
}

/// Replicated board state and ownership arbitration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// A board was placed by `creator`, who is also its first custodian.
    BoardPlaced {
        board: BoardId,
        creator: PeerHandle,
        pose: Pose,
    },
    /// A board and all its tiles were destroyed.
    BoardRemoved { board: BoardId },
    /// Full board state, sent to a peer right after it joins.
    Snapshot { boards: Vec<BoardSnapshot> },
    /// Ask the tile's authority for the ownership token.
    RequestOwnership {
        board: BoardId,
        tile: TileIndex,
        request: RequestId,
        observed_generation: u64,
    },
    /// Token granted; the receiver is now the owner at `generation`.
    OwnershipGranted {
        board: BoardId,
        tile: TileIndex,
        request: RequestId,
        generation: u64,
    },
    /// Token refused. Carries the authority's current view.
    OwnershipDenied {
        board: BoardId,
        tile: TileIndex,
        request: RequestId,
        owner: Option<PeerHandle>,
        generation: u64,
    },
    /// Current owner/color of a tile, written by its token holder.
    TileState { board: BoardId, tile: TileSnapshot },
}

/// Replicated view of one board.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub board: BoardId,
    pub creator: PeerHandle,
    pub custodian: PeerHandle,
    pub pose: Pose,
    pub tiles: Vec<TileSnapshot>,
}

/// Replicated view of one tile.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileSnapshot {
    pub index: TileIndex,
    pub owner: Option<PeerHandle>,
    pub color: Option<TileColor>,
    pub generation: u64,
    pub revision: u64,
}

/// Application messages carried inside `Frame::Data`.
#[derive(Clone, Debug, PartialEq)]
pub enum AppMessage {
    /// `SessionID:<uuid>`
    SessionId(SessionId),
}

impl AppMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AppMessage::SessionId(id) => format!("{SESSION_ID_PREFIX}{id}").into_bytes(),
        }
    }

    /// Returns `None` for payloads that are not a recognized application
    /// message (non-UTF-8, unknown prefix, malformed UUID).
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?;
        let value = text.strip_prefix(SESSION_ID_PREFIX)?;
        value.parse().ok().map(AppMessage::SessionId)
    }
}
