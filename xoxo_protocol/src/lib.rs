// xoxo_protocol - wire protocol for XOXO shared-board peer sessions.
//
// Defines what travels between two peers: ID types, transport frames, the
// replicated-state messages, the `SessionID:` application message, and the
// length-delimited framing. Shared by every peer; no sockets, no threads.
//
// Module overview:
// - `types.rs`:    `PeerHandle`, `SessionId`, `BoardId`, `RequestId`,
//                  `TileIndex`, `TileColor`, `Pose`.
// - `message.rs`:  `Frame` (per-link envelope), `SyncMessage` (board and
//                  ownership replication), `AppMessage` (`SessionID:<uuid>`).
// - `framing.rs`:  4-byte big-endian length prefix + JSON payload over any
//                  `Read`/`Write`.
//
// Design decisions:
// - **JSON serialization.** Messages are tiny and infrequent (one per tap);
//   readability in logs beats compactness.
// - **Application payloads stay opaque.** `Frame::Data` carries raw bytes so
//   the transport never needs to know the `SessionID:` text format.
// - **No async runtime.** Framing uses `std::io::Read`/`Write`, matching the
//   thread-per-link transport in `xoxo_session`.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{FrameError, MAX_MESSAGE_SIZE, read_frame, read_message, write_frame, write_message};
pub use message::{
    AppMessage, BoardSnapshot, Frame, PROTOCOL_VERSION, SESSION_ID_PREFIX, SyncMessage,
    TileSnapshot,
};
pub use types::{BoardId, PeerHandle, Pose, RequestId, SessionId, TileColor, TileIndex};
