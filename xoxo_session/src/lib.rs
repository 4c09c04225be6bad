// xoxo_session - peer session and shared-board synchronization for XOXO.
//
// Runs on each device. Discovers and admits nearby peers, learns which
// world-tracking session each peer belongs to, and keeps every participant's
// boards in agreement through an explicit per-tile ownership protocol. It
// never renders anything; the AR layer plugs in through `SceneHooks` and
// feeds taps in as `TapTarget`s.
//
// Module overview:
// - `config.rs`:      `NodeConfig` (serde, defaults) and ownership transfer mode.
// - `error.rs`:       `SessionError` (fatal setup) and `TransportError` (per send).
// - `transport.rs`:   `Transport` trait and `TransportEvent`, the seam the
//                     coordinator is generic over.
// - `tcp.rs`:         `TcpTransport`: listener, dialers, and a reader and
//                     writer thread per link, all posting into one queue.
// - `registry.rs`:    `PeerRegistry`, `PeerHandle -> SessionId`.
// - `board.rs`:       `GameBoard` / `SharedTile` model and grid geometry.
// - `ownership.rs`:   `OwnershipTracker`, requester side of the token protocol.
// - `sync.rs`:        `SyncService`: replicated board store, arbitration,
//                     departure policy. Pure; returns messages and effects.
// - `coordinator.rs`: `Coordinator`: admission, session id exchange, status
//                     text, taps. Single consumer of transport events.
// - `hooks.rs`:       `SceneHooks` callbacks toward the rendering layer.
// - `node.rs`:        `start_node` / `NodeHandle`: the event loop thread that
//                     owns a coordinator over TCP.
//
// Dependencies: `xoxo_protocol` (wire types and framing). No async runtime;
// std threads and `mpsc`, like the rest of the networking code.

pub mod board;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hooks;
pub mod node;
pub mod ownership;
pub mod registry;
pub mod sync;
pub mod tcp;
pub mod transport;

pub use config::{NodeConfig, OwnershipTransferMode};
pub use coordinator::{Coordinator, TapTarget};
pub use error::{SessionError, TransportError};
pub use hooks::{NoopHooks, SceneHooks};
pub use node::{NodeCommand, NodeHandle, NodeView, StatusBoard, start_node};
pub use transport::{SendMode, Transport, TransportEvent};
