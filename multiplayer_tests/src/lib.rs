// Test-only harnesses for multiplayer integration tests.
//
// Two ways to run several participants in one test process:
// - `mesh.rs`: `Mesh`, a deterministic in-memory network of real
//   `Coordinator`s over `MeshTransport`. Tests decide exactly when each
//   queued message is delivered, which is how ownership races are staged.
// - `tcp_node.rs`: `TestNode`, a blocking wrapper around a real
//   `start_node` node on localhost, with polling helpers.
//
// Both record what the coordinator tells the rendering layer in a
// `SceneLog`. The only test-specific code is the delivery control and the
// polling loops; all protocol logic runs through the same code paths as a
// real device.
//
// See also: `tests/ownership_races.rs` (mesh) and `tests/tcp_session.rs`
// (real sockets).

pub mod mesh;
pub mod tcp_node;

use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;
use xoxo_protocol::{BoardId, PeerHandle, Pose, SessionId, TileSnapshot};
use xoxo_session::SceneHooks;

pub use mesh::{Mesh, MeshTransport, Packet};
pub use tcp_node::TestNode;

/// Route `tracing` output through the test harness. `RUST_LOG` overrides the
/// default `warn` level. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_test_writer()
        .try_init();
}

/// One call into the rendering layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneCall {
    Status(String),
    BoardAdded(BoardId, Pose),
    BoardRemoved(BoardId),
    TileChanged(BoardId, TileSnapshot),
    ParticipantAnchor(SessionId, Option<PeerHandle>),
}

/// `SceneHooks` that remembers every call. Clones share the same log.
#[derive(Clone, Debug, Default)]
pub struct SceneLog(Arc<Mutex<Vec<SceneCall>>>);

impl SceneLog {
    pub fn calls(&self) -> Vec<SceneCall> {
        self.0.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SceneCall::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn push(&self, call: SceneCall) {
        self.0.lock().unwrap().push(call);
    }
}

impl SceneHooks for SceneLog {
    fn status_changed(&mut self, status: &str) {
        self.push(SceneCall::Status(status.to_string()));
    }

    fn board_added(&mut self, board: BoardId, pose: Pose) {
        self.push(SceneCall::BoardAdded(board, pose));
    }

    fn board_removed(&mut self, board: BoardId) {
        self.push(SceneCall::BoardRemoved(board));
    }

    fn tile_changed(&mut self, board: BoardId, tile: &TileSnapshot) {
        self.push(SceneCall::TileChanged(board, *tile));
    }

    fn add_participant_anchor(&mut self, session: SessionId, peer: Option<PeerHandle>) {
        self.push(SceneCall::ParticipantAnchor(session, peer));
    }
}
