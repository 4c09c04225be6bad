// Outbound interface to the AR/rendering layer.
//
// The session never draws anything itself. The coordinator reports status
// text and board/tile changes through `SceneHooks`; an embedding app forwards
// them to its scene graph, and tests record them. Every method has a no-op
// default so implementors only override what they display.

use xoxo_protocol::{BoardId, PeerHandle, Pose, SessionId, TileSnapshot};

pub trait SceneHooks: Send {
    /// The single-line status message changed.
    fn status_changed(&mut self, _status: &str) {}

    /// A board (anchor, nine tiles, four grid bars) should appear at `pose`.
    fn board_added(&mut self, _board: BoardId, _pose: Pose) {}

    fn board_removed(&mut self, _board: BoardId) {}

    /// A tile's owner or color changed.
    fn tile_changed(&mut self, _board: BoardId, _tile: &TileSnapshot) {}

    /// A participant anchor for a remote tracking session appeared. `peer` is
    /// the registry's reverse lookup, `None` when no joined peer announced
    /// that session id.
    fn add_participant_anchor(&mut self, _session: SessionId, _peer: Option<PeerHandle>) {}
}

/// Hooks that ignore everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl SceneHooks for NoopHooks {}
