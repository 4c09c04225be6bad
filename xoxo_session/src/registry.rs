// Peer identity registry: `PeerHandle -> SessionId`.
//
// The transport knows nothing about world-tracking sessions, so each peer
// tells us its session id with a `SessionID:` announcement and we keep the
// mapping by hand. Entries appear only on announcement and vanish when the
// peer leaves; the coordinator drops announcements from peers the transport
// does not report as connected, so the key set is always a subset of the
// connected set.

use std::collections::HashMap;

use tracing::debug;
use xoxo_protocol::{PeerHandle, SessionId};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    sessions: HashMap<PeerHandle, SessionId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing to record yet: the mapping only exists once the peer
    /// announces its session id.
    pub fn on_peer_joined(&mut self, peer: PeerHandle) {
        debug!("[REGISTRY] {peer} joined, awaiting session id");
    }

    /// Insert or overwrite the mapping. Returns the previous id, if any.
    pub fn on_session_id_announced(
        &mut self,
        peer: PeerHandle,
        session_id: SessionId,
    ) -> Option<SessionId> {
        let previous = self.sessions.insert(peer, session_id);
        if previous != Some(session_id) {
            debug!("[REGISTRY] {peer} -> {session_id}");
        }
        previous
    }

    /// Remove the mapping. Absent peers are a no-op.
    pub fn on_peer_left(&mut self, peer: PeerHandle) -> Option<SessionId> {
        self.sessions.remove(&peer)
    }

    pub fn session_id(&self, peer: PeerHandle) -> Option<SessionId> {
        self.sessions.get(&peer).copied()
    }

    /// Reverse lookup, used to match a participant anchor to its peer.
    pub fn peer_for_session(&self, session_id: SessionId) -> Option<PeerHandle> {
        self.sessions
            .iter()
            .find(|(_, id)| **id == session_id)
            .map(|(peer, _)| *peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.sessions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
