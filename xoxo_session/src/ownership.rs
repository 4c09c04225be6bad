// Requester side of the tile ownership protocol.
//
// `OwnershipTracker` remembers the one in-flight request per tile that this
// participant has issued, and decides what a grant, a denial, a timeout or
// the authority's departure means for it. It never touches board state or
// the network; `SyncService` calls it and acts on the returned requests.
//
// Per-tile state seen from here (`TileOwnership`):
//
//   Unowned / OwnedRemotely --interact--> PendingLocal --grant--> OwnedLocally
//                                               |
//                                               +--deny/timeout/authority left-->
//                                                  back to the prior state
//
// Rules:
// - A newer request for the same tile replaces the older one. A grant that
//   arrives for the older request still hands us the token (the authority has
//   already recorded it), so it resolves the newer pending request instead,
//   and the newest desired color is what gets painted. A denial for the older
//   request is ignored.
// - A grant for a request that already timed out still transfers the token,
//   but paints nothing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;
use xoxo_protocol::{BoardId, PeerHandle, RequestId, TileColor, TileIndex};

use crate::board::SharedTile;

/// Tile addressed across all boards.
pub type TileKey = (BoardId, TileIndex);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub id: RequestId,
    pub authority: PeerHandle,
    pub desired: TileColor,
    pub observed_generation: u64,
    pub requested_at: Instant,
}

/// Ownership state of one tile from the local participant's side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileOwnership {
    Unowned,
    PendingLocal(PendingRequest),
    OwnedLocally,
    OwnedRemotely(PeerHandle),
}

#[derive(Debug)]
pub struct OwnershipTracker {
    pending: HashMap<TileKey, PendingRequest>,
    timeout: Duration,
    next_request: u64,
}

impl OwnershipTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            next_request: 0,
        }
    }

    /// Start a request, replacing any older one for the same tile.
    pub fn begin(
        &mut self,
        key: TileKey,
        authority: PeerHandle,
        desired: TileColor,
        observed_generation: u64,
        now: Instant,
    ) -> PendingRequest {
        let request = PendingRequest {
            id: RequestId(self.next_request),
            authority,
            desired,
            observed_generation,
            requested_at: now,
        };
        self.next_request += 1;
        if let Some(old) = self.pending.insert(key, request) {
            debug!(
                "[OWNERSHIP] request {} on {}/{} superseded by {}",
                old.id.0, key.0, key.1, request.id.0
            );
        }
        request
    }

    /// Token granted for `request`. Returns the pending request whose color
    /// should now be painted, if any.
    pub fn granted(&mut self, key: TileKey, request: RequestId) -> Option<PendingRequest> {
        let pending = self.pending.remove(&key);
        match pending {
            Some(p) if p.id != request => {
                debug!(
                    "[OWNERSHIP] stale grant {} on {}/{} resolves newer request {}",
                    request.0, key.0, key.1, p.id.0
                );
            }
            None => {
                debug!(
                    "[OWNERSHIP] grant {} on {}/{} arrived after timeout",
                    request.0, key.0, key.1
                );
            }
            Some(_) => {}
        }
        pending
    }

    /// Token refused for `request`. Returns the dropped request when it was
    /// the current one; denials for superseded requests are ignored.
    pub fn denied(&mut self, key: TileKey, request: RequestId) -> Option<PendingRequest> {
        match self.pending.get(&key) {
            Some(p) if p.id == request => self.pending.remove(&key),
            _ => None,
        }
    }

    /// Drop every request older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(TileKey, PendingRequest)> {
        let timeout = self.timeout;
        let expired: Vec<TileKey> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.requested_at) >= timeout)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|p| (key, p)))
            .collect()
    }

    /// The authority for these requests went away; they can never resolve.
    pub fn authority_left(&mut self, peer: PeerHandle) -> Vec<(TileKey, PendingRequest)> {
        let lost: Vec<TileKey> = self
            .pending
            .iter()
            .filter(|(_, p)| p.authority == peer)
            .map(|(key, _)| *key)
            .collect();
        lost.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|p| (key, p)))
            .collect()
    }

    /// Forget requests on a destroyed board.
    pub fn clear_board(&mut self, board: BoardId) {
        self.pending.retain(|(b, _), _| *b != board);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self, key: TileKey) -> Option<&PendingRequest> {
        self.pending.get(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn state(&self, key: TileKey, tile: &SharedTile, local: PeerHandle) -> TileOwnership {
        match tile.owner {
            Some(owner) if owner == local => TileOwnership::OwnedLocally,
            owner => match (self.pending.get(&key), owner) {
                (Some(p), _) => TileOwnership::PendingLocal(*p),
                (None, Some(remote)) => TileOwnership::OwnedRemotely(remote),
                (None, None) => TileOwnership::Unowned,
            },
        }
    }
}
