// Replicated board store and ownership arbitration.
//
// `SyncService` is the explicit replacement for a "keep shared objects in
// sync" black box. It holds every board this participant knows about, runs
// the authority side of the ownership protocol for tiles it arbitrates, and
// drives `OwnershipTracker` for the requests it issues.
//
// It does no I/O. Every operation returns a `SyncOutput`: messages to send
// (with symbolic recipients the coordinator resolves against the connected
// set) and `SceneEffect`s for the rendering layer. This keeps the protocol
// testable without a transport.
//
// Replicated fields: board existence and pose, custodian, and per tile the
// owner, color, generation and revision. Nothing else crosses the wire.
//
// Arbitration rule (authority side, `handle_request`): grant iff the
// requester's observed generation matches ours and the tile is unowned or
// owned by us with `AutoAccept`. Granting bumps the generation, so of two
// requests made against the same view at most one can win. Only the token
// holder writes tile state, and readers apply writes in `(generation,
// revision)` order.
//
// Departure policy (`on_peer_left`): tiles owned by the departed peer revert
// to unowned, and boards it was custodian of pass to the smallest remaining
// handle. Our view of the departed peer's tiles may be stale (it may have
// handed one on just before leaving), so every survivor broadcasts a
// snapshot, and a reverted tile is not granted until each survivor that was
// connected at the time has been heard from. A survivor still holding the
// token re-asserts it through that snapshot.
//
// Reconnects: peers that were split apart each pick their own custodian. On
// the join snapshot a board's custodian becomes the smaller of the two
// claims, counting only claims that name us or a connected peer, so both
// sides converge on the same one. Tile states written independently during
// the split are ordered by `(generation, revision, owner)`, which lets both
// sides keep the same one.
//
// Late grants: a grant that reaches us after our request timed out still
// moves the token to us, because the authority already recorded the
// transfer and handing it back would need another round trip. Nothing is
// painted and the tile simply reads as ours.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tracing::{debug, info, warn};
use xoxo_protocol::{
    BoardId, BoardSnapshot, PeerHandle, Pose, RequestId, SyncMessage, TileColor, TileIndex,
    TileSnapshot,
};

use crate::board::GameBoard;
use crate::config::OwnershipTransferMode;
use crate::ownership::{OwnershipTracker, TileKey, TileOwnership};

/// Who an outgoing message is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipients {
    One(PeerHandle),
    /// Every connected peer except the given one.
    AllExcept(Option<PeerHandle>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub to: Recipients,
    pub message: SyncMessage,
}

/// Something the rendering layer should reflect.
#[derive(Clone, Debug, PartialEq)]
pub enum SceneEffect {
    BoardAdded { board: BoardId, pose: Pose },
    BoardRemoved { board: BoardId },
    TileChanged { board: BoardId, tile: TileSnapshot },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOutput {
    pub outgoing: Vec<Outgoing>,
    pub effects: Vec<SceneEffect>,
}

impl SyncOutput {
    fn send(&mut self, to: Recipients, message: SyncMessage) {
        self.outgoing.push(Outgoing { to, message });
    }

    fn effect(&mut self, effect: SceneEffect) {
        self.effects.push(effect);
    }

    fn tile_changed(&mut self, board: BoardId, tile: TileSnapshot) {
        self.effect(SceneEffect::TileChanged { board, tile });
    }
}

/// Result of a local `interact`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InteractOutcome {
    /// Color applied in this reaction (already owned, or we are the
    /// authority and granted ourselves the token).
    Applied,
    /// Ownership requested from `authority`; resolution arrives later.
    Requested {
        request: RequestId,
        authority: PeerHandle,
    },
    /// Not applied and nothing in flight.
    Denied,
    /// No such board.
    UnknownBoard,
}

pub struct SyncService {
    local: PeerHandle,
    transfer_mode: OwnershipTransferMode,
    boards: BTreeMap<BoardId, GameBoard>,
    tracker: OwnershipTracker,
    peers: BTreeSet<PeerHandle>,
    /// Tiles freed by a departure, with the survivors we still need a
    /// snapshot from before granting them.
    unsettled: BTreeMap<TileKey, BTreeSet<PeerHandle>>,
}

impl SyncService {
    pub fn new(
        local: PeerHandle,
        transfer_mode: OwnershipTransferMode,
        tracker: OwnershipTracker,
    ) -> Self {
        Self {
            local,
            transfer_mode,
            boards: BTreeMap::new(),
            tracker,
            peers: BTreeSet::new(),
            unsettled: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> PeerHandle {
        self.local
    }

    pub fn board(&self, board: BoardId) -> Option<&GameBoard> {
        self.boards.get(&board)
    }

    pub fn boards(&self) -> impl Iterator<Item = &GameBoard> {
        self.boards.values()
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    pub fn ownership(&self, board: BoardId, tile: TileIndex) -> Option<TileOwnership> {
        let b = self.boards.get(&board)?;
        Some(self.tracker.state((board, tile), b.tile(tile), self.local))
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending_count()
    }

    /// Whether `tile` was freed by a departure and is still waiting for the
    /// survivors to report.
    pub fn is_unsettled(&self, board: BoardId, tile: TileIndex) -> bool {
        self.unsettled.contains_key(&(board, tile))
    }

    pub fn on_peer_joined(&mut self, peer: PeerHandle) {
        self.peers.insert(peer);
    }

    /// Full state for a peer that just joined.
    pub fn snapshot(&self) -> SyncMessage {
        SyncMessage::Snapshot {
            boards: self.boards.values().map(GameBoard::snapshot).collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Local operations
    // -----------------------------------------------------------------------

    /// Create a board anchored at `pose` with the local participant as
    /// creator and custodian.
    pub fn place_board(&mut self, pose: Pose) -> (BoardId, SyncOutput) {
        let id = BoardId::random();
        let board = GameBoard::new(id, pose, self.local);
        self.boards.insert(id, board);
        info!("[SYNC] placed board {id}");

        let mut out = SyncOutput::default();
        out.send(
            Recipients::AllExcept(None),
            SyncMessage::BoardPlaced {
                board: id,
                creator: self.local,
                pose,
            },
        );
        out.effect(SceneEffect::BoardAdded { board: id, pose });
        (id, out)
    }

    /// Destroy every board, locally and on every peer.
    pub fn remove_all_boards(&mut self) -> SyncOutput {
        let mut out = SyncOutput::default();
        for id in std::mem::take(&mut self.boards).into_keys() {
            out.send(Recipients::AllExcept(None), SyncMessage::BoardRemoved { board: id });
            out.effect(SceneEffect::BoardRemoved { board: id });
        }
        self.tracker.clear();
        self.unsettled.clear();
        out
    }

    /// Paint `tile` with `desired`, acquiring the token first if needed.
    /// `connected` is the transport's current peer set.
    pub fn interact(
        &mut self,
        board_id: BoardId,
        tile: TileIndex,
        desired: TileColor,
        connected: &[PeerHandle],
        now: Instant,
    ) -> (InteractOutcome, SyncOutput) {
        let mut out = SyncOutput::default();
        let local = self.local;
        let Some(board) = self.boards.get_mut(&board_id) else {
            warn!("[SYNC] interact on unknown board {board_id}");
            return (InteractOutcome::UnknownBoard, out);
        };

        let authority = board.authority(tile);
        let t = board.tile_mut(tile);

        if t.owner == Some(local) {
            t.paint(desired);
            let snap = t.snapshot();
            Self::publish_tile(&mut out, board_id, snap);
            return (InteractOutcome::Applied, out);
        }

        if authority == local && self.unsettled.contains_key(&(board_id, tile)) {
            debug!("[SYNC] {board_id}/{tile} was freed by a departure, waiting for survivors");
            return (InteractOutcome::Denied, out);
        }

        if authority == local {
            // Unowned tile on a board we are custodian of: arbitrate for
            // ourselves in the same reaction.
            t.transfer_to(Some(local));
            t.paint(desired);
            let snap = t.snapshot();
            debug!("[SYNC] self-granted {board_id}/{tile} at generation {}", snap.generation);
            Self::publish_tile(&mut out, board_id, snap);
            return (InteractOutcome::Applied, out);
        }

        if !connected.contains(&authority) {
            warn!("[SYNC] authority {authority} for {board_id}/{tile} is not connected");
            return (InteractOutcome::Denied, out);
        }

        let observed_generation = t.generation;
        let request =
            self.tracker
                .begin((board_id, tile), authority, desired, observed_generation, now);
        debug!(
            "[SYNC] requesting {board_id}/{tile} from {authority} (request {}, generation {observed_generation})",
            request.id.0
        );
        out.send(
            Recipients::One(authority),
            SyncMessage::RequestOwnership {
                board: board_id,
                tile,
                request: request.id,
                observed_generation,
            },
        );
        (
            InteractOutcome::Requested {
                request: request.id,
                authority,
            },
            out,
        )
    }

    /// The request never reached its authority; resolve it as denied.
    pub fn abandon_request(&mut self, board: BoardId, tile: TileIndex, request: RequestId) {
        if self.tracker.denied((board, tile), request).is_some() {
            debug!("[SYNC] request {} for {board}/{tile} abandoned", request.0);
        }
    }

    /// Expire requests that outlived the ownership timeout.
    pub fn tick(&mut self, now: Instant) {
        for ((board, tile), request) in self.tracker.expire(now) {
            debug!(
                "[SYNC] request {} for {board}/{tile} timed out, treating as denied",
                request.id.0
            );
        }
    }

    /// Apply the departure policy for `peer`. `remaining` is the connected
    /// set after the departure.
    pub fn on_peer_left(&mut self, peer: PeerHandle, remaining: &[PeerHandle]) -> SyncOutput {
        let mut out = SyncOutput::default();
        self.peers.remove(&peer);
        self.unsettled.retain(|_, waiting| {
            waiting.remove(&peer);
            !waiting.is_empty()
        });
        let survivors: BTreeSet<PeerHandle> =
            remaining.iter().copied().filter(|p| *p != peer).collect();

        for ((board, tile), request) in self.tracker.authority_left(peer) {
            debug!(
                "[SYNC] authority {peer} left, request {} for {board}/{tile} denied",
                request.id.0
            );
        }

        let successor = remaining
            .iter()
            .copied()
            .filter(|p| *p != peer)
            .chain(std::iter::once(self.local))
            .min()
            .unwrap_or(self.local);

        for board in self.boards.values_mut() {
            if board.custodian == peer {
                info!("[SYNC] board {} custody passes from {peer} to {successor}", board.id);
                board.custodian = successor;
            }
            let id = board.id;
            for t in board.tiles_mut() {
                if t.owner == Some(peer) {
                    t.transfer_to(None);
                    out.tile_changed(id, t.snapshot());
                    if !survivors.is_empty() {
                        self.unsettled.insert((id, t.index), survivors.clone());
                    }
                }
            }
        }

        if !self.boards.is_empty() && !survivors.is_empty() {
            out.send(Recipients::AllExcept(None), self.snapshot());
        }
        out
    }

    // -----------------------------------------------------------------------
    // Remote messages
    // -----------------------------------------------------------------------

    pub fn handle(&mut self, from: PeerHandle, message: SyncMessage) -> SyncOutput {
        match message {
            SyncMessage::BoardPlaced {
                board,
                creator,
                pose,
            } => self.handle_board_placed(board, creator, pose),
            SyncMessage::BoardRemoved { board } => self.handle_board_removed(board),
            SyncMessage::Snapshot { boards } => self.handle_snapshot(from, boards),
            SyncMessage::RequestOwnership {
                board,
                tile,
                request,
                observed_generation,
            } => self.handle_request(from, board, tile, request, observed_generation),
            SyncMessage::OwnershipGranted {
                board,
                tile,
                request,
                generation,
            } => self.handle_granted(from, board, tile, request, generation),
            SyncMessage::OwnershipDenied {
                board,
                tile,
                request,
                owner,
                generation,
            } => self.handle_denied(board, tile, request, owner, generation),
            SyncMessage::TileState { board, tile } => self.handle_tile_state(board, tile),
        }
    }

    fn handle_board_placed(&mut self, id: BoardId, creator: PeerHandle, pose: Pose) -> SyncOutput {
        let mut out = SyncOutput::default();
        if self.boards.contains_key(&id) {
            return out;
        }
        info!("[SYNC] board {id} placed by {creator}");
        self.boards.insert(id, GameBoard::new(id, pose, creator));
        out.effect(SceneEffect::BoardAdded { board: id, pose });
        out
    }

    fn handle_board_removed(&mut self, id: BoardId) -> SyncOutput {
        let mut out = SyncOutput::default();
        if self.boards.remove(&id).is_some() {
            info!("[SYNC] board {id} removed");
            self.tracker.clear_board(id);
            self.unsettled.retain(|(board, _), _| *board != id);
            out.effect(SceneEffect::BoardRemoved { board: id });
        }
        out
    }

    fn handle_snapshot(&mut self, from: PeerHandle, boards: Vec<BoardSnapshot>) -> SyncOutput {
        let mut out = SyncOutput::default();
        self.unsettled.retain(|_, waiting| {
            waiting.remove(&from);
            !waiting.is_empty()
        });
        for snap in boards {
            match self.boards.get_mut(&snap.board) {
                Some(existing) => {
                    let custodian =
                        settle_custodian(existing.custodian, snap.custodian, self.local, &self.peers);
                    if custodian != existing.custodian {
                        info!(
                            "[SYNC] board {} custody settles on {custodian} (was {})",
                            snap.board, existing.custodian
                        );
                        existing.custodian = custodian;
                    }
                    for tile in &snap.tiles {
                        if existing.tile_mut(tile.index).apply_snapshot(tile) {
                            out.tile_changed(snap.board, *tile);
                        }
                    }
                }
                None => {
                    let board = GameBoard::from_snapshot(&snap);
                    out.effect(SceneEffect::BoardAdded {
                        board: board.id,
                        pose: board.pose,
                    });
                    for tile in board.tiles().filter(|t| t.color.is_some()) {
                        out.tile_changed(board.id, tile.snapshot());
                    }
                    debug!("[SYNC] board {} received in snapshot", board.id);
                    self.boards.insert(board.id, board);
                }
            }
        }
        out
    }

    fn handle_request(
        &mut self,
        from: PeerHandle,
        board_id: BoardId,
        tile: TileIndex,
        request: RequestId,
        observed_generation: u64,
    ) -> SyncOutput {
        let mut out = SyncOutput::default();
        let local = self.local;
        let transfer_mode = self.transfer_mode;

        let Some(board) = self.boards.get_mut(&board_id) else {
            out.send(
                Recipients::One(from),
                SyncMessage::OwnershipDenied {
                    board: board_id,
                    tile,
                    request,
                    owner: None,
                    generation: 0,
                },
            );
            return out;
        };

        let authority = board.authority(tile);
        let unsettled = self.unsettled.contains_key(&(board_id, tile));
        let t = board.tile_mut(tile);

        let grant = if t.owner == Some(from) {
            // Redundant: already theirs. Confirm without a new generation.
            true
        } else if authority != local {
            debug!("[SYNC] request for {board_id}/{tile} from {from} sent to non-authority");
            false
        } else if unsettled {
            debug!("[SYNC] request for {board_id}/{tile} from {from} held: freed by a departure");
            false
        } else if t.generation != observed_generation {
            debug!(
                "[SYNC] request for {board_id}/{tile} from {from} raced: observed {observed_generation}, current {}",
                t.generation
            );
            false
        } else if t.owner == Some(local) && transfer_mode == OwnershipTransferMode::Manual {
            false
        } else {
            t.transfer_to(Some(from));
            true
        };

        let snap = t.snapshot();
        if grant {
            debug!("[SYNC] granted {board_id}/{tile} to {from} at generation {}", snap.generation);
            out.send(
                Recipients::One(from),
                SyncMessage::OwnershipGranted {
                    board: board_id,
                    tile,
                    request,
                    generation: snap.generation,
                },
            );
            out.send(
                Recipients::AllExcept(Some(from)),
                SyncMessage::TileState {
                    board: board_id,
                    tile: snap,
                },
            );
            out.tile_changed(board_id, snap);
        } else {
            out.send(
                Recipients::One(from),
                SyncMessage::OwnershipDenied {
                    board: board_id,
                    tile,
                    request,
                    owner: snap.owner,
                    generation: snap.generation,
                },
            );
        }
        out
    }

    fn handle_granted(
        &mut self,
        from: PeerHandle,
        board_id: BoardId,
        tile: TileIndex,
        request: RequestId,
        generation: u64,
    ) -> SyncOutput {
        let mut out = SyncOutput::default();
        let local = self.local;
        let Some(board) = self.boards.get_mut(&board_id) else {
            self.tracker.denied((board_id, tile), request);
            return out;
        };
        let t = board.tile_mut(tile);

        if generation < t.generation {
            debug!(
                "[SYNC] ignoring grant {} from {from} for {board_id}/{tile}: generation {generation} < {}",
                request.0, t.generation
            );
            self.tracker.denied((board_id, tile), request);
            return out;
        }

        if t.owner != Some(local) || t.generation != generation {
            t.owner = Some(local);
            t.generation = generation;
            t.revision = 0;
        }

        match self.tracker.granted((board_id, tile), request) {
            Some(pending) => {
                t.paint(pending.desired);
                let snap = t.snapshot();
                debug!("[SYNC] {board_id}/{tile} granted by {from}, painting {:?}", pending.desired);
                Self::publish_tile(&mut out, board_id, snap);
            }
            None => out.tile_changed(board_id, t.snapshot()),
        }
        out
    }

    fn handle_denied(
        &mut self,
        board_id: BoardId,
        tile: TileIndex,
        request: RequestId,
        owner: Option<PeerHandle>,
        generation: u64,
    ) -> SyncOutput {
        let mut out = SyncOutput::default();
        if self.tracker.denied((board_id, tile), request).is_some() {
            debug!("[SYNC] request {} for {board_id}/{tile} denied", request.0);
        }
        if let Some(board) = self.boards.get_mut(&board_id) {
            let t = board.tile_mut(tile);
            // Learn the authority's view so the next request targets the
            // right peer with the right generation.
            if generation > t.generation {
                t.owner = owner;
                t.generation = generation;
                t.revision = 0;
                out.tile_changed(board_id, t.snapshot());
            }
        }
        out
    }

    fn handle_tile_state(&mut self, board_id: BoardId, tile: TileSnapshot) -> SyncOutput {
        let mut out = SyncOutput::default();
        let Some(board) = self.boards.get_mut(&board_id) else {
            debug!("[SYNC] tile state for unknown board {board_id}");
            return out;
        };
        if board.tile_mut(tile.index).apply_snapshot(&tile) {
            out.tile_changed(board_id, tile);
        }
        out
    }

    /// Record a write by the token holder: notify the scene and replicate.
    fn publish_tile(out: &mut SyncOutput, board: BoardId, tile: TileSnapshot) {
        out.send(
            Recipients::AllExcept(None),
            SyncMessage::TileState { board, tile },
        );
        out.tile_changed(board, tile);
    }
}

/// Custodian both sides of a reconnect agree on: the smaller of the two
/// claims, ignoring a claim that names neither us nor a connected peer.
fn settle_custodian(
    ours: PeerHandle,
    theirs: PeerHandle,
    local: PeerHandle,
    peers: &BTreeSet<PeerHandle>,
) -> PeerHandle {
    let reachable = |p: PeerHandle| p == local || peers.contains(&p);
    match (reachable(ours), reachable(theirs)) {
        (true, true) => ours.min(theirs),
        (false, true) => theirs,
        _ => ours,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn tile(i: u8) -> TileIndex {
        TileIndex::new(i).unwrap()
    }

    fn service(local: PeerHandle) -> SyncService {
        SyncService::new(
            local,
            OwnershipTransferMode::AutoAccept,
            OwnershipTracker::new(Duration::from_secs(3)),
        )
    }

    /// A custodian service plus a second service that knows the same board.
    fn pair() -> (SyncService, SyncService, BoardId) {
        let a = PeerHandle::random();
        let b = PeerHandle::random();
        let mut custodian = service(a);
        let mut other = service(b);
        let (board, out) = custodian.place_board(Pose::IDENTITY);
        for o in out.outgoing {
            other.handle(a, o.message);
        }
        (custodian, other, board)
    }

    fn requests(out: &SyncOutput) -> usize {
        out.outgoing
            .iter()
            .filter(|o| matches!(o.message, SyncMessage::RequestOwnership { .. }))
            .count()
    }

    #[test]
    fn custodian_grants_itself_in_the_same_reaction() {
        let (mut a, _b, board) = pair();
        let (outcome, out) = a.interact(board, tile(0), TileColor::Blue, &[], Instant::now());
        assert_eq!(outcome, InteractOutcome::Applied);
        assert_eq!(requests(&out), 0);
        let t = a.board(board).unwrap().tile(tile(0));
        assert_eq!(t.owner, Some(a.local()));
        assert_eq!(t.color, Some(TileColor::Blue));
        assert_eq!(a.ownership(board, tile(0)), Some(TileOwnership::OwnedLocally));
    }

    #[test]
    fn owned_tile_is_painted_without_a_request() {
        let (mut a, _b, board) = pair();
        a.interact(board, tile(3), TileColor::Blue, &[], Instant::now());
        let (outcome, out) = a.interact(board, tile(3), TileColor::Red, &[], Instant::now());
        assert_eq!(outcome, InteractOutcome::Applied);
        assert_eq!(requests(&out), 0);
        assert!(out.outgoing.iter().all(|o| matches!(
            o.message,
            SyncMessage::TileState { .. }
        )));
        assert_eq!(a.board(board).unwrap().tile(tile(3)).version(), (1, 2));
    }

    #[test]
    fn remote_request_is_granted_then_painted() {
        let (mut a, mut b, board) = pair();
        let now = Instant::now();
        let (outcome, out) = b.interact(board, tile(4), TileColor::Red, &[a.local()], now);
        assert!(matches!(outcome, InteractOutcome::Requested { authority, .. } if authority == a.local()));
        assert!(matches!(
            b.ownership(board, tile(4)),
            Some(TileOwnership::PendingLocal(_))
        ));

        let request = out.outgoing.into_iter().next().unwrap();
        assert_eq!(request.to, Recipients::One(a.local()));
        let reply = a.handle(b.local(), request.message);
        assert_eq!(
            a.ownership(board, tile(4)),
            Some(TileOwnership::OwnedRemotely(b.local()))
        );

        let grant = reply
            .outgoing
            .into_iter()
            .find(|o| o.to == Recipients::One(b.local()))
            .unwrap();
        let painted = b.handle(a.local(), grant.message);
        assert_eq!(b.ownership(board, tile(4)), Some(TileOwnership::OwnedLocally));
        assert_eq!(
            b.board(board).unwrap().tile(tile(4)).color,
            Some(TileColor::Red)
        );

        // The write replicates back to the custodian.
        for o in painted.outgoing {
            a.handle(b.local(), o.message);
        }
        assert_eq!(
            a.board(board).unwrap().tile(tile(4)).color,
            Some(TileColor::Red)
        );
    }

    #[test]
    fn concurrent_requests_only_one_wins() {
        let (mut a, mut b, board) = pair();
        let c_handle = PeerHandle::random();
        let mut c = service(c_handle);
        c.handle(a.local(), a.snapshot());
        let now = Instant::now();

        let (_, out_b) = b.interact(board, tile(1), TileColor::Blue, &[a.local()], now);
        let (_, out_c) = c.interact(board, tile(1), TileColor::Red, &[a.local()], now);

        let reply_b = a.handle(b.local(), out_b.outgoing[0].message.clone());
        let reply_c = a.handle(c.local(), out_c.outgoing[0].message.clone());

        assert!(reply_b.outgoing.iter().any(|o| matches!(
            o.message,
            SyncMessage::OwnershipGranted { .. }
        )));
        let denial = reply_c
            .outgoing
            .iter()
            .find(|o| o.to == Recipients::One(c.local()))
            .unwrap();
        assert!(matches!(
            denial.message,
            SyncMessage::OwnershipDenied { owner: Some(owner), .. } if owner == b.local()
        ));

        c.handle(a.local(), denial.message.clone());
        let c_tile = c.board(board).unwrap().tile(tile(1));
        assert_eq!(c_tile.color, None);
        assert_eq!(c_tile.owner, Some(b.local()));
        assert_eq!(c.pending_requests(), 0);
    }

    #[test]
    fn redundant_request_does_not_bump_generation() {
        let (mut a, b, board) = pair();
        let req = SyncMessage::RequestOwnership {
            board,
            tile: tile(2),
            request: RequestId(0),
            observed_generation: 0,
        };
        a.handle(b.local(), req);
        let generation = a.board(board).unwrap().tile(tile(2)).generation;

        let again = SyncMessage::RequestOwnership {
            board,
            tile: tile(2),
            request: RequestId(1),
            observed_generation: generation,
        };
        let out = a.handle(b.local(), again);
        assert!(out.outgoing.iter().any(|o| matches!(
            o.message,
            SyncMessage::OwnershipGranted { generation: g, .. } if g == generation
        )));
        assert_eq!(a.board(board).unwrap().tile(tile(2)).generation, generation);
    }

    #[test]
    fn manual_mode_keeps_owned_tiles() {
        let (_, b, board) = pair();
        let local = PeerHandle::random();
        let mut owner = SyncService::new(
            local,
            OwnershipTransferMode::Manual,
            OwnershipTracker::new(Duration::from_secs(3)),
        );
        owner.handle(b.local(), b.snapshot());
        // Make `owner` hold tile 5 at generation 1.
        owner.handle(
            b.local(),
            SyncMessage::TileState {
                board,
                tile: TileSnapshot {
                    index: tile(5),
                    owner: Some(local),
                    color: Some(TileColor::Blue),
                    generation: 1,
                    revision: 1,
                },
            },
        );
        let out = owner.handle(
            b.local(),
            SyncMessage::RequestOwnership {
                board,
                tile: tile(5),
                request: RequestId(9),
                observed_generation: 1,
            },
        );
        assert!(matches!(
            out.outgoing[0].message,
            SyncMessage::OwnershipDenied { .. }
        ));
        assert_eq!(owner.ownership(board, tile(5)), Some(TileOwnership::OwnedLocally));
    }

    #[test]
    fn timeout_resolves_to_denial_without_paint() {
        let (a, mut b, board) = pair();
        let start = Instant::now();
        b.interact(board, tile(6), TileColor::Red, &[a.local()], start);
        b.tick(start + Duration::from_secs(4));
        assert_eq!(b.pending_requests(), 0);
        assert_eq!(b.ownership(board, tile(6)), Some(TileOwnership::Unowned));
        assert_eq!(b.board(board).unwrap().tile(tile(6)).color, None);
    }

    #[test]
    fn unreachable_authority_is_an_immediate_denial() {
        let (_a, mut b, board) = pair();
        let (outcome, out) = b.interact(board, tile(0), TileColor::Red, &[], Instant::now());
        assert_eq!(outcome, InteractOutcome::Denied);
        assert!(out.outgoing.is_empty());
    }

    #[test]
    fn departure_reverts_tiles_and_passes_custody() {
        let (mut a, mut b, board) = pair();
        let c = PeerHandle::random();
        // b owns tile 8 as seen by a.
        let req = SyncMessage::RequestOwnership {
            board,
            tile: tile(8),
            request: RequestId(0),
            observed_generation: 0,
        };
        let b_handle = b.local();
        let grant = a.handle(b_handle, req);
        for o in grant.outgoing.into_iter().filter(|o| o.to == Recipients::One(b_handle)) {
            b.handle(a.local(), o.message);
        }

        let out = a.on_peer_left(b.local(), &[c]);
        assert_eq!(a.ownership(board, tile(8)), Some(TileOwnership::Unowned));
        assert_eq!(a.board(board).unwrap().tile(tile(8)).generation, 2);
        assert_eq!(out.effects.len(), 1);
        // Survivors exchange snapshots before the freed tile is handed out.
        assert_eq!(out.outgoing.len(), 1);
        assert_eq!(out.outgoing[0].to, Recipients::AllExcept(None));
        assert!(matches!(out.outgoing[0].message, SyncMessage::Snapshot { .. }));
        assert!(a.is_unsettled(board, tile(8)));

        // The custodian itself leaves from b's point of view.
        b.on_peer_left(a.local(), &[c]);
        let expected = std::cmp::min(b.local(), c);
        assert_eq!(b.board(board).unwrap().custodian, expected);
    }

    #[test]
    fn freed_tile_waits_for_survivors_before_granting() {
        let (mut a, mut b, board) = pair();
        let c = PeerHandle::random();
        a.on_peer_joined(b.local());
        a.on_peer_joined(c);
        let b_handle = b.local();
        let grant = a.handle(
            b_handle,
            SyncMessage::RequestOwnership {
                board,
                tile: tile(8),
                request: RequestId(0),
                observed_generation: 0,
            },
        );
        for o in grant.outgoing.into_iter().filter(|o| o.to == Recipients::One(b_handle)) {
            b.handle(a.local(), o.message);
        }

        // b handed the tile to c and left before a heard about it.
        a.on_peer_left(b_handle, &[c]);
        let (outcome, _) = a.interact(board, tile(8), TileColor::Blue, &[c], Instant::now());
        assert_eq!(outcome, InteractOutcome::Denied);
        let reply = a.handle(
            c,
            SyncMessage::RequestOwnership {
                board,
                tile: tile(8),
                request: RequestId(0),
                observed_generation: 2,
            },
        );
        assert!(matches!(
            reply.outgoing[0].message,
            SyncMessage::OwnershipDenied { .. }
        ));

        // c's snapshot re-asserts its token and releases the hold.
        let mut snap = a.board(board).unwrap().snapshot();
        snap.tiles[8] = TileSnapshot {
            index: tile(8),
            owner: Some(c),
            color: Some(TileColor::Red),
            generation: 2,
            revision: 1,
        };
        a.handle(c, SyncMessage::Snapshot { boards: vec![snap] });
        assert!(!a.is_unsettled(board, tile(8)));
        assert_eq!(a.ownership(board, tile(8)), Some(TileOwnership::OwnedRemotely(c)));
        let (outcome, _) = a.interact(board, tile(8), TileColor::Blue, &[c], Instant::now());
        assert!(matches!(outcome, InteractOutcome::Requested { authority, .. } if authority == c));
    }

    /// Split `a` and `b` apart and reconnect them, exchanging join snapshots.
    fn split_and_rejoin(
        a: &mut SyncService,
        b: &mut SyncService,
        between: impl FnOnce(&mut SyncService, &mut SyncService),
    ) {
        a.on_peer_left(b.local(), &[]);
        b.on_peer_left(a.local(), &[]);
        between(a, b);
        a.on_peer_joined(b.local());
        b.on_peer_joined(a.local());
        let (snap_a, snap_b) = (a.snapshot(), b.snapshot());
        a.handle(b.local(), snap_b);
        b.handle(a.local(), snap_a);
    }

    #[test]
    fn rejoined_peers_agree_on_one_custodian() {
        let (mut a, mut b, board) = pair();
        a.on_peer_joined(b.local());
        b.on_peer_joined(a.local());
        split_and_rejoin(&mut a, &mut b, |a, b| {
            assert_eq!(a.board(board).unwrap().custodian, a.local());
            assert_eq!(b.board(board).unwrap().custodian, b.local());
        });

        let expected = a.local().min(b.local());
        assert_eq!(a.board(board).unwrap().custodian, expected);
        assert_eq!(b.board(board).unwrap().custodian, expected);

        // Both go for the same tile; only the custodian gets it.
        let now = Instant::now();
        let (a_handle, b_handle) = (a.local(), b.local());
        let (outcome_a, out_a) = a.interact(board, tile(4), TileColor::Blue, &[b_handle], now);
        let (outcome_b, out_b) = b.interact(board, tile(4), TileColor::Red, &[a_handle], now);
        let (mut custodian, mut other, from_custodian, from_other) = if expected == a_handle {
            assert_eq!(outcome_a, InteractOutcome::Applied);
            assert!(matches!(outcome_b, InteractOutcome::Requested { .. }));
            (a, b, out_a, out_b)
        } else {
            assert_eq!(outcome_b, InteractOutcome::Applied);
            assert!(matches!(outcome_a, InteractOutcome::Requested { .. }));
            (b, a, out_b, out_a)
        };

        for o in from_custodian.outgoing {
            other.handle(custodian.local(), o.message);
        }
        for o in from_other.outgoing {
            let reply = custodian.handle(other.local(), o.message);
            for r in reply.outgoing {
                other.handle(custodian.local(), r.message);
            }
        }
        assert_eq!(custodian.ownership(board, tile(4)), Some(TileOwnership::OwnedLocally));
        assert_eq!(
            other.ownership(board, tile(4)),
            Some(TileOwnership::OwnedRemotely(custodian.local()))
        );
        assert_eq!(other.pending_requests(), 0);
    }

    #[test]
    fn writes_made_while_split_converge_after_rejoin() {
        let (mut a, mut b, board) = pair();
        a.on_peer_joined(b.local());
        b.on_peer_joined(a.local());
        split_and_rejoin(&mut a, &mut b, |a, b| {
            let now = Instant::now();
            let (outcome_a, _) = a.interact(board, tile(4), TileColor::Blue, &[], now);
            let (outcome_b, _) = b.interact(board, tile(4), TileColor::Red, &[], now);
            assert_eq!(outcome_a, InteractOutcome::Applied);
            assert_eq!(outcome_b, InteractOutcome::Applied);
        });

        let on_a = *a.board(board).unwrap().tile(tile(4));
        let on_b = *b.board(board).unwrap().tile(tile(4));
        assert_eq!(on_a, on_b);
        let owned = [&a, &b]
            .iter()
            .filter(|s| s.ownership(board, tile(4)) == Some(TileOwnership::OwnedLocally))
            .count();
        assert_eq!(owned, 1);
    }

    #[test]
    fn snapshot_brings_late_joiner_up_to_date() {
        let (mut a, _b, board) = pair();
        a.interact(board, tile(4), TileColor::Blue, &[], Instant::now());
        let mut late = service(PeerHandle::random());
        let out = late.handle(a.local(), a.snapshot());

        assert_eq!(late.board_count(), 1);
        assert!(out.effects.contains(&SceneEffect::BoardAdded {
            board,
            pose: Pose::IDENTITY
        }));
        assert_eq!(
            late.board(board).unwrap().tile(tile(4)).color,
            Some(TileColor::Blue)
        );
    }

    #[test]
    fn clearing_removes_boards_everywhere() {
        let (mut a, mut b, board) = pair();
        let out = a.remove_all_boards();
        assert_eq!(a.board_count(), 0);
        for o in out.outgoing {
            b.handle(a.local(), o.message);
        }
        assert!(b.board(board).is_none());
    }
}
