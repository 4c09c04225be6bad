// Session coordinator: policy glue between transport, registry and sync.
//
// `Coordinator` is the single consumer of `TransportEvent`s and app
// commands. It owns the peer registry, the sync service and the local
// session id, and it is generic over `Transport` so tests can drive it with
// an in-memory link layer. Nothing in here blocks or spawns threads; the node
// loop (`node.rs`) calls into it one event at a time.
//
// Policy, in event order:
// - discovered: admit while `connected + pending <= max_peers - 1`.
// - joined: announce our `SessionID:` to the new peer before anything else,
//   then send it a board snapshot so a late joiner sees existing boards.
// - left: drop the registry entry, then let the sync service deny the
//   peer's in-flight requests and revert its tiles.
// - data: `SessionID:<uuid>` from a connected peer updates the registry;
//   anything else is dropped.
//
// Status text mirrors what the player sees on screen. Every change goes to
// `SceneHooks::status_changed` and is kept in `status()`.

use std::time::Instant;

use tracing::{debug, info, warn};
use xoxo_protocol::{AppMessage, BoardId, PeerHandle, Pose, SessionId, TileColor, TileIndex};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::hooks::SceneHooks;
use crate::ownership::OwnershipTracker;
use crate::registry::PeerRegistry;
use crate::sync::{InteractOutcome, Outgoing, Recipients, SceneEffect, SyncOutput, SyncService};
use crate::transport::{SendMode, Transport, TransportEvent};

pub const STATUS_WAITING: &str = "Waiting for peers...";
pub const STATUS_DISCOVERED: &str = "Peer discovered!";
pub const STATUS_MAX_CONNECTIONS: &str = "[WARNING] Max connections reached!";
pub const STATUS_HOLD_TOGETHER: &str = "Hold phones together...";
pub const STATUS_LEFT: &str = "Peer left!";
pub const STATUS_CONNECTED: &str = "Peer connected!";
pub const STATUS_NO_SURFACE: &str = "[WARNING] No surface detected!";
pub const STATUS_CLEARED: &str = "All anchors removed!";

/// What a screen tap resolved to in the rendering layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TapTarget {
    Tile { board: BoardId, tile: TileIndex },
    /// A detected horizontal surface at this pose.
    Surface(Pose),
    Nothing,
}

pub struct Coordinator<T: Transport> {
    transport: T,
    registry: PeerRegistry,
    sync: SyncService,
    session_id: SessionId,
    selected_color: TileColor,
    max_peers: usize,
    hooks: Box<dyn SceneHooks>,
    status: String,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, config: &NodeConfig, hooks: Box<dyn SceneHooks>) -> Self {
        let local = transport.local_peer();
        let sync = SyncService::new(
            local,
            config.transfer_mode,
            OwnershipTracker::new(config.ownership_timeout()),
        );
        let mut coordinator = Self {
            transport,
            registry: PeerRegistry::new(),
            sync,
            session_id: SessionId::random(),
            selected_color: TileColor::default(),
            max_peers: config.max_peers,
            hooks,
            status: String::new(),
        };
        coordinator.set_status(STATUS_WAITING);
        coordinator
    }

    pub fn local_peer(&self) -> PeerHandle {
        self.transport.local_peer()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn selected_color(&self) -> TileColor {
        self.selected_color
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer, display_name } => {
                debug!("[SESSION] discovered {peer} ({display_name})");
                let accept = self.on_peer_discovered(peer);
                self.transport.admit(peer, accept);
            }
            TransportEvent::PeerJoined(peer) => self.on_peer_joined(peer),
            TransportEvent::PeerLeft(peer) => self.on_peer_left(peer),
            TransportEvent::DataReceived { peer, payload } => self.on_data(peer, &payload),
            TransportEvent::SyncReceived { peer, message } => {
                let out = self.sync.handle(peer, message);
                self.dispatch(out);
            }
            TransportEvent::DeliveryFailed { peer } => {
                warn!("[SESSION] delivery to {peer} failed");
            }
        }
    }

    /// Admission decision for a newly discovered peer.
    pub fn on_peer_discovered(&mut self, peer: PeerHandle) -> bool {
        self.set_status(STATUS_DISCOVERED);
        let in_use = self.transport.connected_peers().len() + self.transport.pending_admissions();
        let accept = in_use < self.max_peers;
        if !accept {
            info!("[SESSION] declining {peer}: {in_use} of {} slots in use", self.max_peers);
            self.set_status(STATUS_MAX_CONNECTIONS);
        }
        accept
    }

    pub fn on_peer_joined(&mut self, peer: PeerHandle) {
        info!("[SESSION] {peer} joined");
        self.set_status(STATUS_HOLD_TOGETHER);
        self.registry.on_peer_joined(peer);
        self.sync.on_peer_joined(peer);

        let announce = AppMessage::SessionId(self.session_id).encode();
        if let Err(e) = self.transport.send(&announce, &[peer], SendMode::Reliable) {
            warn!("[SESSION] session id to {peer} failed: {e}");
        }
        let snapshot = self.sync.snapshot();
        if let Err(e) = self.transport.send_sync(&snapshot, &[peer]) {
            warn!("[SESSION] snapshot to {peer} failed: {e}");
        }
    }

    pub fn on_peer_left(&mut self, peer: PeerHandle) {
        info!("[SESSION] {peer} left");
        self.registry.on_peer_left(peer);
        self.set_status(STATUS_LEFT);
        let remaining = self.transport.connected_peers();
        let out = self.sync.on_peer_left(peer, &remaining);
        self.dispatch(out);
    }

    pub fn on_data(&mut self, peer: PeerHandle, payload: &[u8]) {
        match AppMessage::decode(payload) {
            Some(AppMessage::SessionId(id)) => {
                if !self.transport.connected_peers().contains(&peer) {
                    debug!("[SESSION] ignoring session id from unconnected {peer}");
                    return;
                }
                self.registry.on_session_id_announced(peer, id);
            }
            None => debug!(
                "[SESSION] dropping {}-byte payload from {peer}",
                payload.len()
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Local commands
    // -----------------------------------------------------------------------

    /// Adopt a new local session id and announce it to every connected peer.
    pub fn replace_session_id(&mut self, session_id: SessionId) {
        if session_id == self.session_id {
            return;
        }
        info!("[SESSION] local session id is now {session_id}");
        self.session_id = session_id;
        let peers = self.transport.connected_peers();
        if peers.is_empty() {
            return;
        }
        let announce = AppMessage::SessionId(session_id).encode();
        if let Err(e) = self.transport.send(&announce, &peers, SendMode::Reliable) {
            warn!("[SESSION] session id broadcast failed: {e}");
        }
    }

    pub fn regenerate_session_id(&mut self) -> SessionId {
        let id = SessionId::random();
        self.replace_session_id(id);
        id
    }

    /// The tracking layer found another participant's anchor.
    pub fn participant_anchor_added(&mut self, session_id: SessionId) {
        self.set_status(STATUS_CONNECTED);
        let peer = self.registry.peer_for_session(session_id);
        if peer.is_none() {
            debug!("[SESSION] participant anchor for unknown session {session_id}");
        }
        self.hooks.add_participant_anchor(session_id, peer);
    }

    pub fn select_color(&mut self, color: TileColor) {
        self.selected_color = color;
    }

    pub fn tap(&mut self, target: TapTarget, now: Instant) {
        match target {
            TapTarget::Tile { board, tile } => {
                let color = self.selected_color;
                self.interact(board, tile, color, now);
            }
            TapTarget::Surface(pose) => {
                self.place_board(pose);
            }
            TapTarget::Nothing => self.set_status(STATUS_NO_SURFACE),
        }
    }

    pub fn interact(
        &mut self,
        board: BoardId,
        tile: TileIndex,
        color: TileColor,
        now: Instant,
    ) -> InteractOutcome {
        let connected = self.transport.connected_peers();
        let (outcome, out) = self.sync.interact(board, tile, color, &connected, now);
        if let InteractOutcome::Requested { request, authority } = outcome {
            // The request is the only outgoing message; if it cannot be
            // queued the authority will never answer.
            let failed = out
                .outgoing
                .iter()
                .any(|o| self.send_outgoing(o).is_err());
            self.apply_effects(out.effects);
            if failed {
                warn!("[SESSION] ownership request to {authority} not sent");
                self.sync.abandon_request(board, tile, request);
                return InteractOutcome::Denied;
            }
            return outcome;
        }
        self.dispatch(out);
        outcome
    }

    pub fn place_board(&mut self, pose: Pose) -> BoardId {
        let (id, out) = self.sync.place_board(pose);
        self.dispatch(out);
        id
    }

    pub fn clear_boards(&mut self) {
        let out = self.sync.remove_all_boards();
        self.dispatch(out);
        self.set_status(STATUS_CLEARED);
    }

    pub fn tick(&mut self, now: Instant) {
        self.sync.tick(now);
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    fn set_status(&mut self, status: &str) {
        info!("[STATUS] {status}");
        self.status.clear();
        self.status.push_str(status);
        self.hooks.status_changed(status);
    }

    fn dispatch(&mut self, out: SyncOutput) {
        for o in &out.outgoing {
            if let Err(e) = self.send_outgoing(o) {
                warn!("[SESSION] sync send failed: {e}");
            }
        }
        self.apply_effects(out.effects);
    }

    fn send_outgoing(&mut self, outgoing: &Outgoing) -> Result<(), TransportError> {
        let peers = match outgoing.to {
            Recipients::One(peer) => vec![peer],
            Recipients::AllExcept(except) => {
                let mut peers = self.transport.connected_peers();
                peers.retain(|p| Some(*p) != except);
                peers
            }
        };
        if peers.is_empty() {
            return Ok(());
        }
        self.transport.send_sync(&outgoing.message, &peers)
    }

    fn apply_effects(&mut self, effects: Vec<SceneEffect>) {
        for effect in effects {
            match effect {
                SceneEffect::BoardAdded { board, pose } => self.hooks.board_added(board, pose),
                SceneEffect::BoardRemoved { board } => self.hooks.board_removed(board),
                SceneEffect::TileChanged { board, tile } => self.hooks.tile_changed(board, &tile),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use xoxo_protocol::SyncMessage;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        Data(Vec<u8>),
        Sync(SyncMessage),
    }

    #[derive(Default)]
    struct MockTransport {
        local: Option<PeerHandle>,
        connected: Vec<PeerHandle>,
        pending: usize,
        admitted: Vec<(PeerHandle, bool)>,
        sent: Vec<(PeerHandle, Sent)>,
        fail_sync: bool,
    }

    impl Transport for MockTransport {
        fn local_peer(&self) -> PeerHandle {
            self.local.unwrap()
        }

        fn connected_peers(&self) -> Vec<PeerHandle> {
            self.connected.clone()
        }

        fn pending_admissions(&self) -> usize {
            self.pending
        }

        fn admit(&mut self, peer: PeerHandle, accept: bool) {
            self.admitted.push((peer, accept));
        }

        fn send(
            &mut self,
            payload: &[u8],
            peers: &[PeerHandle],
            _mode: SendMode,
        ) -> Result<(), TransportError> {
            for p in peers {
                self.sent.push((*p, Sent::Data(payload.to_vec())));
            }
            Ok(())
        }

        fn send_sync(
            &mut self,
            message: &SyncMessage,
            peers: &[PeerHandle],
        ) -> Result<(), TransportError> {
            if self.fail_sync {
                return Err(TransportError::LinkClosed(peers[0]));
            }
            for p in peers {
                self.sent.push((*p, Sent::Sync(message.clone())));
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl SceneHooks for Recorder {
        fn status_changed(&mut self, status: &str) {
            self.0.lock().unwrap().push(status.to_string());
        }

        fn add_participant_anchor(&mut self, session: SessionId, peer: Option<PeerHandle>) {
            self.0
                .lock()
                .unwrap()
                .push(format!("anchor {session} {}", peer.is_some()));
        }

        fn board_added(&mut self, board: BoardId, _pose: Pose) {
            self.0.lock().unwrap().push(format!("board {board}"));
        }
    }

    fn coordinator(max_peers: usize) -> (Coordinator<MockTransport>, Recorder) {
        let transport = MockTransport {
            local: Some(PeerHandle::random()),
            ..MockTransport::default()
        };
        let config = NodeConfig {
            max_peers,
            ..NodeConfig::default()
        };
        let recorder = Recorder::default();
        let c = Coordinator::new(transport, &config, Box::new(recorder.clone()));
        (c, recorder)
    }

    fn connect(c: &mut Coordinator<MockTransport>, peer: PeerHandle) {
        c.transport_mut().connected.push(peer);
        c.handle_event(TransportEvent::PeerJoined(peer));
    }

    #[test]
    fn starts_waiting() {
        let (c, recorder) = coordinator(3);
        assert_eq!(c.status(), STATUS_WAITING);
        assert_eq!(*recorder.0.lock().unwrap(), vec![STATUS_WAITING.to_string()]);
    }

    #[test]
    fn admission_respects_max_peers() {
        let (mut c, _) = coordinator(2);
        let a = PeerHandle::random();
        let b = PeerHandle::random();
        let d = PeerHandle::random();
        c.transport_mut().connected.push(a);

        c.handle_event(TransportEvent::PeerDiscovered {
            peer: b,
            display_name: "b".into(),
        });
        assert_eq!(c.status(), STATUS_DISCOVERED);
        c.transport_mut().pending = 1;

        c.handle_event(TransportEvent::PeerDiscovered {
            peer: d,
            display_name: "d".into(),
        });
        assert_eq!(c.transport().admitted, vec![(b, true), (d, false)]);
        assert_eq!(c.status(), STATUS_MAX_CONNECTIONS);
    }

    #[test]
    fn joined_peer_gets_session_id_first_exactly_once() {
        let (mut c, recorder) = coordinator(3);
        let peer = PeerHandle::random();
        connect(&mut c, peer);

        let sent = &c.transport().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0],
            (peer, Sent::Data(AppMessage::SessionId(c.session_id()).encode()))
        );
        assert!(matches!(sent[1], (p, Sent::Sync(SyncMessage::Snapshot { .. })) if p == peer));
        assert_eq!(c.status(), STATUS_HOLD_TOGETHER);
        assert!(recorder
            .0
            .lock()
            .unwrap()
            .contains(&STATUS_HOLD_TOGETHER.to_string()));
    }

    #[test]
    fn session_id_announcements_fill_registry() {
        let (mut c, recorder) = coordinator(3);
        let peer = PeerHandle::random();
        let stranger = PeerHandle::random();
        let id = SessionId::random();
        connect(&mut c, peer);

        c.handle_event(TransportEvent::DataReceived {
            peer,
            payload: AppMessage::SessionId(id).encode(),
        });
        c.handle_event(TransportEvent::DataReceived {
            peer: stranger,
            payload: AppMessage::SessionId(SessionId::random()).encode(),
        });
        c.handle_event(TransportEvent::DataReceived {
            peer,
            payload: b"hello".to_vec(),
        });
        assert_eq!(c.registry().session_id(peer), Some(id));
        assert_eq!(c.registry().len(), 1);

        c.participant_anchor_added(id);
        assert_eq!(c.status(), STATUS_CONNECTED);
        assert!(recorder
            .0
            .lock()
            .unwrap()
            .contains(&format!("anchor {id} true")));

        c.transport_mut().connected.clear();
        c.handle_event(TransportEvent::PeerLeft(peer));
        assert_eq!(c.registry().session_id(peer), None);
        assert_eq!(c.status(), STATUS_LEFT);
    }

    #[test]
    fn session_id_change_is_broadcast() {
        let (mut c, _) = coordinator(3);
        let a = PeerHandle::random();
        let b = PeerHandle::random();
        connect(&mut c, a);
        connect(&mut c, b);
        c.transport_mut().sent.clear();

        let id = c.regenerate_session_id();
        let expected = Sent::Data(AppMessage::SessionId(id).encode());
        assert_eq!(
            c.transport().sent,
            vec![(a, expected.clone()), (b, expected)]
        );

        // Same id again is not a change.
        c.transport_mut().sent.clear();
        c.replace_session_id(id);
        assert!(c.transport().sent.is_empty());
    }

    #[test]
    fn taps_place_and_paint() {
        let (mut c, recorder) = coordinator(3);
        let now = Instant::now();
        c.tap(TapTarget::Nothing, now);
        assert_eq!(c.status(), STATUS_NO_SURFACE);

        c.tap(TapTarget::Surface(Pose::at(0.0, -1.0, -0.5)), now);
        assert_eq!(c.sync().board_count(), 1);
        let board = c.sync().boards().next().unwrap().id;
        assert!(recorder.0.lock().unwrap().contains(&format!("board {board}")));

        c.select_color(TileColor::Red);
        let tile = TileIndex::new(4).unwrap();
        c.tap(TapTarget::Tile { board, tile }, now);
        assert_eq!(
            c.sync().board(board).unwrap().tile(tile).color,
            Some(TileColor::Red)
        );

        c.clear_boards();
        assert_eq!(c.sync().board_count(), 0);
        assert_eq!(c.status(), STATUS_CLEARED);
    }

    #[test]
    fn owned_tile_interaction_issues_no_request() {
        let (mut c, _) = coordinator(3);
        let peer = PeerHandle::random();
        connect(&mut c, peer);
        let board = c.place_board(Pose::IDENTITY);
        let tile = TileIndex::new(0).unwrap();
        let now = Instant::now();
        assert_eq!(c.interact(board, tile, TileColor::Blue, now), InteractOutcome::Applied);

        c.transport_mut().sent.clear();
        assert_eq!(c.interact(board, tile, TileColor::Red, now), InteractOutcome::Applied);
        assert!(c.transport().sent.iter().all(|(_, s)| matches!(
            s,
            Sent::Sync(SyncMessage::TileState { .. })
        )));
    }

    #[test]
    fn unsendable_request_is_denied() {
        let (mut c, _) = coordinator(3);
        let creator = PeerHandle::random();
        connect(&mut c, creator);
        let board = BoardId::random();
        c.handle_event(TransportEvent::SyncReceived {
            peer: creator,
            message: SyncMessage::BoardPlaced {
                board,
                creator,
                pose: Pose::IDENTITY,
            },
        });

        c.transport_mut().fail_sync = true;
        let tile = TileIndex::new(2).unwrap();
        let outcome = c.interact(board, tile, TileColor::Blue, Instant::now());
        assert_eq!(outcome, InteractOutcome::Denied);
        assert_eq!(c.sync().pending_requests(), 0);
    }
}
