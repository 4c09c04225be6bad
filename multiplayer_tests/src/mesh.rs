// Deterministic in-memory network of coordinators.
//
// Every participant is a real `Coordinator<MeshTransport>`. Sends land in the
// transport's outbox; `Mesh` moves them into one FIFO queue per ordered pair
// of nodes, mirroring the per-link ordering of the TCP transport. Nothing is
// delivered until the test says so (`deliver`, `deliver_all`, `settle`), so
// interleavings such as "both requests reach the custodian before either
// grant comes back" are written out step by step.
//
// Handshakes are instantaneous: `connect` runs discovery and admission on
// both sides and, if both accept, joins them. Time only moves with
// `advance`, which also ticks every coordinator.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::debug;
use xoxo_protocol::{BoardId, PeerHandle, Pose, SessionId, SyncMessage, TileColor, TileIndex};
use xoxo_session::board::SharedTile;
use xoxo_session::coordinator::TapTarget;
use xoxo_session::ownership::TileOwnership;
use xoxo_session::sync::InteractOutcome;
use xoxo_session::{Coordinator, NodeConfig, SendMode, Transport, TransportError, TransportEvent};

use crate::SceneLog;

/// A message in flight between two mesh nodes.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    Data(Vec<u8>),
    Sync(SyncMessage),
}

/// `Transport` whose sends are collected for the `Mesh` to route.
pub struct MeshTransport {
    local: PeerHandle,
    connected: Vec<PeerHandle>,
    decisions: Vec<(PeerHandle, bool)>,
    outbox: Vec<(PeerHandle, Packet)>,
}

impl MeshTransport {
    fn new() -> Self {
        Self {
            local: PeerHandle::random(),
            connected: Vec::new(),
            decisions: Vec::new(),
            outbox: Vec::new(),
        }
    }

    fn queue(&mut self, peers: &[PeerHandle], packet: &Packet) -> Result<(), TransportError> {
        let mut result = Ok(());
        for &peer in peers {
            if self.connected.contains(&peer) {
                self.outbox.push((peer, packet.clone()));
            } else {
                result = Err(TransportError::NotConnected(peer));
            }
        }
        result
    }
}

impl Transport for MeshTransport {
    fn local_peer(&self) -> PeerHandle {
        self.local
    }

    fn connected_peers(&self) -> Vec<PeerHandle> {
        self.connected.clone()
    }

    fn pending_admissions(&self) -> usize {
        0
    }

    fn admit(&mut self, peer: PeerHandle, accept: bool) {
        self.decisions.push((peer, accept));
    }

    fn send(
        &mut self,
        payload: &[u8],
        peers: &[PeerHandle],
        _mode: SendMode,
    ) -> Result<(), TransportError> {
        self.queue(peers, &Packet::Data(payload.to_vec()))
    }

    fn send_sync(
        &mut self,
        message: &SyncMessage,
        peers: &[PeerHandle],
    ) -> Result<(), TransportError> {
        self.queue(peers, &Packet::Sync(message.clone()))
    }
}

struct MeshNode {
    coordinator: Coordinator<MeshTransport>,
    log: SceneLog,
    online: bool,
}

pub struct Mesh {
    nodes: Vec<MeshNode>,
    links: BTreeMap<(usize, usize), VecDeque<Packet>>,
    config: NodeConfig,
    now: Instant,
}

impl Mesh {
    pub fn new(count: usize) -> Self {
        Self::with_config(count, NodeConfig::default())
    }

    pub fn with_config(count: usize, config: NodeConfig) -> Self {
        let mut mesh = Self {
            nodes: Vec::new(),
            links: BTreeMap::new(),
            config,
            now: Instant::now(),
        };
        for _ in 0..count {
            mesh.add_node();
        }
        mesh
    }

    /// Add an unconnected participant. Returns its index.
    pub fn add_node(&mut self) -> usize {
        let log = SceneLog::default();
        let coordinator =
            Coordinator::new(MeshTransport::new(), &self.config, Box::new(log.clone()));
        self.nodes.push(MeshNode {
            coordinator,
            log,
            online: true,
        });
        self.nodes.len() - 1
    }

    pub fn peer(&self, i: usize) -> PeerHandle {
        self.nodes[i].coordinator.local_peer()
    }

    pub fn coordinator(&self, i: usize) -> &Coordinator<MeshTransport> {
        &self.nodes[i].coordinator
    }

    pub fn log(&self, i: usize) -> &SceneLog {
        &self.nodes[i].log
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn connected(&self, i: usize) -> Vec<PeerHandle> {
        self.nodes[i].coordinator.transport().connected_peers()
    }

    // -----------------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------------

    /// Run discovery and admission on both sides. Joins the pair and returns
    /// true only if both accepted.
    pub fn connect(&mut self, a: usize, b: usize) -> bool {
        let (pa, pb) = (self.peer(a), self.peer(b));
        let accept_a = self.discover(a, pb);
        let accept_b = self.discover(b, pa);
        if !(accept_a && accept_b) {
            debug!("[MESH] {a} <-> {b} refused ({accept_a}, {accept_b})");
            return false;
        }
        self.nodes[a].coordinator.transport_mut().connected.push(pb);
        self.nodes[b].coordinator.transport_mut().connected.push(pa);
        self.event(a, TransportEvent::PeerJoined(pb));
        self.event(b, TransportEvent::PeerJoined(pa));
        true
    }

    fn discover(&mut self, at: usize, peer: PeerHandle) -> bool {
        self.event(
            at,
            TransportEvent::PeerDiscovered {
                peer,
                display_name: format!("peer-{peer}"),
            },
        );
        self.nodes[at]
            .coordinator
            .transport_mut()
            .decisions
            .pop()
            .is_some_and(|(p, accept)| p == peer && accept)
    }

    /// Take node `i` off the network. Every peer sees it leave, and anything
    /// still queued to or from it is lost.
    pub fn disconnect(&mut self, i: usize) {
        let gone = self.peer(i);
        self.nodes[i].online = false;
        self.nodes[i].coordinator.transport_mut().connected.clear();
        self.links.retain(|(from, to), _| *from != i && *to != i);
        for j in 0..self.nodes.len() {
            let transport = self.nodes[j].coordinator.transport_mut();
            if transport.connected.contains(&gone) {
                transport.connected.retain(|p| *p != gone);
                self.event(j, TransportEvent::PeerLeft(gone));
            }
        }
    }

    /// Cut the link between `a` and `b` while both stay online. Packets
    /// queued between them are lost; a later `connect` rejoins them.
    pub fn split(&mut self, a: usize, b: usize) {
        self.links.retain(|key, _| *key != (a, b) && *key != (b, a));
        for (at, other) in [(a, b), (b, a)] {
            let gone = self.peer(other);
            let transport = self.nodes[at].coordinator.transport_mut();
            if transport.connected.contains(&gone) {
                transport.connected.retain(|p| *p != gone);
                self.event(at, TransportEvent::PeerLeft(gone));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    pub fn queued(&self, from: usize, to: usize) -> Vec<Packet> {
        self.links
            .get(&(from, to))
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver the oldest packet from `from` to `to`. Returns false if none.
    pub fn deliver(&mut self, from: usize, to: usize) -> bool {
        let Some(packet) = self.links.get_mut(&(from, to)).and_then(VecDeque::pop_front) else {
            return false;
        };
        let peer = self.peer(from);
        debug!("[MESH] {from} -> {to}: {packet:?}");
        let event = match packet {
            Packet::Data(payload) => TransportEvent::DataReceived { peer, payload },
            Packet::Sync(message) => TransportEvent::SyncReceived { peer, message },
        };
        self.event(to, event);
        true
    }

    pub fn deliver_all(&mut self, from: usize, to: usize) {
        while self.deliver(from, to) {}
    }

    /// Deliver everything, round-robin over links, until the network is
    /// quiet.
    pub fn settle(&mut self) {
        for _ in 0..10_000 {
            let busy: Vec<(usize, usize)> = self
                .links
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| *k)
                .collect();
            if busy.is_empty() {
                return;
            }
            for (from, to) in busy {
                self.deliver(from, to);
            }
        }
        panic!("mesh did not settle");
    }

    /// Move the clock forward and tick every coordinator.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        let now = self.now;
        for i in 0..self.nodes.len() {
            if self.nodes[i].online {
                self.nodes[i].coordinator.tick(now);
                self.collect(i);
            }
        }
    }

    fn event(&mut self, at: usize, event: TransportEvent) {
        if !self.nodes[at].online {
            return;
        }
        self.nodes[at].coordinator.handle_event(event);
        self.collect(at);
    }

    fn collect(&mut self, from: usize) {
        let outbox = std::mem::take(&mut self.nodes[from].coordinator.transport_mut().outbox);
        for (peer, packet) in outbox {
            match self.index_of(peer) {
                Some(to) if self.nodes[to].online => {
                    self.links.entry((from, to)).or_default().push_back(packet);
                }
                _ => debug!("[MESH] dropping packet for offline {peer}"),
            }
        }
    }

    fn index_of(&self, peer: PeerHandle) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.coordinator.local_peer() == peer)
    }

    // -----------------------------------------------------------------------
    // Local actions
    // -----------------------------------------------------------------------

    pub fn place_board(&mut self, i: usize, pose: Pose) -> BoardId {
        let id = self.nodes[i].coordinator.place_board(pose);
        self.collect(i);
        id
    }

    pub fn interact(
        &mut self,
        i: usize,
        board: BoardId,
        tile: TileIndex,
        color: TileColor,
    ) -> InteractOutcome {
        let now = self.now;
        let outcome = self.nodes[i].coordinator.interact(board, tile, color, now);
        self.collect(i);
        outcome
    }

    pub fn tap(&mut self, i: usize, target: TapTarget) {
        let now = self.now;
        self.nodes[i].coordinator.tap(target, now);
        self.collect(i);
    }

    pub fn select_color(&mut self, i: usize, color: TileColor) {
        self.nodes[i].coordinator.select_color(color);
    }

    pub fn clear_boards(&mut self, i: usize) {
        self.nodes[i].coordinator.clear_boards();
        self.collect(i);
    }

    pub fn replace_session_id(&mut self, i: usize, id: SessionId) {
        self.nodes[i].coordinator.replace_session_id(id);
        self.collect(i);
    }

    pub fn participant_anchor_added(&mut self, i: usize, id: SessionId) {
        self.nodes[i].coordinator.participant_anchor_added(id);
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn tile(&self, i: usize, board: BoardId, tile: TileIndex) -> Option<SharedTile> {
        self.nodes[i]
            .coordinator
            .sync()
            .board(board)
            .map(|b| *b.tile(tile))
    }

    pub fn ownership(&self, i: usize, board: BoardId, tile: TileIndex) -> Option<TileOwnership> {
        self.nodes[i].coordinator.sync().ownership(board, tile)
    }

    /// Online nodes that believe they hold the token for `tile`.
    pub fn owners(&self, board: BoardId, tile: TileIndex) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].online)
            .filter(|&i| self.ownership(i, board, tile) == Some(TileOwnership::OwnedLocally))
            .collect()
    }
}
