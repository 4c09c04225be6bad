// Node: one device's session, running on its own thread.
//
// Architecture: a single `mpsc` queue of `NodeEvent`s consumed by the node
// thread, which owns the `Coordinator` and its `TcpTransport`.
//
// - **I/O threads** (listener, dialers, per-link readers and writers; see
//   `tcp.rs`) post `NodeEvent::Wire` through the transport's sink.
// - **The application** posts `NodeEvent::Command` through `NodeHandle`.
// - **Node thread** uses `recv_timeout(tick_interval)`, drains whatever else
//   is queued, then ticks the coordinator (ownership timeouts) and lets the
//   transport browse for configured peers. When nothing arrives the timeout
//   doubles as the timer, so there is no separate timer thread.
//
// After every wire event the loop drains the transport's `TransportEvent`s
// into the coordinator until none are left, since coordinator reactions
// (admit) can produce more.
//
// The status line is the only state shared across threads: `StatusBoard`,
// written from the node thread through the hooks wrapper and read by
// `NodeHandle::status`.
//
// Shutdown: `stop` clears `keep_running` and posts `Shutdown`; the loop says
// goodbye on every link and exits.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use xoxo_protocol::{
    BoardId, BoardSnapshot, PeerHandle, Pose, SessionId, TileColor, TileIndex, TileSnapshot,
};

use crate::board::GameBoard;
use crate::config::NodeConfig;
use crate::coordinator::{Coordinator, TapTarget};
use crate::error::SessionError;
use crate::hooks::SceneHooks;
use crate::sync::InteractOutcome;
use crate::tcp::{TcpTransport, WireEvent, WireSink};
use crate::transport::Transport;

/// How long `NodeHandle` waits for the node thread to answer a query.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Requests from the application to the node thread.
pub enum NodeCommand {
    Tap(TapTarget),
    Interact {
        board: BoardId,
        tile: TileIndex,
        color: TileColor,
        reply: Option<Sender<InteractOutcome>>,
    },
    PlaceBoard {
        pose: Pose,
        reply: Option<Sender<BoardId>>,
    },
    ClearBoards,
    SelectColor(TileColor),
    SetSessionId(SessionId),
    RegenerateSessionId,
    ParticipantAnchorAdded(SessionId),
    Inspect(Sender<NodeView>),
    Shutdown,
}

pub enum NodeEvent {
    Wire(WireEvent),
    Command(NodeCommand),
}

/// Point-in-time copy of a node's session state.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeView {
    pub local_peer: PeerHandle,
    pub session_id: SessionId,
    pub status: String,
    pub selected_color: TileColor,
    pub connected: Vec<PeerHandle>,
    pub registry: Vec<(PeerHandle, SessionId)>,
    pub boards: Vec<BoardSnapshot>,
    pub pending_requests: usize,
}

impl NodeView {
    pub fn tile(&self, board: BoardId, tile: TileIndex) -> Option<TileSnapshot> {
        self.boards
            .iter()
            .find(|b| b.board == board)
            .and_then(|b| b.tiles.iter().find(|t| t.index == tile))
            .copied()
    }

    pub fn session_of(&self, peer: PeerHandle) -> Option<SessionId> {
        self.registry
            .iter()
            .find(|(p, _)| *p == peer)
            .map(|(_, id)| *id)
    }
}

/// The current status line, shared with the presentation layer.
#[derive(Clone, Debug, Default)]
pub struct StatusBoard(Arc<Mutex<String>>);

impl StatusBoard {
    pub fn get(&self) -> String {
        match self.0.lock() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set(&self, status: &str) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.clear();
        guard.push_str(status);
    }
}

/// Keeps `StatusBoard` current, then forwards to the app's hooks.
struct StatusHooks {
    status: StatusBoard,
    inner: Box<dyn SceneHooks>,
}

impl SceneHooks for StatusHooks {
    fn status_changed(&mut self, status: &str) {
        self.status.set(status);
        self.inner.status_changed(status);
    }

    fn board_added(&mut self, board: BoardId, pose: Pose) {
        self.inner.board_added(board, pose);
    }

    fn board_removed(&mut self, board: BoardId) {
        self.inner.board_removed(board);
    }

    fn tile_changed(&mut self, board: BoardId, tile: &TileSnapshot) {
        self.inner.tile_changed(board, tile);
    }

    fn add_participant_anchor(&mut self, session: SessionId, peer: Option<PeerHandle>) {
        self.inner.add_participant_anchor(session, peer);
    }
}

/// Handle returned by `start_node` to drive and stop the node.
pub struct NodeHandle {
    tx: Sender<NodeEvent>,
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    local_peer: PeerHandle,
    local_addr: SocketAddr,
    status: StatusBoard,
}

impl NodeHandle {
    pub fn local_peer(&self) -> PeerHandle {
        self.local_peer
    }

    /// Address the node accepts links on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> String {
        self.status.get()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn command(&self, command: NodeCommand) {
        if self.tx.send(NodeEvent::Command(command)).is_err() {
            warn!("[NODE] command dropped: node thread is gone");
        }
    }

    pub fn tap(&self, target: TapTarget) {
        self.command(NodeCommand::Tap(target));
    }

    pub fn select_color(&self, color: TileColor) {
        self.command(NodeCommand::SelectColor(color));
    }

    pub fn clear_boards(&self) {
        self.command(NodeCommand::ClearBoards);
    }

    pub fn set_session_id(&self, session_id: SessionId) {
        self.command(NodeCommand::SetSessionId(session_id));
    }

    pub fn regenerate_session_id(&self) {
        self.command(NodeCommand::RegenerateSessionId);
    }

    pub fn participant_anchor_added(&self, session_id: SessionId) {
        self.command(NodeCommand::ParticipantAnchorAdded(session_id));
    }

    /// Place a board and wait for its id.
    pub fn place_board(&self, pose: Pose) -> Option<BoardId> {
        let (reply, rx) = mpsc::channel();
        self.command(NodeCommand::PlaceBoard {
            pose,
            reply: Some(reply),
        });
        rx.recv_timeout(REPLY_TIMEOUT).ok()
    }

    /// Paint a tile and wait for the immediate outcome. A `Requested`
    /// outcome resolves later; watch `view()` for the result.
    pub fn interact(
        &self,
        board: BoardId,
        tile: TileIndex,
        color: TileColor,
    ) -> Option<InteractOutcome> {
        let (reply, rx) = mpsc::channel();
        self.command(NodeCommand::Interact {
            board,
            tile,
            color,
            reply: Some(reply),
        });
        rx.recv_timeout(REPLY_TIMEOUT).ok()
    }

    pub fn view(&self) -> Option<NodeView> {
        let (reply, rx) = mpsc::channel();
        self.command(NodeCommand::Inspect(reply));
        rx.recv_timeout(REPLY_TIMEOUT).ok()
    }

    /// Signal the node to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(NodeEvent::Command(NodeCommand::Shutdown));
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }
}

/// Start a node on a background thread. Fails without leaving anything
/// running when the listener cannot be bound or the thread cannot start.
pub fn start_node(
    config: NodeConfig,
    hooks: Box<dyn SceneHooks>,
) -> Result<NodeHandle, SessionError> {
    if config.max_peers == 0 {
        return Err(SessionError::Config("max_peers must be at least 1".into()));
    }

    let (tx, rx): (Sender<NodeEvent>, Receiver<NodeEvent>) = mpsc::channel();
    let tx_wire = tx.clone();
    let sink: WireSink = Arc::new(move |ev| {
        let _ = tx_wire.send(NodeEvent::Wire(ev));
    });

    let transport =
        TcpTransport::start(&config, sink).map_err(SessionError::SyncChannelUnavailable)?;
    let local_peer = transport.local_peer();
    let local_addr = transport.local_addr();

    let status = StatusBoard::default();
    let hooks = Box::new(StatusHooks {
        status: status.clone(),
        inner: hooks,
    });
    let coordinator = Coordinator::new(transport, &config, hooks);

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_node = keep_running.clone();
    let tick = config.tick_interval();
    let thread = thread::Builder::new()
        .name(format!("xoxo-node-{local_peer}"))
        .spawn(move || run_node(coordinator, rx, tick, keep_running_node))
        .map_err(SessionError::SyncChannelUnavailable)?;

    info!("[NODE] {local_peer} started on {local_addr}");
    Ok(NodeHandle {
        tx,
        keep_running,
        thread: Some(thread),
        local_peer,
        local_addr,
        status,
    })
}

/// Main node loop. Runs until `keep_running` is cleared or `Shutdown`
/// arrives.
fn run_node(
    mut coordinator: Coordinator<TcpTransport>,
    rx: Receiver<NodeEvent>,
    tick: Duration,
    keep_running: Arc<AtomicBool>,
) {
    'outer: while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(tick) {
            Ok(event) => {
                if !handle_event(&mut coordinator, event) {
                    break;
                }
                // Drain any additional events that arrived during handling.
                while let Ok(event) = rx.try_recv() {
                    if !handle_event(&mut coordinator, event) {
                        break 'outer;
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        let now = Instant::now();
        coordinator.tick(now);
        coordinator.transport_mut().browse(now);
        drain_transport(&mut coordinator);
    }

    coordinator.transport_mut().shutdown();
    info!("[NODE] {} stopped", coordinator.local_peer());
}

/// Dispatch one event. Returns false on shutdown.
fn handle_event(coordinator: &mut Coordinator<TcpTransport>, event: NodeEvent) -> bool {
    match event {
        NodeEvent::Wire(wire) => {
            coordinator.transport_mut().handle_wire(wire);
        }
        NodeEvent::Command(NodeCommand::Shutdown) => return false,
        NodeEvent::Command(command) => handle_command(coordinator, command),
    }
    drain_transport(coordinator);
    true
}

fn drain_transport(coordinator: &mut Coordinator<TcpTransport>) {
    loop {
        let events = coordinator.transport_mut().take_events();
        if events.is_empty() {
            break;
        }
        for event in events {
            coordinator.handle_event(event);
        }
    }
}

fn handle_command(coordinator: &mut Coordinator<TcpTransport>, command: NodeCommand) {
    let now = Instant::now();
    match command {
        NodeCommand::Tap(target) => coordinator.tap(target, now),
        NodeCommand::Interact {
            board,
            tile,
            color,
            reply,
        } => {
            let outcome = coordinator.interact(board, tile, color, now);
            if let Some(reply) = reply {
                let _ = reply.send(outcome);
            }
        }
        NodeCommand::PlaceBoard { pose, reply } => {
            let id = coordinator.place_board(pose);
            if let Some(reply) = reply {
                let _ = reply.send(id);
            }
        }
        NodeCommand::ClearBoards => coordinator.clear_boards(),
        NodeCommand::SelectColor(color) => coordinator.select_color(color),
        NodeCommand::SetSessionId(id) => coordinator.replace_session_id(id),
        NodeCommand::RegenerateSessionId => {
            coordinator.regenerate_session_id();
        }
        NodeCommand::ParticipantAnchorAdded(id) => coordinator.participant_anchor_added(id),
        NodeCommand::Inspect(reply) => {
            let _ = reply.send(view_of(coordinator));
        }
        NodeCommand::Shutdown => {}
    }
}

fn view_of(coordinator: &Coordinator<TcpTransport>) -> NodeView {
    let registry = coordinator.registry();
    let mut entries: Vec<(PeerHandle, SessionId)> = registry
        .peers()
        .filter_map(|p| registry.session_id(p).map(|id| (p, id)))
        .collect();
    entries.sort();
    NodeView {
        local_peer: coordinator.local_peer(),
        session_id: coordinator.session_id(),
        status: coordinator.status().to_string(),
        selected_color: coordinator.selected_color(),
        connected: coordinator.transport().connected_peers(),
        registry: entries,
        boards: coordinator.sync().boards().map(GameBoard::snapshot).collect(),
        pending_requests: coordinator.sync().pending_requests(),
    }
}
