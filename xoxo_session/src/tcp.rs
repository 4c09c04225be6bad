// TCP implementation of `Transport`.
//
// Architecture: thread-per-link I/O feeding one event queue.
//
// - **Listener thread** (`TcpListener::accept()` loop, non-blocking with a
//   short sleep so it can notice shutdown): posts `WireEvent::Accepted`.
// - **Dial threads** (one per attempt): `browse()` is called from the node
//   loop and, every `browse_interval`, starts a connect to each configured
//   address that has no live link. Posts `Dialed` or `DialFailed`.
// - **Reader thread** per link: `read_frame()` in a loop, posts
//   `WireEvent::Frame`; on EOF, read error or a malformed frame posts
//   `WireEvent::Closed`.
// - **Writer thread** per link: drains an unbounded `mpsc` outbox of
//   pre-serialized frames, so `send` never blocks the node thread. A write
//   error posts `WireEvent::WriteFailed`.
//
// `TcpTransport` itself lives on the node thread. It turns `WireEvent`s into
// `TransportEvent`s (queued, drained with `take_events`) and is the only
// place link state changes. I/O threads never touch it.
//
// Handshake per link: both sides send `Hello` first. A version mismatch is
// declined before discovery is reported; otherwise `PeerDiscovered` goes up
// and the coordinator answers through `admit`. A peer is joined once we
// admitted it and its `Admit` arrived.
//
// Two links to the same peer (both sides dialed, or a redial while a link is
// up) are resolved by the side with the smaller handle alone: it keeps the
// link whose `Hello` it saw first and declines the other. The larger side
// never declines a duplicate. It parks the newcomer without reporting it and
// promotes it only if the link it was using closes. A joined link is never
// replaced, so a duplicate can not turn into a spurious `PeerLeft`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use xoxo_protocol::{Frame, PROTOCOL_VERSION, PeerHandle, SyncMessage, read_frame, write_message};

use crate::config::NodeConfig;
use crate::error::TransportError;
use crate::transport::{SendMode, Transport, TransportEvent};

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

pub type ConnId = u64;

/// Raw notifications from I/O threads. Posted through a `WireSink`.
#[derive(Debug)]
pub enum WireEvent {
    Accepted(TcpStream),
    Dialed { addr: SocketAddr, stream: TcpStream },
    DialFailed(SocketAddr),
    Frame { conn: ConnId, frame: Frame },
    Closed(ConnId),
    WriteFailed(ConnId),
}

/// Where I/O threads post their events. The node wraps its queue sender.
pub type WireSink = Arc<dyn Fn(WireEvent) + Send + Sync>;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    AwaitingHello,
    Undecided,
    Admitted,
    Joined,
    /// Second link to a peer that already has one; waits for the smaller
    /// handle's verdict.
    Parked,
}

struct Link {
    peer: Option<PeerHandle>,
    display_name: String,
    dialed: Option<SocketAddr>,
    outbox: Sender<Outbound>,
    depth: Arc<AtomicUsize>,
    admission: Admission,
    remote_admitted: bool,
}

pub struct TcpTransport {
    local: PeerHandle,
    display_name: String,
    local_addr: SocketAddr,
    connect: Vec<SocketAddr>,
    browse_interval: Duration,
    next_browse: Option<Instant>,
    max_peers: usize,
    best_effort_limit: usize,
    links: BTreeMap<ConnId, Link>,
    next_conn: ConnId,
    dialing: HashSet<SocketAddr>,
    addr_peers: HashMap<SocketAddr, PeerHandle>,
    events: VecDeque<TransportEvent>,
    sink: WireSink,
    keep_running: Arc<AtomicBool>,
}

impl TcpTransport {
    /// Bind the listener and start advertising. Dialing starts on the first
    /// `browse` call.
    pub fn start(config: &NodeConfig, sink: WireSink) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let keep_running_listener = keep_running.clone();
        let sink_listener = sink.clone();
        thread::Builder::new()
            .name("xoxo-listener".into())
            .spawn(move || listen_loop(listener, sink_listener, keep_running_listener))?;

        let local = PeerHandle::random();
        info!("[TRANSPORT] {local} advertising on {local_addr}");

        Ok(Self {
            local,
            display_name: config.display_name.clone(),
            local_addr,
            connect: config.connect.clone(),
            browse_interval: config.browse_interval(),
            next_browse: None,
            max_peers: config.max_peers,
            best_effort_limit: config.best_effort_queue_limit,
            links: BTreeMap::new(),
            next_conn: 0,
            dialing: HashSet::new(),
            addr_peers: HashMap::new(),
            events: VecDeque::new(),
            sink,
            keep_running,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Events produced since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<TransportEvent> {
        self.events.drain(..).collect()
    }

    /// Retry configured addresses that have no live link, at most once per
    /// browse interval.
    pub fn browse(&mut self, now: Instant) {
        if !self.keep_running.load(Ordering::SeqCst) {
            return;
        }
        if self.next_browse.is_some_and(|next| now < next) {
            return;
        }
        self.next_browse = Some(now + self.browse_interval);

        for addr in self.connect.clone() {
            if self.dialing.contains(&addr) || self.addr_is_linked(addr) {
                continue;
            }
            self.dialing.insert(addr);
            let sink = self.sink.clone();
            let spawned = thread::Builder::new()
                .name("xoxo-dial".into())
                .spawn(move || match TcpStream::connect_timeout(&addr, DIAL_TIMEOUT) {
                    Ok(stream) => sink(WireEvent::Dialed { addr, stream }),
                    Err(e) => {
                        debug!("[TRANSPORT] dial {addr} failed: {e}");
                        sink(WireEvent::DialFailed(addr));
                    }
                });
            if let Err(e) = spawned {
                warn!("[TRANSPORT] could not spawn dialer for {addr}: {e}");
                self.dialing.remove(&addr);
            }
        }
    }

    /// Apply one I/O event.
    pub fn handle_wire(&mut self, event: WireEvent) {
        match event {
            WireEvent::Accepted(stream) => self.open_link(stream, None),
            WireEvent::Dialed { addr, stream } => {
                self.dialing.remove(&addr);
                self.open_link(stream, Some(addr));
            }
            WireEvent::DialFailed(addr) => {
                self.dialing.remove(&addr);
            }
            WireEvent::Frame { conn, frame } => self.on_frame(conn, frame),
            WireEvent::Closed(conn) => {
                if self.links.contains_key(&conn) {
                    debug!("[TRANSPORT] link {conn} closed by remote");
                    self.close_link(conn, None);
                }
            }
            WireEvent::WriteFailed(conn) => {
                if let Some(peer) = self.joined_peer(conn) {
                    self.events.push_back(TransportEvent::DeliveryFailed { peer });
                }
                self.close_link(conn, None);
            }
        }
    }

    /// Say goodbye on every link and stop accepting.
    pub fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let conns: Vec<ConnId> = self.links.keys().copied().collect();
        for conn in conns {
            if let Some(link) = self.links.remove(&conn) {
                enqueue_frame(&link, &Frame::Goodbye);
                let _ = link.outbox.send(Outbound::Close);
            }
        }
        self.events.clear();
    }

    // -----------------------------------------------------------------------
    // Link lifecycle
    // -----------------------------------------------------------------------

    fn open_link(&mut self, stream: TcpStream, dialed: Option<SocketAddr>) {
        if !self.keep_running.load(Ordering::SeqCst) {
            return;
        }
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = match (stream.try_clone(), stream.try_clone()) {
            (Ok(r), Ok(w)) => (r, w),
            (Err(e), _) | (_, Err(e)) => {
                warn!("[TRANSPORT] could not split stream: {e}");
                return;
            }
        };

        let conn = self.next_conn;
        self.next_conn += 1;

        let (tx, rx) = mpsc::channel();
        let depth = Arc::new(AtomicUsize::new(0));

        let sink_reader = self.sink.clone();
        let reader = thread::Builder::new()
            .name(format!("xoxo-read-{conn}"))
            .spawn(move || reader_loop(BufReader::new(read_half), conn, sink_reader));
        let sink_writer = self.sink.clone();
        let depth_writer = depth.clone();
        let writer = thread::Builder::new()
            .name(format!("xoxo-write-{conn}"))
            .spawn(move || writer_loop(write_half, rx, depth_writer, conn, sink_writer));
        if let Err(e) = reader.and(writer) {
            warn!("[TRANSPORT] could not spawn link threads: {e}");
            stream.shutdown(Shutdown::Both).ok();
            return;
        }

        let link = Link {
            peer: None,
            display_name: String::new(),
            dialed,
            outbox: tx,
            depth,
            admission: Admission::AwaitingHello,
            remote_admitted: false,
        };
        enqueue_frame(
            &link,
            &Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                peer: self.local,
                display_name: self.display_name.clone(),
            },
        );
        debug!("[TRANSPORT] link {conn} open (dialed: {dialed:?})");
        self.links.insert(conn, link);
    }

    /// Drop a link, optionally sending one last frame first. Reports
    /// `PeerLeft` if the peer had joined.
    fn close_link(&mut self, conn: ConnId, farewell: Option<Frame>) {
        let Some(link) = self.links.remove(&conn) else {
            return;
        };
        if let Some(frame) = farewell {
            enqueue_frame(&link, &frame);
        }
        let _ = link.outbox.send(Outbound::Close);
        if let (Admission::Joined, Some(peer)) = (link.admission, link.peer) {
            info!("[TRANSPORT] {peer} left");
            self.events.push_back(TransportEvent::PeerLeft(peer));
        }
        if let Some(peer) = link.peer {
            self.promote_parked(peer);
        }
    }

    /// Report a parked link once it is the only one left to its peer.
    fn promote_parked(&mut self, peer: PeerHandle) {
        let active = self
            .links
            .values()
            .any(|l| l.peer == Some(peer) && l.admission != Admission::Parked);
        if active {
            return;
        }
        let Some((conn, link)) = self
            .links
            .iter_mut()
            .find(|(_, l)| l.peer == Some(peer) && l.admission == Admission::Parked)
        else {
            return;
        };
        debug!("[TRANSPORT] promoting parked link {conn} to {peer}");
        link.admission = Admission::Undecided;
        self.events.push_back(TransportEvent::PeerDiscovered {
            peer,
            display_name: link.display_name.clone(),
        });
    }

    fn decline(&mut self, conn: ConnId, reason: &str) {
        debug!("[TRANSPORT] declining link {conn}: {reason}");
        self.close_link(
            conn,
            Some(Frame::Decline {
                reason: reason.to_string(),
            }),
        );
    }

    fn on_frame(&mut self, conn: ConnId, frame: Frame) {
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        match frame {
            Frame::Hello {
                protocol_version,
                peer,
                display_name,
            } => {
                if link.admission == Admission::AwaitingHello {
                    self.on_hello(conn, protocol_version, peer, display_name);
                }
            }
            Frame::Admit => {
                link.remote_admitted = true;
                if link.admission == Admission::Admitted {
                    self.join(conn);
                }
            }
            Frame::Decline { reason } => {
                info!("[TRANSPORT] link {conn} declined by remote: {reason}");
                self.close_link(conn, None);
            }
            Frame::Goodbye => self.close_link(conn, None),
            Frame::Data { payload } => match self.joined_peer(conn) {
                Some(peer) => self
                    .events
                    .push_back(TransportEvent::DataReceived { peer, payload }),
                None => debug!("[TRANSPORT] dropping data on unjoined link {conn}"),
            },
            Frame::Sync(message) => match self.joined_peer(conn) {
                Some(peer) => self
                    .events
                    .push_back(TransportEvent::SyncReceived { peer, message }),
                None => debug!("[TRANSPORT] dropping sync on unjoined link {conn}"),
            },
        }
    }

    fn on_hello(&mut self, conn: ConnId, version: u32, peer: PeerHandle, display_name: String) {
        if version != PROTOCOL_VERSION {
            warn!("[TRANSPORT] {peer} speaks protocol {version}, we speak {PROTOCOL_VERSION}");
            self.decline(conn, "protocol version mismatch");
            return;
        }
        if peer == self.local {
            self.close_link(conn, None);
            return;
        }
        let dialed = self.links.get(&conn).and_then(|l| l.dialed);
        if let Some(addr) = dialed {
            self.addr_peers.insert(addr, peer);
        }

        let duplicate = self
            .links
            .iter()
            .any(|(c, l)| *c != conn && l.peer == Some(peer));
        if duplicate && self.local < peer {
            self.decline(conn, "duplicate link");
            return;
        }

        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        link.peer = Some(peer);
        if duplicate {
            debug!("[TRANSPORT] link {conn} duplicates a link to {peer}, parked");
            link.display_name = display_name;
            link.admission = Admission::Parked;
            return;
        }
        link.admission = Admission::Undecided;
        self.events
            .push_back(TransportEvent::PeerDiscovered { peer, display_name });
    }

    fn join(&mut self, conn: ConnId) {
        if let Some(link) = self.links.get_mut(&conn) {
            link.admission = Admission::Joined;
            if let Some(peer) = link.peer {
                info!("[TRANSPORT] {peer} joined");
                self.events.push_back(TransportEvent::PeerJoined(peer));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    fn joined_peer(&self, conn: ConnId) -> Option<PeerHandle> {
        self.links
            .get(&conn)
            .filter(|l| l.admission == Admission::Joined)
            .and_then(|l| l.peer)
    }

    fn joined_link(&self, peer: PeerHandle) -> Option<&Link> {
        self.links
            .values()
            .find(|l| l.peer == Some(peer) && l.admission == Admission::Joined)
    }

    fn addr_is_linked(&self, addr: SocketAddr) -> bool {
        if self.links.values().any(|l| l.dialed == Some(addr)) {
            return true;
        }
        self.addr_peers
            .get(&addr)
            .is_some_and(|peer| self.links.values().any(|l| l.peer == Some(*peer)))
    }

    fn deliver(
        &self,
        bytes: &[u8],
        peers: &[PeerHandle],
        mode: SendMode,
    ) -> Result<(), TransportError> {
        let mut result = Ok(());
        for &peer in peers {
            let Some(link) = self.joined_link(peer) else {
                result = Err(TransportError::NotConnected(peer));
                continue;
            };
            if mode == SendMode::BestEffort
                && link.depth.load(Ordering::SeqCst) >= self.best_effort_limit
            {
                debug!("[TRANSPORT] best-effort frame to {peer} dropped");
                continue;
            }
            link.depth.fetch_add(1, Ordering::SeqCst);
            if link.outbox.send(Outbound::Frame(bytes.to_vec())).is_err() {
                result = Err(TransportError::LinkClosed(peer));
            }
        }
        result
    }
}

impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerHandle {
        self.local
    }

    fn connected_peers(&self) -> Vec<PeerHandle> {
        self.links
            .values()
            .filter(|l| l.admission == Admission::Joined)
            .filter_map(|l| l.peer)
            .collect()
    }

    fn pending_admissions(&self) -> usize {
        self.links
            .values()
            .filter(|l| l.admission == Admission::Admitted)
            .count()
    }

    fn admit(&mut self, peer: PeerHandle, accept: bool) {
        let Some(conn) = self
            .links
            .iter()
            .find(|(_, l)| l.peer == Some(peer) && l.admission == Admission::Undecided)
            .map(|(c, _)| *c)
        else {
            debug!("[TRANSPORT] admit for {peer} with no undecided link");
            return;
        };

        let in_use = self.connected_peers().len() + self.pending_admissions();
        if !accept || in_use >= self.max_peers {
            self.decline(conn, "max connections reached");
            return;
        }

        let remote_admitted = match self.links.get_mut(&conn) {
            Some(link) => {
                link.admission = Admission::Admitted;
                enqueue_frame(link, &Frame::Admit);
                link.remote_admitted
            }
            None => false,
        };
        if remote_admitted {
            self.join(conn);
        }
    }

    fn send(
        &mut self,
        payload: &[u8],
        peers: &[PeerHandle],
        mode: SendMode,
    ) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(&Frame::Data {
            payload: payload.to_vec(),
        })?;
        self.deliver(&bytes, peers, mode)
    }

    fn send_sync(
        &mut self,
        message: &SyncMessage,
        peers: &[PeerHandle],
    ) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(&Frame::Sync(message.clone()))?;
        self.deliver(&bytes, peers, SendMode::Reliable)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
    }
}

/// Queue a control frame. Serialization of our own frames cannot fail in
/// practice; if it does, the frame is logged and skipped.
fn enqueue_frame(link: &Link, frame: &Frame) {
    match serde_json::to_vec(frame) {
        Ok(bytes) => {
            link.depth.fetch_add(1, Ordering::SeqCst);
            let _ = link.outbox.send(Outbound::Frame(bytes));
        }
        Err(e) => warn!("[TRANSPORT] could not encode {frame:?}: {e}"),
    }
}

fn listen_loop(listener: TcpListener, sink: WireSink, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("[TRANSPORT] accepted {addr}");
                stream.set_nonblocking(false).ok();
                sink(WireEvent::Accepted(stream));
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!("[TRANSPORT] listener stopped: {e}");
                break;
            }
        }
    }
}

fn reader_loop(mut reader: BufReader<TcpStream>, conn: ConnId, sink: WireSink) {
    loop {
        match read_frame(&mut reader) {
            Ok(frame) => sink(WireEvent::Frame { conn, frame }),
            Err(e) => {
                if !e.is_eof() {
                    debug!("[TRANSPORT] link {conn} read ended: {e}");
                }
                sink(WireEvent::Closed(conn));
                break;
            }
        }
    }
}

fn writer_loop(
    stream: TcpStream,
    outbox: Receiver<Outbound>,
    depth: Arc<AtomicUsize>,
    conn: ConnId,
    sink: WireSink,
) {
    let mut writer = BufWriter::new(stream);
    while let Ok(out) = outbox.recv() {
        match out {
            Outbound::Frame(bytes) => {
                depth.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = write_message(&mut writer, &bytes) {
                    debug!("[TRANSPORT] link {conn} write failed: {e}");
                    sink(WireEvent::WriteFailed(conn));
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    writer.flush().ok();
    writer.get_ref().shutdown(Shutdown::Both).ok();
}
