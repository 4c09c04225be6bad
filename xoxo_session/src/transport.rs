// Transport seam between the coordinator and the network.
//
// The coordinator is generic over `Transport` so the same policy code runs
// over real TCP links (`tcp.rs`) and over the in-memory mesh used by the
// multiplayer tests. Calls go one way (coordinator -> transport); everything
// the network reports comes back as a `TransportEvent` delivered on the
// node's single event queue, never as a callback into coordinator state.

use xoxo_protocol::{PeerHandle, SyncMessage};

use crate::error::TransportError;

/// Delivery guarantee for an application payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Delivered in order, or the link fails and the peer leaves.
    Reliable,
    /// May be dropped silently under back-pressure.
    BestEffort,
}

/// Everything the transport reports to the coordinator.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A peer completed the `Hello` exchange and awaits an admission decision
    /// (`Transport::admit`).
    PeerDiscovered {
        peer: PeerHandle,
        display_name: String,
    },
    /// Both sides admitted each other. The peer now counts as connected.
    PeerJoined(PeerHandle),
    /// A joined peer went away. Reported exactly once per join.
    PeerLeft(PeerHandle),
    /// Opaque application payload.
    DataReceived { peer: PeerHandle, payload: Vec<u8> },
    /// Replicated-state message.
    SyncReceived {
        peer: PeerHandle,
        message: SyncMessage,
    },
    /// A reliable write to this peer failed; `PeerLeft` follows.
    DeliveryFailed { peer: PeerHandle },
}

/// Operations the coordinator needs from a peer-to-peer link layer.
pub trait Transport {
    /// This endpoint's own handle, as remote peers know it.
    fn local_peer(&self) -> PeerHandle;

    /// Snapshot of joined peers.
    fn connected_peers(&self) -> Vec<PeerHandle>;

    /// Peers admitted locally whose handshake has not finished yet.
    fn pending_admissions(&self) -> usize;

    /// Answer a `PeerDiscovered` event.
    fn admit(&mut self, peer: PeerHandle, accept: bool);

    /// Queue an application payload for each listed peer. Never blocks.
    fn send(
        &mut self,
        payload: &[u8],
        peers: &[PeerHandle],
        mode: SendMode,
    ) -> Result<(), TransportError>;

    /// Queue a replication message for each listed peer, reliably.
    fn send_sync(&mut self, message: &SyncMessage, peers: &[PeerHandle])
    -> Result<(), TransportError>;
}
