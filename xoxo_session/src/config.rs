// Node configuration.
//
// `NodeConfig` is a plain serde struct with `#[serde(default)]`, so a JSON
// document only needs the fields it wants to override. Durations are stored
// as milliseconds for readable config files; accessor methods hand out
// `Duration`s.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the owner of a tile does when another participant asks for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnershipTransferMode {
    /// Hand the token over whenever the requester's view is current.
    #[default]
    AutoAccept,
    /// Keep owned tiles; only unowned tiles can be claimed.
    Manual,
}

/// Configuration for one peer node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address the listener binds to. Port 0 lets the OS choose.
    pub listen_addr: SocketAddr,
    /// Addresses the dialer keeps trying until a link is up.
    pub connect: Vec<SocketAddr>,
    /// Human-readable name sent in the transport handshake.
    pub display_name: String,
    /// Upper bound on simultaneously admitted peers.
    pub max_peers: usize,
    /// Pending ownership requests older than this resolve to denial.
    pub ownership_timeout_ms: u64,
    /// Event loop wake-up interval when no event arrives.
    pub tick_interval_ms: u64,
    /// How often the dialer retries unconnected addresses.
    pub browse_interval_ms: u64,
    /// Best-effort sends are dropped when a link's queue is this deep.
    pub best_effort_queue_limit: usize,
    pub transfer_mode: OwnershipTransferMode,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            connect: Vec::new(),
            display_name: "xoxo-peer".into(),
            max_peers: 3,
            ownership_timeout_ms: 3000,
            tick_interval_ms: 50,
            browse_interval_ms: 500,
            best_effort_queue_limit: 64,
            transfer_mode: OwnershipTransferMode::AutoAccept,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ownership_timeout(&self) -> Duration {
        Duration::from_millis(self.ownership_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn browse_interval(&self) -> Duration {
        Duration::from_millis(self.browse_interval_ms.max(10))
    }
}
