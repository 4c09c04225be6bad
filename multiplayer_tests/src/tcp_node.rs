// Blocking wrapper around a real node on localhost.
//
// `TestNode` starts a node through `start_node` with a recording `SceneLog`
// and adds polling helpers: tests state the condition they expect on a
// `NodeView` and `wait_for` retries until it holds or the timeout fires.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use xoxo_protocol::PeerHandle;
use xoxo_session::{NodeConfig, NodeHandle, NodeView, start_node};

use crate::SceneLog;

/// Default timeout for blocking waits.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct TestNode {
    pub handle: NodeHandle,
    pub log: SceneLog,
}

impl TestNode {
    /// Start a node with fast timers, listening on an OS-chosen port and
    /// dialing `connect`.
    pub fn start(connect: &[SocketAddr], tweak: impl FnOnce(&mut NodeConfig)) -> Self {
        let mut config = NodeConfig {
            connect: connect.to_vec(),
            browse_interval_ms: 50,
            tick_interval_ms: 10,
            ..NodeConfig::default()
        };
        tweak(&mut config);
        let log = SceneLog::default();
        let handle = start_node(config, Box::new(log.clone())).expect("start_node failed");
        Self { handle, log }
    }

    pub fn peer(&self) -> PeerHandle {
        self.handle.local_peer()
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    pub fn view(&self) -> NodeView {
        self.handle.view().expect("node did not answer")
    }

    /// Poll until `check` holds on the node's view.
    pub fn wait_for(&self, what: &str, check: impl Fn(&NodeView) -> bool) -> NodeView {
        let start = Instant::now();
        loop {
            let view = self.view();
            if check(&view) {
                return view;
            }
            assert!(
                start.elapsed() < WAIT_TIMEOUT,
                "timed out waiting for {what}; last view: {view:?}"
            );
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Poll until exactly `peers` are connected.
    pub fn wait_connected(&self, peers: &[PeerHandle]) -> NodeView {
        let mut expected = peers.to_vec();
        expected.sort();
        self.wait_for("connected set", |v| {
            let mut connected = v.connected.clone();
            connected.sort();
            connected == expected
        })
    }

    /// Watch `check` for `period` and fail if it ever stops holding.
    pub fn hold_for(&self, what: &str, period: Duration, check: impl Fn(&NodeView) -> bool) {
        let start = Instant::now();
        while start.elapsed() < period {
            let view = self.view();
            assert!(check(&view), "{what} stopped holding: {view:?}");
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn stop(self) {
        self.handle.stop();
    }
}
