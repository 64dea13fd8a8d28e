//! Connection Health Monitor
//!
//! Tracks two independent reachability signals and emits an edge only when a
//! signal flips. Every edge is queued on an unbounded channel so no transition
//! is coalesced away; the current value is also published on a `watch` for
//! observers that only care about the latest state.

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Currency node RPC / event source
    Node,
    /// Message channel to the main server
    MainServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEdge {
    pub signal: Signal,
    pub online: bool,
}

pub struct HealthMonitor {
    node: watch::Sender<bool>,
    main_server: watch::Sender<bool>,
    edges: mpsc::UnboundedSender<HealthEdge>,
}

impl HealthMonitor {
    /// Both signals start offline
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HealthEdge>) {
        let (edges, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            node: watch::channel(false).0,
            main_server: watch::channel(false).0,
            edges,
        };
        (monitor, rx)
    }

    fn sender(&self, signal: Signal) -> &watch::Sender<bool> {
        match signal {
            Signal::Node => &self.node,
            Signal::MainServer => &self.main_server,
        }
    }

    /// Record an observation. Returns true if it was an edge.
    pub fn set(&self, signal: Signal, online: bool) -> bool {
        let changed = self.sender(signal).send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                info!(?signal, "Connected");
            } else {
                warn!(?signal, "Disconnected");
            }
            // Receiver gone means the supervisor has shut down
            let _ = self.edges.send(HealthEdge { signal, online });
        }
        changed
    }

    pub fn set_node_online(&self, online: bool) -> bool {
        self.set(Signal::Node, online)
    }

    pub fn set_main_server_online(&self, online: bool) -> bool {
        self.set(Signal::MainServer, online)
    }

    pub fn node_online(&self) -> bool {
        *self.node.borrow()
    }

    pub fn main_server_online(&self) -> bool {
        *self.main_server.borrow()
    }

    pub fn subscribe(&self, signal: Signal) -> watch::Receiver<bool> {
        self.sender(signal).subscribe()
    }
}
