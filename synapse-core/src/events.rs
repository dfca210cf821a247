//! Lifecycle notifications
//!
//! Hub lifecycle is observable two ways: as ordinary bus events under the
//! `synapse::` prefix (so they traverse the hub tree like any other event,
//! e.g. a parent hears a child's `name::synapse::ready`), and as a typed
//! [`HubEvent`] broadcast for the embedding application.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Emitted when a hub first completes its handshake or starts listening.
pub const READY: &str = "synapse::ready";
/// Emitted on every successful handshake after the first.
pub const RECONNECTED: &str = "synapse::reconnected";
/// Echo probe used as the handshake ordering fence.
pub const READY_PROBE: &str = "synapse::ready-internal";
/// Emitted by a serving hub when a peer registers a listener.
pub const NEW_LISTENER: &str = "synapse::new-listener";
/// Fork request event consumed by an attached supervisor.
pub const FORK: &str = "synapse::fork";
/// Emitted before each child hub is forked.
pub const SPAWNING: &str = "synapse::spawning";
/// Emitted when a child process has been started.
pub const FORK_START: &str = "synapse::fork-start";
/// Emitted when a child process exits.
pub const FORK_EXIT: &str = "synapse::fork-exit";
/// Emitted when a crashing child exhausts its restart budget.
pub const FORK_GIVEUP: &str = "synapse::fork-giveup";
/// Emitted once every requested child has been forked.
pub const CHILDREN_SPAWNED: &str = "synapse::children-spawned";
/// Emitted once every spawned child has reported ready.
pub const CHILDREN_READY: &str = "synapse::children-ready";

/// Typed mirror of the bus-level lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubEvent {
    /// The hub is listening and serving peers.
    Listening { addr: SocketAddr },
    /// First successful handshake (or listen) completed.
    Ready,
    /// A later handshake completed after a connection loss.
    Reconnected,
    /// A peer registered a listener.
    NewListener { event_type: String, hub: String },
    /// A child hub is about to be forked.
    Spawning { name: String },
    /// A child process started.
    ForkStart { name: String, pid: u32 },
    /// A child process exited.
    ForkExit { name: String, code: Option<i32> },
    /// A crashing child exhausted its restart budget.
    ForkGiveup { name: String, restarts: u32 },
    /// All requested children have been forked.
    ChildrenSpawned { names: Vec<String> },
    /// All spawned children reported ready.
    ChildrenReady { names: Vec<String> },
    /// The hub stopped.
    Stopped,
}
