//! Synapse Supervisor - process supervision for hub trees
//!
//! Forks child processes hosting further hubs, multiplexes their control
//! channels into virtual sessions on the parent hub, and restarts children
//! that crash, throttled by their observed lifetime.
//!
//! ## When to Use
//!
//! Use `synapse-supervisor` when a master hub should own a tree of child
//! hub processes: workers that register their subscriptions over the
//! process control channel, get restarted on abnormal exit, and report
//! readiness back to the parent. For peers in the same process, the core
//! crate's same-process shortcut needs no supervisor at all.

mod error;
mod spawn;
mod supervisor;

pub use error::{Result, SupervisorError};
pub use spawn::SpawnSpec;
pub use supervisor::{ChildInfo, ForkSpec, Supervisor, SupervisorConfig, respawn_delay};
