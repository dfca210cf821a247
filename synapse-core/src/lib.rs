//! # Synapse - distributed publish/subscribe event bus
//!
//! Independent processes ("hubs") expose and consume named events across
//! process and machine boundaries, composing into a tree of services that
//! act as servers, clients or transparently co-located peers:
//! - Self-delimiting frame codec tolerant of arbitrary chunk boundaries
//! - A per-connection protocol state machine driving one registry per hub
//! - Three interchangeable transports: socket, forked child process, and a
//!   same-process shortcut, all behind one subscription/emission surface
//! - Selector-based load balancing and supervised child hub processes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synapse_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let hub = Hub::builder().name("alpha").port(1976).build();
//!     // first hub on the endpoint serves, later ones connect
//!     hub.start().await?;
//!
//!     hub.on("*::job::done", |n: u64| {
//!         Box::pin(async move {
//!             println!("job {n} done");
//!             Ok(())
//!         })
//!     })
//!     .await?;
//!
//!     hub.emit("job::done", 7u64).await?;
//!     Ok(())
//! }
//! ```

pub mod balancer;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod message;
pub(crate) mod registry;
pub mod roots;
pub(crate) mod session;
pub mod transport;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::balancer::{BalancerDescriptor, FilterRegistry, FilterSpec};
    pub use crate::codec::{CachedFrame, FrameDecoder, encode_envelope, encode_message};
    pub use crate::config::{ConnectMode, HubConfig, DEFAULT_HOST, DEFAULT_PORT};
    pub use crate::error::{Result, SynapseError};
    pub use crate::events::HubEvent;
    pub use crate::hub::{Hub, HubBuilder, RoleState, SubscriptionHandle};
    pub use crate::message::{Command, Envelope, Message, PROTO_VERSION};
    pub use crate::roots::RootRegistry;
    pub use crate::transport::child::ChildChannel;
}
