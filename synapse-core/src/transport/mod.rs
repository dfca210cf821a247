//! Transport strategies
//!
//! Exactly one strategy is active per client-role connection, selected at
//! connect time: a real socket ([`tcp`]), the same-process shortcut against
//! a root hub ([`direct`]), or the multiplexed control channel of a
//! supervised child process ([`child`]). All three run the same handshake
//! and present the same upstream contract, so `emit`/`on` behave
//! identically regardless of how the peer is reached.

use async_trait::async_trait;

use crate::config::ConnectMode;
use crate::error::Result;
use crate::message::Message;

pub(crate) mod direct;
pub(crate) mod tcp;
pub mod child;

/// Client-side send capability towards the upstream hub.
#[async_trait]
pub(crate) trait UpstreamLink: Send + Sync {
    async fn send(&self, message: Message) -> Result<()>;

    fn mode(&self) -> ConnectMode;
}
