//! Same-process shortcut transport
//!
//! When the configured endpoint is served by a root hub living in this
//! process, the connection skips framing and sockets entirely: sends are
//! queued to a virtual session on the root hub and replies are queued back,
//! so delivery stays asynchronous and the caller never observes
//! synchronous reentrancy.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::ConnectMode;
use crate::error::{Result, SynapseError};
use crate::hub::HubCore;
use crate::message::Message;
use crate::session::PeerSender;
use crate::transport::UpstreamLink;

pub(crate) async fn connect(core: Arc<HubCore>, root: Arc<HubCore>) -> Result<()> {
    let (reply_tx, mut reply_rx) = mpsc::channel::<Message>(core.config.inbound_capacity);
    let session_tx = root.open_session(PeerSender::Local(reply_tx));

    // deferred delivery of server → client traffic
    let client = core.clone();
    tokio::spawn(async move {
        while let Some(message) = reply_rx.recv().await {
            client.handle_upstream_message(message).await;
        }
        debug!("direct link closed");
    });

    let link: Arc<dyn UpstreamLink> = Arc::new(DirectLink { tx: session_tx });
    core.set_upstream(link.clone()).await;
    core.client_handshake(link.as_ref()).await
}

struct DirectLink {
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl UpstreamLink for DirectLink {
    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SynapseError::ChannelClosed)
    }

    fn mode(&self) -> ConnectMode {
        ConnectMode::Direct
    }
}
