//! Forked-process transport (child side)
//!
//! A hub running inside a supervised child process exchanges [`Envelope`]s
//! with its parent over the process control channel: framed envelopes on
//! stdin/stdout. One physical process may host several logical hubs, so the
//! channel is created once per process and every hub registers its logical
//! name for demultiplexing. Logs must go to stderr in child mode; stdout
//! belongs to the channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{RwLock, mpsc};
use tokio_util::codec::FramedRead;
use tracing::{debug, error};

use crate::codec::{EnvelopeCodec, encode_envelope};
use crate::config::ConnectMode;
use crate::error::{Result, SynapseError};
use crate::hub::HubCore;
use crate::message::{Envelope, Message};
use crate::transport::UpstreamLink;

type Router = Arc<RwLock<HashMap<String, mpsc::Sender<Message>>>>;

/// The process-wide control channel towards the supervising parent.
/// Create it once (from stdio) and hand a clone to every hub built with
/// [`crate::config::ConnectMode::Child`].
#[derive(Clone)]
pub struct ChildChannel {
    out_tx: mpsc::Sender<Envelope>,
    router: Router,
}

impl ChildChannel {
    /// Bind the channel to this process's stdin/stdout.
    pub fn from_stdio() -> Self {
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(64);
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(envelope) = out_rx.recv().await {
                let bytes = match encode_envelope(&envelope) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!("failed to encode envelope: {e}");
                        continue;
                    }
                };
                if stdout.write_all(&bytes).await.is_err() || stdout.flush().await.is_err() {
                    break;
                }
            }
        });

        let router: Router = Arc::new(RwLock::new(HashMap::new()));
        let reader_router = router.clone();
        tokio::spawn(async move {
            let mut framed = FramedRead::new(tokio::io::stdin(), EnvelopeCodec);
            while let Some(frame) = framed.next().await {
                match frame {
                    Ok(envelope) => {
                        let target = reader_router.read().await.get(&envelope.name).cloned();
                        match target {
                            Some(tx) => {
                                if tx.send(envelope.message).await.is_err() {
                                    debug!(name = %envelope.name, "hub inbound closed, dropping");
                                }
                            }
                            None => debug!(name = %envelope.name, "no hub for envelope, dropping"),
                        }
                    }
                    Err(e) => {
                        // corrupt control channel is unrecoverable
                        error!("control channel corrupt, shutting it down: {e}");
                        break;
                    }
                }
            }
        });

        Self { out_tx, router }
    }

    async fn register(&self, name: &str, capacity: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity);
        self.router.write().await.insert(name.to_string(), tx);
        rx
    }
}

impl fmt::Debug for ChildChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildChannel").finish_non_exhaustive()
    }
}

pub(crate) async fn connect(core: Arc<HubCore>, channel: ChildChannel) -> Result<()> {
    let mut inbound = channel
        .register(&core.config.name, core.config.inbound_capacity)
        .await;

    let client = core.clone();
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            client.handle_upstream_message(message).await;
        }
        debug!("child link closed");
    });

    let link: Arc<dyn UpstreamLink> = Arc::new(ChildLink {
        name: core.config.name.clone(),
        tx: channel.out_tx.clone(),
    });
    core.set_upstream(link.clone()).await;
    core.client_handshake(link.as_ref()).await
}

struct ChildLink {
    name: String,
    tx: mpsc::Sender<Envelope>,
}

#[async_trait]
impl UpstreamLink for ChildLink {
    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Envelope::new(self.name.clone(), message))
            .await
            .map_err(|_| SynapseError::ChannelClosed)
    }

    fn mode(&self) -> ConnectMode {
        ConnectMode::Child
    }
}
