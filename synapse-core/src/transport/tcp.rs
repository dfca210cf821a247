//! Network socket transport
//!
//! Server side: an accept loop spawning one reader/writer task pair plus a
//! session dispatch loop per connection. Client side: a connection loop
//! running the handshake and, on unexpected close, reconnecting after a
//! delay that grows with the square of the consecutive-failure count.
//! Socket errors are never surfaced individually; they fold into the close
//! that drives cleanup and reconnection.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::{MessageCodec, encode_message};
use crate::config::ConnectMode;
use crate::error::{Result, SynapseError};
use crate::hub::{HubCore, backoff_delay};
use crate::message::Message;
use crate::session::PeerSender;
use crate::transport::UpstreamLink;

/// Accept connections until the hub stops.
pub(crate) async fn serve(core: Arc<HubCore>, listener: TcpListener) {
    let mut role_rx = core.role_watch();
    if core.is_stopped() {
        return;
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "peer connected");
                    tokio::spawn(serve_connection(core.clone(), stream));
                }
                Err(e) => debug!("accept failed: {e}"),
            },
            changed = role_rx.changed() => {
                if changed.is_err() || core.is_stopped() {
                    break;
                }
            }
        }
    }
    debug!("accept loop ended");
}

async fn serve_connection(core: Arc<HubCore>, stream: TcpStream) {
    let peer_addr = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    let out_tx = spawn_writer(write_half, core.config.outbound_capacity);
    let session_tx = core.open_session(PeerSender::Frame(out_tx));

    let mut framed = FramedRead::new(read_half, MessageCodec);
    let mut role_rx = core.role_watch();
    while !core.is_stopped() {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => {
                    if session_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(?peer_addr, "closing connection on corrupt frame: {e}");
                    break;
                }
                None => break,
            },
            changed = role_rx.changed() => {
                if changed.is_err() || core.is_stopped() {
                    break;
                }
            }
        }
    }
    // dropping the inbound sender ends the dispatch loop, which
    // deregisters everything the peer registered
    debug!(?peer_addr, "peer connection closed");
}

/// Connect as a client; retries run in the background so the caller
/// returns immediately, mirroring the reconnect contract.
pub(crate) async fn connect(core: Arc<HubCore>) -> Result<()> {
    tokio::spawn(run_client(core));
    Ok(())
}

async fn run_client(core: Arc<HubCore>) {
    loop {
        if core.is_stopped() {
            break;
        }
        match TcpStream::connect(core.config.endpoint()).await {
            Ok(stream) => {
                core.reset_attempts();
                run_connection(&core, stream).await;
            }
            Err(e) => debug!(endpoint = %core.config.endpoint(), "connect failed: {e}"),
        }
        if !core.reconnect_enabled() {
            core.clear_ready();
            break;
        }
        let attempt = core.next_attempt();
        let delay = backoff_delay(core.config.reconnect_base_delay, attempt);
        debug!(attempt, ?delay, "scheduling reconnect");
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection(core: &Arc<HubCore>, stream: TcpStream) {
    let (read_half, write_half) = stream.into_split();
    let out_tx = spawn_writer(write_half, core.config.outbound_capacity);
    let link: Arc<dyn UpstreamLink> = Arc::new(TcpLink { tx: out_tx });
    core.set_upstream(link.clone()).await;

    if let Err(e) = core.client_handshake(link.as_ref()).await {
        debug!("handshake failed: {e}");
    }

    let mut framed = FramedRead::new(read_half, MessageCodec);
    let mut role_rx = core.role_watch();
    while !core.is_stopped() {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(message)) => core.handle_upstream_message(message).await,
                Some(Err(e)) => {
                    warn!("closing upstream connection on corrupt frame: {e}");
                    break;
                }
                None => break,
            },
            changed = role_rx.changed() => {
                if changed.is_err() || core.is_stopped() {
                    break;
                }
            }
        }
    }
    core.clear_upstream().await;
    debug!("upstream connection closed");
}

fn spawn_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    capacity: usize,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                // swallowed; the read side observes the close
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });
    tx
}

struct TcpLink {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl UpstreamLink for TcpLink {
    async fn send(&self, message: Message) -> Result<()> {
        let bytes = encode_message(&message)?;
        self.tx
            .send(bytes)
            .await
            .map_err(|_| SynapseError::ChannelClosed)
    }

    fn mode(&self) -> ConnectMode {
        ConnectMode::Netsocket
    }
}
