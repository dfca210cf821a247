//! Per-peer protocol state machine
//!
//! A [`Session`] interprets the protocol messages of one logical peer
//! connection and mediates between the hub's registry and the peer's
//! transport. Sessions are fed from a bounded inbound channel; the loop
//! consuming that channel is the session's only execution context, so all
//! registry mutation on behalf of a peer is serialized. When the channel
//! closes — connection loss, child exit, hub stop — the session degrades to
//! BYE semantics and deregisters everything the peer registered.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balancer::BalancerDescriptor;
use crate::codec::{CachedFrame, encode_message};
use crate::error::{Result, SynapseError};
use crate::hub::HubCore;
use crate::message::{Command, Envelope, Message, namespaced};

pub(crate) type SessionId = Uuid;

/// Transport-specific send capability of one peer.
#[derive(Clone)]
pub(crate) enum PeerSender {
    /// Socket peer: pre-encoded frames to the connection's writer task.
    Frame(mpsc::Sender<Bytes>),
    /// Same-process peer: messages delivered as deferred local calls.
    Local(mpsc::Sender<Message>),
    /// Multiplexed child peer: envelopes on the process control channel.
    Child {
        name: String,
        tx: mpsc::Sender<Envelope>,
    },
}

impl PeerSender {
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        match self {
            PeerSender::Frame(tx) => tx
                .send(encode_message(&message)?)
                .await
                .map_err(|_| SynapseError::ChannelClosed),
            PeerSender::Local(tx) => tx
                .send(message)
                .await
                .map_err(|_| SynapseError::ChannelClosed),
            PeerSender::Child { name, tx } => tx
                .send(Envelope::new(name.clone(), message))
                .await
                .map_err(|_| SynapseError::ChannelClosed),
        }
    }

    /// Send a fanned-out message, reusing the frame's memoized encoding on
    /// byte-stream transports.
    pub(crate) async fn send_cached(&self, frame: &CachedFrame) -> Result<()> {
        match self {
            PeerSender::Frame(tx) => tx
                .send(frame.bytes()?)
                .await
                .map_err(|_| SynapseError::ChannelClosed),
            other => other.send(frame.message().clone()).await,
        }
    }
}

/// One logical connection to a peer, independent of transport.
pub(crate) struct Session {
    id: SessionId,
    peer_name: String,
    sender: PeerSender,
    hub: Arc<HubCore>,
}

impl Session {
    pub(crate) fn new(hub: Arc<HubCore>, sender: PeerSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer_name: "peer".to_string(),
            sender,
            hub,
        }
    }

    pub(crate) async fn dispatch(&mut self, message: Message) {
        match message.command {
            Command::Hello {
                proto_version,
                name,
            } => {
                debug!(peer = %name, proto_version, "peer hello");
                self.peer_name = name;
            }
            Command::On {
                event_type,
                balancer,
            } => self.handle_on(event_type, balancer).await,
            Command::Echo { event_type } => {
                if let Err(e) = self.sender.send(Message::push_emit(event_type, None)).await {
                    debug!(peer = %self.peer_name, "echo reply failed: {e}");
                }
            }
            Command::Off { event_type } => {
                let mut reg = self.hub.registry.write().await;
                reg.remove_session_type(self.id, &event_type);
                reg.service_release(&event_type, self.id);
            }
            Command::Bye => self.teardown().await,
            Command::Emit { event_type } => {
                let event = namespaced(&self.peer_name, &event_type);
                self.hub
                    .dispatch_event(&event, message.payload, Some(self.id))
                    .await;
            }
            Command::PushEmit { .. } => {
                // only ever sent server → client; a cooperative peer never
                // issues it as a command
                debug!(peer = %self.peer_name, "ignoring PUSH_EMIT sent as a command");
            }
        }
    }

    async fn handle_on(&mut self, event_type: String, balancer: Option<BalancerDescriptor>) {
        {
            let mut reg = self.hub.registry.write().await;
            reg.insert_remote(
                &event_type,
                self.id,
                self.sender.clone(),
                balancer.is_some(),
            );
            if let Some(desc) = balancer {
                if desc.composite_type() != event_type {
                    warn!(
                        peer = %self.peer_name,
                        wire = %event_type,
                        "balancer descriptor does not match its wire type"
                    );
                }
                reg.service_add(event_type.clone(), desc, self.id);
            }
        }
        self.hub
            .notify_new_listener(&event_type, &self.peer_name)
            .await;
    }

    /// BYE semantics; also invoked when the peer's transport closes.
    pub(crate) async fn close(&mut self) {
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        let mut reg = self.hub.registry.write().await;
        reg.remove_session(self.id);
        reg.service_release_session(self.id);
        debug!(peer = %self.peer_name, "session deregistered");
    }
}
