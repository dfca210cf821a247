//! The hub: one event-bus participant
//!
//! A hub either *listens* (server role, owning one session per connected
//! peer) or *connects* (client role, exactly one upstream session), with
//! [`Hub::start`] trying to listen first and falling back to connecting
//! when the endpoint is already taken. Application code only touches the
//! `emit`/`on` surface; sessions, codec and transports are plumbing that
//! make remote emit/on behave like local emit/on.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::{BalancerDescriptor, FilterRegistry, FilterSpec};
use crate::codec::CachedFrame;
use crate::config::{ConnectMode, HubConfig};
use crate::error::{Result, SynapseError};
use crate::events::{self, HubEvent};
use crate::message::{namespaced, Envelope, Message};
use crate::registry::{LocalHandler, Registry, Sink};
use crate::roots::RootRegistry;
use crate::session::{PeerSender, Session, SessionId};
use crate::transport::{self, UpstreamLink};

/// Explicit hub role; legal transitions are
/// `Idle → Listening | Connected → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Idle,
    Listening,
    Connected,
    Stopped,
}

/// Shared hub state behind the public [`Hub`] handle.
pub(crate) struct HubCore {
    pub(crate) config: HubConfig,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) filters: FilterRegistry,
    pub(crate) roots: RootRegistry,
    child_channel: Option<transport::child::ChildChannel>,
    role_tx: watch::Sender<RoleState>,
    ready_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<HubEvent>,
    upstream: RwLock<Option<Arc<dyn UpstreamLink>>>,
    /// Number of the next reconnect attempt; reset to 1 on success.
    attempt: AtomicU32,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

/// One event-bus participant. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Hub {
    core: Arc<HubCore>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.core.config.name)
            .field("role", &self.role())
            .finish()
    }
}

/// Builder for [`Hub`] instances.
#[derive(Debug, Default)]
pub struct HubBuilder {
    config: HubConfig,
    roots: Option<RootRegistry>,
    filters: Option<FilterRegistry>,
    child_channel: Option<transport::child::ChildChannel>,
}

impl HubBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn mode(mut self, mode: ConnectMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn local(mut self, local: bool) -> Self {
        self.config.local = local;
        self
    }

    pub fn reconnect(mut self, reconnect: bool) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn config(mut self, config: HubConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a shared root registry; hubs sharing one can shortcut
    /// same-process connections.
    pub fn roots(mut self, roots: RootRegistry) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn filters(mut self, filters: FilterRegistry) -> Self {
        self.filters = Some(filters);
        self
    }

    /// The process control channel; required for [`ConnectMode::Child`].
    pub fn child_channel(mut self, channel: transport::child::ChildChannel) -> Self {
        self.child_channel = Some(channel);
        self
    }

    pub fn build(self) -> Hub {
        let (role_tx, _) = watch::channel(RoleState::Idle);
        let (ready_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(64);
        Hub {
            core: Arc::new(HubCore {
                config: self.config,
                registry: RwLock::new(Registry::default()),
                filters: self.filters.unwrap_or_default(),
                roots: self.roots.unwrap_or_default(),
                child_channel: self.child_channel,
                role_tx,
                ready_tx,
                events_tx,
                upstream: RwLock::new(None),
                attempt: AtomicU32::new(1),
                local_addr: std::sync::Mutex::new(None),
            }),
        }
    }
}

/// Handle to a subscription; dropping it keeps the subscription alive,
/// [`SubscriptionHandle::unsubscribe`] removes it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: Uuid,
    event_type: String,
    core: std::sync::Weak<HubCore>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Remove the subscription. The upstream hub is informed by the next
    /// garbage-collection cycle, not immediately.
    pub async fn unsubscribe(self) -> Result<()> {
        if let Some(core) = self.core.upgrade() {
            core.registry.write().await.remove_by_id(self.id);
        }
        Ok(())
    }
}

impl Hub {
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    pub fn new(config: HubConfig) -> Self {
        HubBuilder::new().config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn config(&self) -> &HubConfig {
        &self.core.config
    }

    pub fn role(&self) -> RoleState {
        *self.core.role_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        *self.core.ready_tx.borrow()
    }

    pub fn is_listening(&self) -> bool {
        self.role() == RoleState::Listening
    }

    /// The bound address while listening (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr.lock().ok().and_then(|a| *a)
    }

    /// Custom filter predicates usable in balanced subscriptions.
    pub fn filters(&self) -> &FilterRegistry {
        &self.core.filters
    }

    /// Typed lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.core.events_tx.subscribe()
    }

    /// Transport of the active upstream connection, if any.
    pub async fn upstream_mode(&self) -> Option<ConnectMode> {
        self.core.upstream.read().await.as_ref().map(|l| l.mode())
    }

    /// Publish a lifecycle notification to [`Hub::events`] subscribers.
    pub fn publish_event(&self, event: HubEvent) {
        let _ = self.core.events_tx.send(event);
    }

    /// Wait until the hub has completed its handshake or started listening.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.core.ready_tx.subscribe();
        while !*rx.borrow_and_update() {
            rx.changed()
                .await
                .map_err(|_| SynapseError::Hub("hub dropped".to_string()))?;
        }
        Ok(())
    }

    /// Become a server on the configured endpoint.
    pub async fn listen(&self) -> Result<()> {
        if self.role() != RoleState::Idle {
            return Err(SynapseError::Hub("hub already started".to_string()));
        }
        let listener =
            TcpListener::bind((self.core.config.host.as_str(), self.core.config.port)).await?;
        let addr = listener.local_addr()?;
        if let Ok(mut slot) = self.core.local_addr.lock() {
            *slot = Some(addr);
        }
        self.core
            .roots
            .register(&self.core.config.host, addr.port(), &self.core);
        self.core.role_tx.send_replace(RoleState::Listening);
        self.core.ready_tx.send_replace(true);
        tokio::spawn(transport::tcp::serve(self.core.clone(), listener));
        info!(name = %self.core.config.name, %addr, "hub listening");
        self.publish_event(HubEvent::Listening { addr });
        self.publish_event(HubEvent::Ready);
        self.core.deliver_local(events::READY, None).await;
        Ok(())
    }

    /// Become a client of the configured endpoint. Returns once the
    /// connection machinery is running; readiness is signaled separately
    /// because reconnection keeps working in the background.
    pub async fn connect(&self) -> Result<()> {
        if self.role() != RoleState::Idle {
            return Err(SynapseError::Hub("hub already started".to_string()));
        }
        self.core.role_tx.send_replace(RoleState::Connected);
        tokio::spawn(run_gc(self.core.clone()));

        let cfg = &self.core.config;
        if let Some(root) = self.core.roots.lookup(&cfg.host, cfg.port) {
            if cfg.local || cfg.mode != ConnectMode::Netsocket {
                debug!(name = %cfg.name, "taking same-process shortcut");
                return transport::direct::connect(self.core.clone(), root).await;
            }
        }
        match cfg.mode {
            ConnectMode::Child => {
                let channel = self.core.child_channel.clone().ok_or_else(|| {
                    SynapseError::Configuration(
                        "child mode requires a process control channel".to_string(),
                    )
                })?;
                transport::child::connect(self.core.clone(), channel).await
            }
            _ => transport::tcp::connect(self.core.clone()).await,
        }
    }

    /// Listen, falling back to connecting when the endpoint is already
    /// served. Any other bind failure is returned unchanged.
    pub async fn start(&self) -> Result<()> {
        match self.listen().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_addr_taken() => {
                info!(
                    name = %self.core.config.name,
                    endpoint = %self.core.config.endpoint(),
                    "endpoint taken, starting as client"
                );
                self.connect().await
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the hub: leave the endpoint, drop the upstream connection and
    /// deregister everything. Scheduled reconnects abort when they fire.
    pub async fn stop(&self) -> Result<()> {
        let prev = self.core.role_tx.send_replace(RoleState::Stopped);
        self.core.ready_tx.send_replace(false);
        match prev {
            RoleState::Listening => {
                if let Some(addr) = self.local_addr() {
                    self.core.roots.unregister(&self.core.config.host, addr.port());
                }
            }
            RoleState::Connected => {
                self.core.upstream.write().await.take();
            }
            _ => {}
        }
        self.publish_event(HubEvent::Stopped);
        debug!(name = %self.core.config.name, "hub stopped");
        Ok(())
    }

    /// Emit an event with a payload.
    pub async fn emit<M: Serialize>(&self, event_type: &str, payload: M) -> Result<()> {
        let bytes = Bytes::from(serde_json::to_vec(&payload)?);
        self.core.emit_opt(event_type, Some(bytes)).await;
        Ok(())
    }

    /// Emit an event without a payload.
    pub async fn notify(&self, event_type: &str) -> Result<()> {
        self.core.emit_opt(event_type, None).await;
        Ok(())
    }

    /// Subscribe to an event type (wildcards allowed: `*` one segment,
    /// `**` any number).
    pub async fn on<M, F>(&self, event_type: &str, handler: F) -> Result<SubscriptionHandle>
    where
        M: for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
        F: Fn(M) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync + 'static,
    {
        let handler = typed_handler(event_type.to_string(), handler);
        let newly_tracked;
        let id;
        {
            let mut reg = self.core.registry.write().await;
            id = reg.insert_local(event_type, handler);
            newly_tracked = reg.track(event_type, None);
        }
        if newly_tracked {
            self.core.announce_on(Message::on(event_type)).await;
        }
        Ok(self.handle(id, event_type))
    }

    /// Subscribe to the subset of `origin_type` events whose payload maps
    /// to `selector_value` under `filter`. The (type, filter id, selector)
    /// key must be unused on this hub.
    pub async fn on_filter<M, F>(
        &self,
        origin_type: &str,
        selector_value: &str,
        filter_id: &str,
        filter: FilterSpec,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        M: for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
        F: Fn(M) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync + 'static,
    {
        filter.validate()?;
        let descriptor = BalancerDescriptor {
            origin_type: origin_type.to_string(),
            filter_id: filter_id.to_string(),
            selector_value: selector_value.to_string(),
            filter,
        };
        let composite = descriptor.composite_type();
        let handler = typed_handler(composite.clone(), handler);
        let id;
        {
            let mut reg = self.core.registry.write().await;
            id = reg.insert_balanced(descriptor.clone(), handler)?;
            reg.track(&composite, Some(descriptor.clone()));
        }
        self.core
            .announce_on(Message::on_balanced(composite.clone(), descriptor))
            .await;
        Ok(self.handle(id, &composite))
    }

    /// Serve a multiplexed child peer: messages fed to the returned sender
    /// are dispatched by a dedicated virtual session, replies travel as
    /// envelopes through `outbound`. Used by process supervisors.
    pub fn serve_child_peer(
        &self,
        name: &str,
        outbound: mpsc::Sender<Envelope>,
    ) -> mpsc::Sender<Message> {
        self.core.open_session(PeerSender::Child {
            name: name.to_string(),
            tx: outbound,
        })
    }

    fn handle(&self, id: Uuid, event_type: &str) -> SubscriptionHandle {
        SubscriptionHandle {
            id,
            event_type: event_type.to_string(),
            core: Arc::downgrade(&self.core),
        }
    }
}

fn typed_handler<M, F>(event_type: String, handler: F) -> LocalHandler
where
    M: for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
    F: Fn(M) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync + 'static,
{
    Arc::new(move |payload: Option<Bytes>| {
        let parsed: std::result::Result<M, serde_json::Error> = match &payload {
            Some(bytes) => serde_json::from_slice(bytes),
            None => serde_json::from_value(Value::Null),
        };
        match parsed {
            Ok(message) => handler(message),
            Err(e) => {
                warn!(event = %event_type, "failed to deserialize payload: {e}");
                Box::pin(async { Ok(()) })
            }
        }
    })
}

impl HubCore {
    pub(crate) fn role(&self) -> RoleState {
        *self.role_tx.borrow()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.role() == RoleState::Stopped
    }

    pub(crate) fn role_watch(&self) -> watch::Receiver<RoleState> {
        self.role_tx.subscribe()
    }

    pub(crate) fn reconnect_enabled(&self) -> bool {
        self.config.reconnect && !self.is_stopped()
    }

    /// The number of the reconnect attempt about to run.
    pub(crate) fn next_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn reset_attempts(&self) {
        self.attempt.store(1, Ordering::SeqCst);
    }

    pub(crate) fn clear_ready(&self) {
        self.ready_tx.send_replace(false);
    }

    pub(crate) async fn set_upstream(&self, link: Arc<dyn UpstreamLink>) {
        *self.upstream.write().await = Some(link);
    }

    pub(crate) async fn clear_upstream(&self) {
        self.upstream.write().await.take();
    }

    async fn upstream_link(&self) -> Option<Arc<dyn UpstreamLink>> {
        self.upstream.read().await.clone()
    }

    /// Announce a new local subscription upstream, outside a handshake.
    async fn announce_on(&self, message: Message) {
        if self.role() != RoleState::Connected {
            return;
        }
        if let Some(link) = self.upstream_link().await {
            if let Err(e) = link.send(message).await {
                debug!("failed to announce subscription upstream: {e}");
            }
        }
    }

    /// HELLO, replay every tracked subscription, then fence with ECHO.
    /// Readiness is signaled when the matching PUSH_EMIT arrives.
    pub(crate) async fn client_handshake(&self, link: &dyn UpstreamLink) -> Result<()> {
        link.send(Message::hello(self.config.name.clone())).await?;
        let tracked = self.registry.read().await.tracked();
        for (wire_type, balancer) in tracked {
            let message = match balancer {
                Some(descriptor) => Message::on_balanced(wire_type, descriptor),
                None => Message::on(wire_type),
            };
            link.send(message).await?;
        }
        link.send(Message::echo(events::READY_PROBE)).await
    }

    /// Inbound traffic of a client-role hub: PUSH_EMIT becomes a local
    /// emission; the ready probe completes the handshake fence.
    pub(crate) async fn handle_upstream_message(&self, message: Message) {
        match message.command {
            crate::message::Command::PushEmit { event_type } => {
                if event_type == events::READY_PROBE {
                    self.mark_ready().await;
                } else {
                    self.deliver_local(&event_type, message.payload).await;
                }
            }
            other => {
                debug!(?other, "ignoring unexpected upstream command");
            }
        }
    }

    async fn mark_ready(&self) {
        let was_ready = *self.ready_tx.borrow();
        self.ready_tx.send_replace(true);
        if was_ready {
            info!(name = %self.config.name, "hub reconnected");
            let _ = self.events_tx.send(HubEvent::Reconnected);
            self.emit_opt(events::RECONNECTED, None).await;
        } else {
            info!(name = %self.config.name, "hub ready");
            let _ = self.events_tx.send(HubEvent::Ready);
            self.emit_opt(events::READY, None).await;
        }
    }

    pub(crate) async fn notify_new_listener(&self, event_type: &str, peer: &str) {
        let _ = self.events_tx.send(HubEvent::NewListener {
            event_type: event_type.to_string(),
            hub: peer.to_string(),
        });
        let payload = json!({ "type": event_type, "hub": peer });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                self.emit_opt(events::NEW_LISTENER, Some(Bytes::from(bytes)))
                    .await
            }
            Err(e) => debug!("failed to encode listener notification: {e}"),
        }
    }

    /// The emit surface shared by every role: clients send EMIT upstream,
    /// servers fan out under their own namespace, and local processing is
    /// always preserved.
    pub(crate) async fn emit_opt(&self, event_type: &str, payload: Option<Bytes>) {
        match self.role() {
            RoleState::Connected => {
                if let Some(link) = self.upstream_link().await {
                    let message = Message::emit(event_type, payload.clone());
                    if let Err(e) = link.send(message).await {
                        debug!(event = %event_type, "emit not sent upstream: {e}");
                    }
                }
            }
            RoleState::Listening => {
                let event = namespaced(&self.config.name, event_type);
                self.dispatch_event(&event, payload.clone(), None).await;
            }
            _ => {}
        }
        self.deliver_local(event_type, payload).await;
    }

    /// Local delivery plus fan-out to every other interested session.
    pub(crate) async fn dispatch_event(
        &self,
        event_type: &str,
        payload: Option<Bytes>,
        skip: Option<SessionId>,
    ) {
        self.deliver_local(event_type, payload.clone()).await;
        self.remote_fanout(event_type, payload, skip).await;
    }

    /// Invoke matching local handlers and evaluate balanced fallbacks.
    /// Payloads are deserialized lazily: predicate evaluation parses the
    /// payload once, and only when a balanced path matched at all.
    pub(crate) async fn deliver_local(&self, event_type: &str, payload: Option<Bytes>) {
        let (plain, balanced, services) = {
            let reg = self.registry.read().await;
            let mut plain = Vec::new();
            let mut balanced = Vec::new();
            for sub in reg.matching(event_type) {
                match sub.sink {
                    Sink::Local(handler) => plain.push(handler),
                    Sink::Balanced {
                        descriptor,
                        handler,
                    } => {
                        // plain listeners take precedence over balanced
                        // fallback delivery
                        if !reg.has_plain_exact(&descriptor.origin_type) {
                            balanced.push((descriptor, handler));
                        }
                    }
                    Sink::Remote { .. } => {}
                }
            }
            let services = if reg.has_plain_matching(event_type) {
                Vec::new()
            } else {
                reg.service_matching(event_type)
            };
            (plain, balanced, services)
        };

        for handler in plain {
            spawn_handler(event_type, handler, payload.clone());
        }

        if balanced.is_empty() && services.is_empty() {
            return;
        }
        let value = parse_payload(payload.as_ref());
        for (descriptor, handler) in balanced {
            if descriptor.selects(&value, &self.filters) {
                spawn_handler(event_type, handler, payload.clone());
            }
        }
        for (composite, descriptor) in services {
            if descriptor.selects(&value, &self.filters) {
                self.remote_fanout(&composite, payload.clone(), None).await;
            }
        }
    }

    /// Forward to every interested downstream session, reusing one cached
    /// frame for all byte-stream recipients.
    async fn remote_fanout(&self, event_type: &str, payload: Option<Bytes>, skip: Option<SessionId>) {
        let targets: Vec<(SessionId, PeerSender)> = {
            let reg = self.registry.read().await;
            reg.matching(event_type)
                .into_iter()
                .filter_map(|sub| match sub.sink {
                    Sink::Remote { session, sender, .. } if Some(session) != skip => {
                        Some((session, sender))
                    }
                    _ => None,
                })
                .collect()
        };
        if targets.is_empty() {
            return;
        }
        let frame = CachedFrame::new(Message::push_emit(event_type, payload));
        for (session, sender) in targets {
            if let Err(e) = sender.send_cached(&frame).await {
                debug!(%session, event = %event_type, "fan-out send failed: {e}");
            }
        }
    }

    /// Spawn the dispatch loop of a new session fed by the returned sender.
    /// Closing the channel deregisters the peer (BYE semantics).
    pub(crate) fn open_session(self: &Arc<Self>, sender: PeerSender) -> mpsc::Sender<Message> {
        let (tx, mut rx) = mpsc::channel(self.config.inbound_capacity);
        let mut session = Session::new(self.clone(), sender);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                session.dispatch(message).await;
            }
            session.close().await;
        });
        tx
    }
}

fn parse_payload(payload: Option<&Bytes>) -> Value {
    match payload {
        None => Value::Null,
        Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
            debug!("unparseable payload for predicate evaluation: {e}");
            Value::Null
        }),
    }
}

fn spawn_handler(event_type: &str, handler: LocalHandler, payload: Option<Bytes>) {
    let event_type = event_type.to_string();
    tokio::spawn(async move {
        if let Err(e) = handler(payload).await {
            warn!(event = %event_type, "handler failed: {e}");
        }
    });
}

/// Reconnect backoff: attempt `k` waits `base * k²`.
pub(crate) fn backoff_delay(base: std::time::Duration, attempt: u32) -> std::time::Duration {
    base * attempt.saturating_mul(attempt)
}

/// Periodically tell the upstream about event types nobody listens to
/// anymore. Realtime notification is unnecessary; receiving events for a
/// little while after the last listener went away is fine.
async fn run_gc(core: Arc<HubCore>) {
    let mut role_rx = core.role_watch();
    let mut interval = tokio::time::interval(core.config.gc_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    while !core.is_stopped() {
        tokio::select! {
            _ = interval.tick() => {
                let dead = core.registry.write().await.sweep_dead_tracked();
                if dead.is_empty() {
                    continue;
                }
                if let Some(link) = core.upstream_link().await {
                    for wire_type in dead {
                        debug!(event = %wire_type, "gc: no listeners left, sending OFF");
                        if let Err(e) = link.send(Message::off(wire_type)).await {
                            debug!("gc OFF not sent: {e}");
                        }
                    }
                }
            }
            changed = role_rx.changed() => {
                if changed.is_err() || *role_rx.borrow() == RoleState::Stopped {
                    break;
                }
            }
        }
    }
}
