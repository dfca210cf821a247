//! Forking and supervising child hub processes
//!
//! The supervisor forks child processes, bridges their stdio control
//! channel into virtual sessions on the parent hub (demultiplexed by
//! logical hub name, lazily created on first HELLO), and restarts children
//! that exit abnormally. The respawn delay grows with the restart count
//! divided by the child's observed lifetime, so a child that crashes
//! quickly backs off harder than one that ran for a while.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Notify, RwLock, mpsc};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use synapse_core::codec::{EnvelopeCodec, encode_envelope};
use synapse_core::events::{self, HubEvent};
use synapse_core::hub::Hub;
use synapse_core::message::{Command as WireCommand, Envelope, Message};

use crate::error::{Result, SupervisorError};

/// Configuration for the process supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Respawn budget per child; a crashing child that exceeds it is
    /// given up on.
    pub max_restarts: u32,

    /// Capacity of the parent → child envelope channel.
    pub channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 8,
            channel_capacity: 64,
        }
    }
}

/// A fork request: run `script` with `params` as a child hub process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkSpec {
    pub name: String,
    pub script: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Snapshot of one supervised child process.
#[derive(Debug, Clone)]
pub struct ChildInfo {
    pub name: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
}

struct ChildHandle {
    name: String,
    started_at: DateTime<Utc>,
    restart_count: u32,
    kill: Arc<Notify>,
    killed: Arc<AtomicBool>,
}

struct SupervisorInner {
    hub: Hub,
    config: SupervisorConfig,
    children: RwLock<HashMap<u32, ChildHandle>>,
}

/// Supervisor attached to a listening hub.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    pub fn new(hub: Hub) -> Self {
        Self::with_config(hub, SupervisorConfig::default())
    }

    pub fn with_config(hub: Hub, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                hub,
                config,
                children: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    /// React to fork requests traveling on the bus, so child hubs can ask
    /// the master to fork further children.
    pub async fn attach(&self) -> Result<()> {
        let sup = self.clone();
        self.inner
            .hub
            .on(
                &format!("*::{}", events::FORK),
                move |spec: ForkSpec| {
                    let sup = sup.clone();
                    Box::pin(async move {
                        if let Err(e) = sup.fork(spec).await {
                            warn!("fork request rejected: {e}");
                        }
                        Ok(())
                    })
                },
            )
            .await?;
        Ok(())
    }

    /// Fork a child process and supervise it. Only the master (listening
    /// hub) is allowed to fork.
    pub async fn fork(&self, spec: ForkSpec) -> Result<()> {
        if !self.inner.hub.is_listening() {
            return Err(SupervisorError::NotListening);
        }
        if !spec.script.exists() {
            return Err(SupervisorError::BinaryNotFound(
                spec.script.display().to_string(),
            ));
        }
        let sup = self.clone();
        tokio::spawn(async move { sup.run_child(spec).await });
        Ok(())
    }

    /// The children currently running.
    pub async fn children(&self) -> Vec<ChildInfo> {
        self.inner
            .children
            .read()
            .await
            .iter()
            .map(|(pid, c)| ChildInfo {
                name: c.name.clone(),
                pid: *pid,
                started_at: c.started_at,
                restart_count: c.restart_count,
            })
            .collect()
    }

    /// Force-kill every tracked child.
    pub async fn shutdown(&self) {
        let children = self.inner.children.read().await;
        for child in children.values() {
            child.killed.store(true, Ordering::SeqCst);
            child.kill.notify_waiters();
        }
    }

    async fn run_child(&self, spec: ForkSpec) {
        let mut restart_count: u32 = 0;
        loop {
            let started = Instant::now();
            let exit = match self.run_once(&spec, restart_count).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(name = %spec.name, "failed to start child: {e}");
                    break;
                }
            };

            self.announce(
                events::FORK_EXIT,
                HubEvent::ForkExit {
                    name: spec.name.clone(),
                    code: exit.code,
                },
                json!({ "name": spec.name, "exitcode": exit.code }),
            )
            .await;

            if exit.killed || exit.code == Some(0) || !self.inner.hub.is_listening() {
                break;
            }

            // abnormal termination: looks recoverable, restart throttled
            restart_count += 1;
            if restart_count > self.inner.config.max_restarts {
                warn!(name = %spec.name, restart_count, "restart budget exhausted");
                self.announce(
                    events::FORK_GIVEUP,
                    HubEvent::ForkGiveup {
                        name: spec.name.clone(),
                        restarts: restart_count,
                    },
                    json!({ "name": spec.name, "restarts": restart_count }),
                )
                .await;
                break;
            }
            let delay = respawn_delay(restart_count, started.elapsed());
            info!(name = %spec.name, restart_count, ?delay, "respawning child");
            tokio::time::sleep(delay).await;
            if !self.inner.hub.is_listening() {
                break;
            }
        }
    }

    async fn run_once(&self, spec: &ForkSpec, restart_count: u32) -> Result<ChildExit> {
        let mut child = Command::new(&spec.script)
            .args(&spec.params)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Process("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Process("child stdout unavailable".into()))?;

        let kill = Arc::new(Notify::new());
        let killed = Arc::new(AtomicBool::new(false));
        self.inner.children.write().await.insert(
            pid,
            ChildHandle {
                name: spec.name.clone(),
                started_at: Utc::now(),
                restart_count,
                kill: kill.clone(),
                killed: killed.clone(),
            },
        );
        debug!(name = %spec.name, pid, restart_count, "child started");
        self.announce(
            events::FORK_START,
            HubEvent::ForkStart {
                name: spec.name.clone(),
                pid,
            },
            json!({ "name": spec.name, "pid": pid }),
        )
        .await;

        let env_tx = spawn_envelope_writer(stdin, self.inner.config.channel_capacity);
        let mut framed = FramedRead::new(stdout, EnvelopeCodec);
        // logical hub name → virtual session inbound
        let mut clients: HashMap<String, mpsc::Sender<Message>> = HashMap::new();
        let mut stdout_open = true;

        let code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code());
                }
                _ = kill.notified() => {
                    let _ = child.start_kill();
                }
                frame = framed.next(), if stdout_open => match frame {
                    Some(Ok(envelope)) => {
                        self.route_envelope(&mut clients, &env_tx, envelope).await;
                    }
                    Some(Err(e)) => {
                        warn!(name = %spec.name, "child channel corrupt, killing: {e}");
                        let _ = child.start_kill();
                        stdout_open = false;
                    }
                    None => stdout_open = false,
                },
            }
        };

        // when the process dies, every hub it hosted says goodbye
        clients.clear();
        self.inner.children.write().await.remove(&pid);
        Ok(ChildExit {
            code,
            killed: killed.load(Ordering::SeqCst),
        })
    }

    async fn route_envelope(
        &self,
        clients: &mut HashMap<String, mpsc::Sender<Message>>,
        env_tx: &mpsc::Sender<Envelope>,
        envelope: Envelope,
    ) {
        if let Some(tx) = clients.get(&envelope.name) {
            if tx.send(envelope.message).await.is_err() {
                debug!(name = %envelope.name, "virtual session gone, dropping message");
            }
            return;
        }
        if matches!(envelope.message.command, WireCommand::Hello { .. }) {
            let tx = self
                .inner
                .hub
                .serve_child_peer(&envelope.name, env_tx.clone());
            if tx.send(envelope.message).await.is_ok() {
                clients.insert(envelope.name, tx);
            }
        } else {
            debug!(name = %envelope.name, "message before HELLO, dropping");
        }
    }

    pub(crate) async fn announce(
        &self,
        event_type: &str,
        event: HubEvent,
        payload: serde_json::Value,
    ) {
        self.inner.hub.publish_event(event);
        if let Err(e) = self.inner.hub.emit(event_type, payload).await {
            debug!(event = %event_type, "lifecycle emit failed: {e}");
        }
    }

    pub(crate) fn hub_ready(&self) -> bool {
        self.inner.hub.is_ready()
    }
}

struct ChildExit {
    code: Option<i32>,
    killed: bool,
}

fn spawn_envelope_writer(
    mut stdin: tokio::process::ChildStdin,
    capacity: usize,
) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(capacity);
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let bytes = match encode_envelope(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("failed to encode envelope: {e}");
                    continue;
                }
            };
            if stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Delay before respawning a crashed child: restart count divided by the
/// observed lifetime in 10-second units. Crashes shortly after start yield
/// a larger delay per restart, throttling crash loops.
pub fn respawn_delay(restart_count: u32, lifetime: Duration) -> Duration {
    let lifetime_units = (lifetime.as_secs_f64() / 10.0).max(1e-9);
    let millis = (f64::from(restart_count) / lifetime_units).round();
    Duration::from_millis(millis.min(600_000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respawn_delay_throttles_fast_crashes_harder() {
        let slow = respawn_delay(3, Duration::from_secs(60));
        let fast = respawn_delay(3, Duration::from_millis(200));
        assert!(fast > slow, "fast crash {fast:?} should wait longer than {slow:?}");
    }

    #[test]
    fn respawn_delay_grows_with_restart_count() {
        let lifetime = Duration::from_secs(5);
        let first = respawn_delay(1, lifetime);
        let fifth = respawn_delay(5, lifetime);
        assert!(fifth > first);
    }

    #[test]
    fn respawn_delay_matches_lifetime_unit_formula() {
        // 20 s lifetime = 2 units; 4 restarts / 2 = 2 ms
        assert_eq!(
            respawn_delay(4, Duration::from_secs(20)),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn respawn_delay_is_capped() {
        let d = respawn_delay(u32::MAX, Duration::from_nanos(1));
        assert!(d <= Duration::from_secs(600));
    }
}
