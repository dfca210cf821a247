//! Spawning a list of child hubs
//!
//! The caller hands over a list of `{name, src, host?, port?, ...options}`
//! entries; the supervisor forks each as a child hub process and signals
//! completion only after every child has reported ready under its own name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use synapse_core::config::HubConfig;
use synapse_core::events::{self, HubEvent};

use crate::error::{Result, SupervisorError};
use crate::supervisor::{ForkSpec, Supervisor};

/// One child hub to spawn. Options beyond the reserved keys are passed to
/// the child binary as `--key value` flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub name: String,
    pub src: PathBuf,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, flatten)]
    pub options: BTreeMap<String, Value>,
}

impl SpawnSpec {
    pub fn new(name: impl Into<String>, src: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            src: src.into(),
            host: None,
            port: None,
            options: BTreeMap::new(),
        }
    }
}

/// Reserved keys become `--bus-*` flags, everything else passes through.
pub(crate) fn cli_options(spec: &SpawnSpec, hub: &HubConfig) -> Vec<String> {
    let mut cli = vec![
        "--bus-name".to_string(),
        spec.name.clone(),
        "--bus-host".to_string(),
        spec.host.clone().unwrap_or_else(|| hub.host.clone()),
        "--bus-port".to_string(),
        spec.port.unwrap_or(hub.port).to_string(),
        "--bus-mode".to_string(),
        "child".to_string(),
    ];
    for (key, value) in &spec.options {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        cli.push(format!("--{key}"));
        cli.push(rendered);
    }
    cli
}

impl Supervisor {
    /// Fork every listed child hub and wait until each has emitted its
    /// ready notification back to the parent, under its own name.
    pub async fn spawn(&self, specs: Vec<SpawnSpec>) -> Result<()> {
        if !self.hub_ready() {
            return Err(SupervisorError::NotReady);
        }
        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

        // install the readiness waiters before forking so a fast child
        // cannot report ready unheard
        let mut waiters = Vec::new();
        for spec in &specs {
            let ready_type = format!("{}::{}", spec.name, events::READY);
            let (tx, rx) = mpsc::channel::<()>(1);
            let handle = self
                .hub()
                .on(&ready_type, move |_: Value| {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.try_send(());
                        Ok(())
                    })
                })
                .await?;
            waiters.push((handle, rx));
        }

        for spec in &specs {
            self.announce(
                events::SPAWNING,
                HubEvent::Spawning {
                    name: spec.name.clone(),
                },
                json!(spec.name),
            )
            .await;
            let params = cli_options(spec, self.hub().config());
            self.fork(ForkSpec {
                name: spec.name.clone(),
                script: spec.src.clone(),
                params,
            })
            .await?;
        }

        self.announce(
            events::CHILDREN_SPAWNED,
            HubEvent::ChildrenSpawned {
                names: names.clone(),
            },
            json!(names),
        )
        .await;

        for (handle, mut rx) in waiters {
            if rx.recv().await.is_none() {
                debug!("readiness waiter closed early");
            }
            let _ = handle.unsubscribe().await;
        }

        self.announce(
            events::CHILDREN_READY,
            HubEvent::ChildrenReady {
                names: names.clone(),
            },
            json!(names),
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_keys_map_to_bus_flags() {
        let mut spec = SpawnSpec::new("worker", "/bin/worker");
        spec.port = Some(4070);
        spec.options.insert("shards".into(), json!(4));
        spec.options
            .insert("label".into(), Value::String("blue".into()));
        let hub = HubConfig::new("master");
        let cli = cli_options(&spec, &hub);
        assert_eq!(
            &cli[..8],
            &[
                "--bus-name",
                "worker",
                "--bus-host",
                "127.0.0.1",
                "--bus-port",
                "4070",
                "--bus-mode",
                "child"
            ]
        );
        assert!(cli.windows(2).any(|w| w == ["--label", "blue"]));
        assert!(cli.windows(2).any(|w| w == ["--shards", "4"]));
    }

    #[test]
    fn spawn_spec_collects_extra_options() {
        let spec: SpawnSpec = serde_json::from_value(json!({
            "name": "w1",
            "src": "/bin/w",
            "port": 5000,
            "color": "red",
            "retries": 3
        }))
        .unwrap();
        assert_eq!(spec.port, Some(5000));
        assert_eq!(spec.options.get("color"), Some(&json!("red")));
        assert_eq!(spec.options.get("retries"), Some(&json!(3)));
    }
}
