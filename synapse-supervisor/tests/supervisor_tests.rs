//! Supervisor gating tests: who may fork and spawn, and when.

use std::path::PathBuf;

use synapse_core::config::HubConfig;
use synapse_core::hub::Hub;
use synapse_supervisor::{ForkSpec, SpawnSpec, Supervisor, SupervisorError};

fn idle_hub(name: &str) -> Hub {
    Hub::builder().config(HubConfig::new(name)).build()
}

#[tokio::test]
async fn only_a_listening_hub_may_fork() {
    let sup = Supervisor::new(idle_hub("master"));
    let err = sup
        .fork(ForkSpec {
            name: "child".into(),
            script: PathBuf::from("/bin/true"),
            params: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotListening));
}

#[tokio::test]
async fn fork_rejects_a_missing_binary() {
    let mut cfg = HubConfig::new("master");
    cfg.port = 0;
    let hub = Hub::builder().config(cfg).build();
    hub.listen().await.unwrap();

    let sup = Supervisor::new(hub.clone());
    let err = sup
        .fork(ForkSpec {
            name: "child".into(),
            script: PathBuf::from("/definitely/not/here"),
            params: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::BinaryNotFound(_)));
    assert!(sup.children().await.is_empty());

    hub.stop().await.unwrap();
}

#[tokio::test]
async fn spawn_requires_a_ready_hub() {
    let sup = Supervisor::new(idle_hub("master"));
    let err = sup
        .spawn(vec![SpawnSpec::new("w1", "/bin/true")])
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotReady));
}
