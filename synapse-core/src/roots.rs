//! Root-hub registry
//!
//! Maps listening endpoints to the hubs serving them within one runtime so
//! a later hub connecting to the same endpoint can take the in-process
//! shortcut instead of a socket. The registry is an explicitly owned object
//! injected into each hub rather than ambient process state, which lets
//! independent runtimes (and tests) coexist in one process. An entry exists
//! exactly while its hub is listening.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::hub::HubCore;

/// Endpoint → root hub registry, cheap to clone and share.
#[derive(Clone, Default)]
pub struct RootRegistry {
    inner: Arc<Mutex<HashMap<(String, u16), Weak<HubCore>>>>,
}

impl RootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, host: &str, port: u16, hub: &Arc<HubCore>) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert((host.to_string(), port), Arc::downgrade(hub));
        }
    }

    pub(crate) fn unregister(&self, host: &str, port: u16) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&(host.to_string(), port));
        }
    }

    pub(crate) fn lookup(&self, host: &str, port: u16) -> Option<Arc<HubCore>> {
        let map = self.inner.lock().ok()?;
        map.get(&(host.to_string(), port)).and_then(Weak::upgrade)
    }
}

impl fmt::Debug for RootRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("RootRegistry").field("len", &len).finish()
    }
}
