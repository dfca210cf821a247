//! Per-hub subscription registry
//!
//! Maps event-type patterns to local handlers and peer-forwarding sinks,
//! tracks which types have been announced upstream (for handshake replay
//! and garbage collection), enforces balanced-subscription key uniqueness,
//! and owns the hub-level service-listener table for balanced fan-out.
//!
//! Patterns are `::`-delimited; `*` matches exactly one segment and `**`
//! matches any number of segments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use uuid::Uuid;

use crate::balancer::BalancerDescriptor;
use crate::error::{Result, SynapseError};
use crate::message::DELIMITER;
use crate::session::{PeerSender, SessionId};

/// Type-erased local handler; receives the raw payload bytes, if any.
pub(crate) type LocalHandler =
    Arc<dyn Fn(Option<Bytes>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Where a matching event goes.
#[derive(Clone)]
pub(crate) enum Sink {
    /// Plain local handler.
    Local(LocalHandler),
    /// Balanced local handler; fires only when its predicate selects the
    /// payload and no plain listener takes precedence.
    Balanced {
        descriptor: BalancerDescriptor,
        handler: LocalHandler,
    },
    /// Forwarder towards a downstream session.
    Remote {
        session: SessionId,
        sender: PeerSender,
        balanced: bool,
    },
}

#[derive(Clone)]
pub(crate) struct Subscription {
    pub id: Uuid,
    pub sink: Sink,
}

/// One shared balanced forwarder, installed on an origin type and
/// refcounted across the sessions that registered it.
pub(crate) struct ServiceListener {
    pub descriptor: BalancerDescriptor,
    pub sessions: HashSet<SessionId>,
}

#[derive(Default)]
pub(crate) struct Registry {
    /// Pattern → subscriptions.
    subs: HashMap<String, Vec<Subscription>>,
    /// Wire types announced upstream, with the descriptor for balanced ones.
    tracked: HashMap<String, Option<BalancerDescriptor>>,
    /// Composite wire type → shared service listener.
    service: HashMap<String, ServiceListener>,
    /// Uniqueness set for (origin type, filter id, selector value).
    balanced_keys: HashSet<(String, String, String)>,
}

impl Registry {
    pub fn insert_local(&mut self, pattern: &str, handler: LocalHandler) -> Uuid {
        let id = Uuid::new_v4();
        self.subs.entry(pattern.to_string()).or_default().push(Subscription {
            id,
            sink: Sink::Local(handler),
        });
        id
    }

    /// Register a balanced local subscription under both its composite wire
    /// type (for deliveries from the serving peer) and its origin pattern
    /// (for locally emitted origin events). Fails synchronously when the
    /// composite key is already taken on this hub.
    pub fn insert_balanced(
        &mut self,
        descriptor: BalancerDescriptor,
        handler: LocalHandler,
    ) -> Result<Uuid> {
        let key = descriptor.key();
        if self.balanced_keys.contains(&key) {
            return Err(SynapseError::DuplicateFilter(descriptor.composite_type()));
        }
        self.balanced_keys.insert(key);
        let id = Uuid::new_v4();
        for pattern in [descriptor.composite_type(), descriptor.origin_type.clone()] {
            self.subs.entry(pattern).or_default().push(Subscription {
                id,
                sink: Sink::Balanced {
                    descriptor: descriptor.clone(),
                    handler: handler.clone(),
                },
            });
        }
        Ok(id)
    }

    pub fn insert_remote(
        &mut self,
        pattern: &str,
        session: SessionId,
        sender: PeerSender,
        balanced: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.subs.entry(pattern.to_string()).or_default().push(Subscription {
            id,
            sink: Sink::Remote {
                session,
                sender,
                balanced,
            },
        });
        id
    }

    /// Remove a subscription everywhere it is registered, releasing its
    /// balanced key if it had one.
    pub fn remove_by_id(&mut self, id: Uuid) {
        let mut freed: Option<(String, String, String)> = None;
        self.subs.retain(|_, list| {
            list.retain(|s| {
                if s.id != id {
                    return true;
                }
                if let Sink::Balanced { descriptor, .. } = &s.sink {
                    freed = Some(descriptor.key());
                }
                false
            });
            !list.is_empty()
        });
        if let Some(key) = freed {
            self.balanced_keys.remove(&key);
        }
    }

    /// Remove one session's forwarders under an exact wire type.
    pub fn remove_session_type(&mut self, session: SessionId, wire_type: &str) {
        if let Some(list) = self.subs.get_mut(wire_type) {
            list.retain(|s| !matches!(&s.sink, Sink::Remote { session: sid, .. } if *sid == session));
            if list.is_empty() {
                self.subs.remove(wire_type);
            }
        }
    }

    /// Remove every forwarder a session ever installed.
    pub fn remove_session(&mut self, session: SessionId) {
        self.subs.retain(|_, list| {
            list.retain(
                |s| !matches!(&s.sink, Sink::Remote { session: sid, .. } if *sid == session),
            );
            !list.is_empty()
        });
    }

    /// Install or join the shared service listener for a composite type.
    pub fn service_add(
        &mut self,
        composite: String,
        descriptor: BalancerDescriptor,
        session: SessionId,
    ) {
        self.service
            .entry(composite)
            .or_insert_with(|| ServiceListener {
                descriptor,
                sessions: HashSet::new(),
            })
            .sessions
            .insert(session);
    }

    /// Release one session's reference on the listener keyed by exactly
    /// this composite type.
    pub fn service_release(&mut self, composite: &str, session: SessionId) {
        if let Some(entry) = self.service.get_mut(composite) {
            entry.sessions.remove(&session);
            if entry.sessions.is_empty() {
                self.service.remove(composite);
            }
        }
    }

    /// Release every service-listener reference a session holds.
    pub fn service_release_session(&mut self, session: SessionId) {
        self.service.retain(|_, entry| {
            entry.sessions.remove(&session);
            !entry.sessions.is_empty()
        });
    }

    /// All subscriptions whose pattern matches `event_type`, deduplicated.
    pub fn matching(&self, event_type: &str) -> Vec<Subscription> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (pattern, list) in &self.subs {
            if pattern_matches(pattern, event_type) {
                for sub in list {
                    if seen.insert(sub.id) {
                        out.push(sub.clone());
                    }
                }
            }
        }
        out
    }

    /// Service listeners whose origin type matches `event_type`.
    pub fn service_matching(&self, event_type: &str) -> Vec<(String, BalancerDescriptor)> {
        self.service
            .iter()
            .filter(|(_, entry)| pattern_matches(&entry.descriptor.origin_type, event_type))
            .map(|(composite, entry)| (composite.clone(), entry.descriptor.clone()))
            .collect()
    }

    /// Any plain (non-balanced) listener matching this concrete event?
    pub fn has_plain_matching(&self, event_type: &str) -> bool {
        self.subs.iter().any(|(pattern, list)| {
            pattern_matches(pattern, event_type) && list.iter().any(|s| s.is_plain())
        })
    }

    /// Any plain listener registered under exactly this pattern?
    pub fn has_plain_exact(&self, pattern: &str) -> bool {
        self.subs
            .get(pattern)
            .map(|list| list.iter().any(|s| s.is_plain()))
            .unwrap_or(false)
    }

    /// Record a wire type as announced upstream. Returns true the first
    /// time a type is tracked.
    pub fn track(&mut self, wire_type: &str, balancer: Option<BalancerDescriptor>) -> bool {
        self.tracked.insert(wire_type.to_string(), balancer).is_none()
    }

    /// Snapshot of everything to replay during a handshake.
    pub fn tracked(&self) -> Vec<(String, Option<BalancerDescriptor>)> {
        self.tracked
            .iter()
            .map(|(t, d)| (t.clone(), d.clone()))
            .collect()
    }

    /// Drop tracked types that no longer have a live local listener and
    /// return them so the caller can send OFF upstream. Liveness is judged
    /// by the kind of listener that caused the announcement: a plain
    /// announcement needs a plain local listener, a balanced one needs its
    /// balanced subscription (which is also registered under its origin
    /// pattern and must not keep the plain announcement alive).
    pub fn sweep_dead_tracked(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .tracked
            .iter()
            .filter(|(wire_type, balancer)| {
                let live = self.subs.get(*wire_type).is_some_and(|list| {
                    list.iter().any(|s| match balancer {
                        None => matches!(s.sink, Sink::Local(_)),
                        Some(_) => matches!(s.sink, Sink::Balanced { .. }),
                    })
                });
                !live
            })
            .map(|(wire_type, _)| wire_type.clone())
            .collect();
        for wire_type in &dead {
            self.tracked.remove(wire_type);
        }
        dead
    }
}

impl Subscription {
    fn is_plain(&self) -> bool {
        match &self.sink {
            Sink::Local(_) => true,
            Sink::Remote { balanced, .. } => !balanced,
            Sink::Balanced { .. } => false,
        }
    }
}

/// Segment-wise wildcard match: `*` matches one segment, `**` any number.
pub(crate) fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == event_type {
        return true;
    }
    let p: Vec<&str> = pattern.split(DELIMITER).collect();
    let e: Vec<&str> = event_type.split(DELIMITER).collect();
    fn matches(p: &[&str], e: &[&str]) -> bool {
        match p.split_first() {
            None => e.is_empty(),
            Some((&"**", rest)) => (0..=e.len()).any(|i| matches(rest, &e[i..])),
            Some((seg, rest)) => match e.split_first() {
                Some((ev, erest)) => (*seg == "*" || seg == ev) && matches(rest, erest),
                None => false,
            },
        }
    }
    matches(&p, &e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(pattern_matches("a::b", "a::b"));
        assert!(pattern_matches("*::b", "a::b"));
        assert!(!pattern_matches("*::b", "a::c"));
        assert!(!pattern_matches("*::b", "b"));
        assert!(pattern_matches("**", "a::b::c"));
        assert!(pattern_matches("a::**", "a::b::c"));
        assert!(pattern_matches("**::c", "a::b::c"));
        assert!(!pattern_matches("a::*", "a::b::c"));
    }

    fn noop_handler() -> LocalHandler {
        Arc::new(|_| Box::pin(async { Ok(()) }))
    }

    fn descriptor() -> BalancerDescriptor {
        BalancerDescriptor {
            origin_type: "*::jobs".into(),
            filter_id: "shard".into(),
            selector_value: "0".into(),
            filter: crate::balancer::FilterSpec::Equality {
                pointer: "/n".into(),
            },
        }
    }

    #[test]
    fn duplicate_balanced_key_fails_synchronously() {
        let mut reg = Registry::default();
        reg.insert_balanced(descriptor(), noop_handler()).unwrap();
        let err = reg.insert_balanced(descriptor(), noop_handler()).unwrap_err();
        assert!(matches!(err, SynapseError::DuplicateFilter(_)));
    }

    #[test]
    fn removing_balanced_sub_frees_its_key() {
        let mut reg = Registry::default();
        let id = reg.insert_balanced(descriptor(), noop_handler()).unwrap();
        reg.remove_by_id(id);
        assert!(reg.insert_balanced(descriptor(), noop_handler()).is_ok());
    }

    #[test]
    fn sweep_reports_types_without_local_listeners() {
        let mut reg = Registry::default();
        let id = reg.insert_local("a::b", noop_handler());
        reg.track("a::b", None);
        assert!(reg.sweep_dead_tracked().is_empty());
        reg.remove_by_id(id);
        assert_eq!(reg.sweep_dead_tracked(), vec!["a::b".to_string()]);
        // once swept, the type is no longer tracked
        assert!(reg.sweep_dead_tracked().is_empty());
    }

    #[test]
    fn plain_lookup_ignores_balanced_subs() {
        let mut reg = Registry::default();
        reg.insert_balanced(descriptor(), noop_handler()).unwrap();
        assert!(!reg.has_plain_matching("peer::jobs"));
        reg.insert_local("*::jobs", noop_handler());
        assert!(reg.has_plain_matching("peer::jobs"));
        assert!(reg.has_plain_exact("*::jobs"));
    }
}
