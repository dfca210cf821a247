//! Load-balancing filters
//!
//! A balanced subscription receives only the events whose payload maps to
//! the subscriber's selector value, letting several hubs split one event
//! stream without every hub seeing every event. The predicate is a closed,
//! enumerable [`FilterSpec`] selected at subscribe time; it is evaluated on
//! the serving peer (so only matching events cross the wire) and again on
//! the subscribing hub (required for in-process connections, which bypass
//! serving-side filtering).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{Result, SynapseError};

/// Predicate evaluated against an event payload; the result is compared to
/// the subscription's selector value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FilterSpec {
    /// The value at a JSON pointer, stringified.
    Equality { pointer: String },
    /// Bucket index of a numeric field against ascending boundaries.
    Range { pointer: String, boundaries: Vec<f64> },
    /// Stable hash bucket of the field value, `0..buckets`.
    HashBucket { pointer: String, buckets: u32 },
    /// Predicate registered by id in the hub's [`FilterRegistry`].
    Custom { id: String },
}

impl FilterSpec {
    /// Reject specs that can never produce a selector value.
    pub(crate) fn validate(&self) -> Result<()> {
        match self {
            FilterSpec::HashBucket { buckets: 0, .. } => Err(SynapseError::InvalidFilter(
                "hash bucket count must be nonzero".into(),
            )),
            FilterSpec::Range { boundaries, .. }
                if boundaries.windows(2).any(|w| w[0] > w[1]) =>
            {
                Err(SynapseError::InvalidFilter(
                    "range boundaries must be ascending".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Evaluate against a payload. `None` means the event selects nothing
    /// (missing field, wrong type, unknown custom id).
    pub fn evaluate(&self, payload: &Value, filters: &FilterRegistry) -> Option<String> {
        match self {
            FilterSpec::Equality { pointer } => payload.pointer(pointer).map(stringify),
            FilterSpec::Range {
                pointer,
                boundaries,
            } => {
                let v = payload.pointer(pointer)?.as_f64()?;
                let bucket = boundaries.iter().take_while(|b| v >= **b).count();
                Some(bucket.to_string())
            }
            FilterSpec::HashBucket { pointer, buckets } => {
                let v = payload.pointer(pointer).map(stringify)?;
                let digest = Sha256::digest(v.as_bytes());
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest[..8]);
                Some((u64::from_be_bytes(head) % u64::from(*buckets)).to_string())
            }
            FilterSpec::Custom { id } => match filters.get(id) {
                Some(f) => f(payload),
                None => {
                    warn!(id = %id, "unknown custom filter id; event selects nothing");
                    None
                }
            },
        }
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identifies one balanced subscription on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerDescriptor {
    /// The event type the origin events are emitted under.
    pub origin_type: String,
    /// Globally unique id for this filter.
    pub filter_id: String,
    /// The selector value this subscriber handles.
    pub selector_value: String,
    /// The predicate, as a closed spec rather than shipped code.
    #[serde(flatten)]
    pub filter: FilterSpec,
}

impl BalancerDescriptor {
    /// The composite wire type for this subscription,
    /// `origin_type + filter_id + selector_value`.
    pub fn composite_type(&self) -> String {
        format!(
            "{}{}{}",
            self.origin_type, self.filter_id, self.selector_value
        )
    }

    /// Uniqueness key: one registration per (type, filter id, selector).
    pub(crate) fn key(&self) -> (String, String, String) {
        (
            self.origin_type.clone(),
            self.filter_id.clone(),
            self.selector_value.clone(),
        )
    }

    /// True when `payload` selects this subscriber.
    pub(crate) fn selects(&self, payload: &Value, filters: &FilterRegistry) -> bool {
        self.filter.evaluate(payload, filters).as_deref() == Some(self.selector_value.as_str())
    }
}

/// A locally registered custom predicate.
pub type CustomFilter = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Registry of custom predicates addressable by id. Both ends of a balanced
/// subscription that uses `FilterSpec::Custom` must register the same id.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    inner: Arc<RwLock<HashMap<String, CustomFilter>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under an id, replacing any previous one.
    pub fn register<F>(&self, id: impl Into<String>, filter: F)
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        if let Ok(mut map) = self.inner.write() {
            map.insert(id.into(), Arc::new(filter));
        }
    }

    pub fn get(&self, id: &str) -> Option<CustomFilter> {
        self.inner.read().ok()?.get(id).cloned()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.inner.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("FilterRegistry").field("len", &len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equality_extracts_and_stringifies() {
        let spec = FilterSpec::Equality {
            pointer: "/data/n".into(),
        };
        let filters = FilterRegistry::new();
        assert_eq!(
            spec.evaluate(&json!({"data": {"n": 7}}), &filters),
            Some("7".to_string())
        );
        assert_eq!(
            spec.evaluate(&json!({"data": {"n": "a"}}), &filters),
            Some("a".to_string())
        );
        assert_eq!(spec.evaluate(&json!({"other": 1}), &filters), None);
    }

    #[test]
    fn range_buckets_by_boundaries() {
        let spec = FilterSpec::Range {
            pointer: "/v".into(),
            boundaries: vec![10.0, 20.0],
        };
        let filters = FilterRegistry::new();
        assert_eq!(spec.evaluate(&json!({"v": 5}), &filters), Some("0".into()));
        assert_eq!(spec.evaluate(&json!({"v": 10}), &filters), Some("1".into()));
        assert_eq!(spec.evaluate(&json!({"v": 99}), &filters), Some("2".into()));
        assert_eq!(spec.evaluate(&json!({"v": "x"}), &filters), None);
    }

    #[test]
    fn hash_bucket_is_stable_and_in_range() {
        let spec = FilterSpec::HashBucket {
            pointer: "/id".into(),
            buckets: 4,
        };
        let filters = FilterRegistry::new();
        let a = spec.evaluate(&json!({"id": "abc"}), &filters).unwrap();
        let b = spec.evaluate(&json!({"id": "abc"}), &filters).unwrap();
        assert_eq!(a, b);
        assert!(a.parse::<u64>().unwrap() < 4);
    }

    #[test]
    fn custom_filter_by_id() {
        let filters = FilterRegistry::new();
        filters.register("evens", |v: &Value| {
            Some((v.get("n")?.as_i64()? % 2).to_string())
        });
        let spec = FilterSpec::Custom { id: "evens".into() };
        assert_eq!(spec.evaluate(&json!({"n": 4}), &filters), Some("0".into()));
        let unknown = FilterSpec::Custom { id: "nope".into() };
        assert_eq!(unknown.evaluate(&json!({"n": 4}), &filters), None);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        assert!(
            FilterSpec::HashBucket {
                pointer: "/x".into(),
                buckets: 0
            }
            .validate()
            .is_err()
        );
        assert!(
            FilterSpec::Range {
                pointer: "/x".into(),
                boundaries: vec![2.0, 1.0]
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn composite_type_concatenates() {
        let desc = BalancerDescriptor {
            origin_type: "*::jobs".into(),
            filter_id: "shard".into(),
            selector_value: "1".into(),
            filter: FilterSpec::Equality {
                pointer: "/n".into(),
            },
        };
        assert_eq!(desc.composite_type(), "*::jobsshard1");
    }

    #[test]
    fn descriptor_round_trips_with_flattened_filter() {
        let desc = BalancerDescriptor {
            origin_type: "t".into(),
            filter_id: "f".into(),
            selector_value: "s".into(),
            filter: FilterSpec::HashBucket {
                pointer: "/k".into(),
                buckets: 2,
            },
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"filter\":\"hash_bucket\""));
        let back: BalancerDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, back);
    }
}
