//! Protocol message model
//!
//! A [`Message`] is one discrete protocol unit: a [`Command`] header plus an
//! optional opaque payload. Payloads are raw JSON bytes and are never
//! inspected by the protocol layer; an absent payload is distinct from a
//! `null` payload and survives a round trip. [`Envelope`] wraps a message
//! with a logical hub name for the forked-process control channel, where one
//! physical child may host several logical hubs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::balancer::BalancerDescriptor;

/// Protocol version advertised in HELLO.
pub const PROTO_VERSION: u8 = 3;

/// Delimiter between segments of a hierarchical event type.
pub const DELIMITER: &str = "::";

/// Wire message header, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Introduce this peer by name.
    Hello { proto_version: u8, name: String },
    /// Subscribe to an event type, optionally with a balancer descriptor.
    On {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        balancer: Option<BalancerDescriptor>,
    },
    /// Ordering fence: the peer replies with a payload-less PUSH_EMIT.
    Echo { event_type: String },
    /// Unsubscribe from an event type.
    Off { event_type: String },
    /// Deregister everything this peer registered.
    Bye,
    /// Publish an event towards the serving peer.
    Emit { event_type: String },
    /// Deliver an event to a subscribed peer.
    PushEmit { event_type: String },
}

impl Command {
    /// The event type this command refers to, if any.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Command::Hello { .. } | Command::Bye => None,
            Command::On { event_type, .. }
            | Command::Echo { event_type }
            | Command::Off { event_type }
            | Command::Emit { event_type }
            | Command::PushEmit { event_type } => Some(event_type),
        }
    }
}

/// One protocol message: a command header and an optional opaque payload.
///
/// Messages are immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command: Command,
    pub payload: Option<Bytes>,
}

impl Message {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: None,
        }
    }

    pub fn hello(name: impl Into<String>) -> Self {
        Self::new(Command::Hello {
            proto_version: PROTO_VERSION,
            name: name.into(),
        })
    }

    pub fn on(event_type: impl Into<String>) -> Self {
        Self::new(Command::On {
            event_type: event_type.into(),
            balancer: None,
        })
    }

    pub fn on_balanced(event_type: impl Into<String>, balancer: BalancerDescriptor) -> Self {
        Self::new(Command::On {
            event_type: event_type.into(),
            balancer: Some(balancer),
        })
    }

    pub fn echo(event_type: impl Into<String>) -> Self {
        Self::new(Command::Echo {
            event_type: event_type.into(),
        })
    }

    pub fn off(event_type: impl Into<String>) -> Self {
        Self::new(Command::Off {
            event_type: event_type.into(),
        })
    }

    pub fn bye() -> Self {
        Self::new(Command::Bye)
    }

    pub fn emit(event_type: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self {
            command: Command::Emit {
                event_type: event_type.into(),
            },
            payload,
        }
    }

    pub fn push_emit(event_type: impl Into<String>, payload: Option<Bytes>) -> Self {
        Self {
            command: Command::PushEmit {
                event_type: event_type.into(),
            },
            payload,
        }
    }
}

/// A message addressed to one logical hub on a multiplexed child channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Logical hub name used for demultiplexing.
    pub name: String,
    pub message: Message,
}

impl Envelope {
    pub fn new(name: impl Into<String>, message: Message) -> Self {
        Self {
            name: name.into(),
            message,
        }
    }
}

/// Namespace an event type under the emitting peer's name.
pub(crate) fn namespaced(peer: &str, event_type: &str) -> String {
    format!("{peer}{DELIMITER}{event_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_json() {
        let cmd = Command::Hello {
            proto_version: PROTO_VERSION,
            name: "alpha".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"kind\":\"hello\""));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn on_without_balancer_omits_field() {
        let json = serde_json::to_string(&Message::on("a::b").command).unwrap();
        assert!(!json.contains("balancer"));
    }

    #[test]
    fn event_type_accessor() {
        assert_eq!(Message::echo("x").command.event_type(), Some("x"));
        assert_eq!(Message::bye().command.event_type(), None);
    }

    #[test]
    fn namespacing_uses_delimiter() {
        assert_eq!(namespaced("peer", "job::done"), "peer::job::done");
    }
}
