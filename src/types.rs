//! Data structures shared by the convergence core and its adapters.
//!
//! Intents are persisted by the store and accepted over the API, so they
//! are serialised with [`serde`](https://serde.rs/) in camelCase.  Container
//! snapshots and forwarders are read fresh from their adapters on every
//! pass and never persisted.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Application-layer protocol spoken by a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tls,
    Tcp,
    Unknown,
}

impl Protocol {
    pub fn is_known(self) -> bool {
        self != Protocol::Unknown
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tls => "tls",
            Protocol::Tcp => "tcp",
            Protocol::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Extra settings passed through to the tunnel service when a forwarder
/// is opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointOptions {
    /// Load balance traffic across endpoints sharing the same URL.
    pub pooling_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

/// A user's durable request that a container port be tunneled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub container_id: String,
    pub target_port: u16,
    /// Skips detection when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub options: EndpointOptions,
}

impl Intent {
    pub fn new(container_id: impl Into<String>, target_port: u16) -> Self {
        Self {
            container_id: container_id.into(),
            target_port,
            protocol: None,
            options: EndpointOptions::default(),
        }
    }

    /// The override, ignoring an explicit `unknown`.
    pub fn protocol_override(&self) -> Option<Protocol> {
        self.protocol.filter(|p| p.is_known())
    }
}

/// A host port published by a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    #[allow(dead_code)]
    pub private_port: u16,
    pub public_port: Option<u16>,
}

/// A running container as reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub id: String,
    pub name: String,
    pub published_ports: Vec<PublishedPort>,
    #[allow(dead_code)]
    pub labels: HashMap<String, String>,
}

impl ContainerSnapshot {
    /// Whether `key` refers to this container, by full id, name, or an id
    /// prefix at least as long as the short form Docker prints.
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name == key || (key.len() >= 12 && self.id.starts_with(key))
    }

    pub fn publishes(&self, host_port: u16) -> bool {
        self.published_ports
            .iter()
            .any(|p| p.public_port == Some(host_port))
    }
}

/// A forwarder open in the tunnel service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarder {
    pub id: String,
    pub url: String,
    /// Local address the forwarder sends traffic to, e.g. `localhost:8080`.
    pub target: String,
    pub protocol: Protocol,
    /// Container the forwarder was opened for, when the service records it.
    pub container_id: Option<String>,
}

/// The live record of an open forwarder serving a container's port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub container_id: String,
    pub target_port: u16,
    pub forwarder_id: String,
    pub url: String,
    pub protocol: Protocol,
}

/// A container lifecycle change observed by the runtime monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Started { id: String },
    Stopped { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, name: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            id: id.into(),
            name: name.into(),
            published_ports: vec![PublishedPort {
                private_port: 80,
                public_port: Some(8080),
            }],
            labels: HashMap::new(),
        }
    }

    #[test]
    fn container_matches_id_name_and_short_id() {
        let c = snapshot("0123456789abcdef0123", "web");
        assert!(c.matches("0123456789abcdef0123"));
        assert!(c.matches("web"));
        assert!(c.matches("0123456789ab"));
        assert!(!c.matches("0123"));
        assert!(!c.matches("db"));
    }

    #[test]
    fn publishes_checks_host_port() {
        let c = snapshot("abc", "web");
        assert!(c.publishes(8080));
        assert!(!c.publishes(80));
    }

    #[test]
    fn intent_accepts_minimal_json() {
        let intent: Intent =
            serde_json::from_str(r#"{"containerId":"abc","targetPort":8080}"#).unwrap();
        assert_eq!(intent, Intent::new("abc", 8080));
        assert_eq!(intent.protocol_override(), None);
    }

    #[test]
    fn unknown_override_is_ignored() {
        let mut intent = Intent::new("abc", 8080);
        intent.protocol = Some(Protocol::Unknown);
        assert_eq!(intent.protocol_override(), None);
        intent.protocol = Some(Protocol::Tls);
        assert_eq!(intent.protocol_override(), Some(Protocol::Tls));
    }
}
