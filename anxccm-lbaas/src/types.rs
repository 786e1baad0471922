//! Core value types shared across the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Prefix of the ownership tag attached to every resource we create.
pub const SERVICE_TAG_PREFIX: &str = "anxccm-svc-uid=";

/// Opaque provider-assigned identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ownership tag. A resource belongs to a service iff it carries the service's tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tag(String);

impl Tag {
    /// Tag for the service with the given UID.
    pub fn for_service(service_uid: &str) -> Self {
        Self(format!("{SERVICE_TAG_PREFIX}{service_uid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A port mapping of a service.
///
/// `external` is what clients connect to on the load balancer (the Bind port),
/// `internal` is what the load balancer connects to on the servers (e.g. a NodePort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    pub internal: u16,
    pub external: u16,
}

/// A desired pool member, one per cluster endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "v4",
            AddressFamily::V6 => "v6",
        }
    }
}

/// Desired state of one service, as handed to us by the cloud-provider layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// Stable service name, used as suffix for all resource names.
    pub name: String,
    /// Service UID, used to build the ownership tag.
    pub uid: String,
    #[serde(default)]
    pub external_addresses: Vec<IpAddr>,
    /// Ports keyed by port name.
    #[serde(default)]
    pub ports: BTreeMap<String, Port>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl ServiceDefinition {
    pub fn tag(&self) -> Tag {
        Tag::for_service(&self.uid)
    }

    /// Same service with nothing desired anymore, used to tear everything down.
    pub fn emptied(&self) -> Self {
        Self {
            name: self.name.clone(),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_tag_format() {
        let tag = Tag::for_service("8c3e0f7a");
        assert_eq!(tag.as_str(), "anxccm-svc-uid=8c3e0f7a");
    }

    #[test]
    fn test_address_family() {
        let v4: IpAddr = "192.0.2.10".parse().unwrap();
        let v6: IpAddr = "2001:db8::10".parse().unwrap();
        assert_eq!(AddressFamily::of(&v4).as_str(), "v4");
        assert_eq!(AddressFamily::of(&v6).as_str(), "v6");
    }

    #[test]
    fn test_service_definition_from_json() {
        let service: ServiceDefinition = serde_json::from_str(
            r#"{
                "name": "default.web",
                "uid": "abc",
                "external_addresses": ["192.0.2.1"],
                "ports": {"http": {"internal": 30080, "external": 80}},
                "servers": [{"name": "node-1", "address": "10.0.0.1"}]
            }"#,
        )
        .unwrap();

        assert_eq!(service.ports["http"].external, 80);
        assert_eq!(service.servers.len(), 1);
        assert_eq!(service.tag().as_str(), "anxccm-svc-uid=abc");

        let empty = service.emptied();
        assert!(empty.ports.is_empty());
        assert_eq!(empty.uid, "abc");
    }
}
