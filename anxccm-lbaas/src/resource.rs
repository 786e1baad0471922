//! Remote LBaaS resources.
//!
//! One logical load balancer configuration consists of four resource kinds:
//! - Backend: pool grouping, belongs to a load balancer
//! - Frontend: client-facing listener, belongs to a load balancer, defaults to a Backend
//! - Bind: address + port a Frontend listens on
//! - Server: pool member of a Backend

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::Identifier;

/// Provider type identifiers and the kind each maps to.
const TYPE_IDENTIFIERS: [(&str, ResourceKind); 4] = [
    ("lbaas.backend", ResourceKind::Backend),
    ("lbaas.frontend", ResourceKind::Frontend),
    ("lbaas.bind", ResourceKind::Bind),
    ("lbaas.server", ResourceKind::Server),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Backend,
    Frontend,
    Bind,
    Server,
}

impl ResourceKind {
    /// Map a provider type identifier to a resource kind.
    pub fn from_type_identifier(type_identifier: &str) -> Option<Self> {
        TYPE_IDENTIFIERS
            .iter()
            .find(|(id, _)| *id == type_identifier)
            .map(|(_, kind)| *kind)
    }

    pub fn type_identifier(&self) -> &'static str {
        TYPE_IDENTIFIERS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(id, _)| *id)
            .unwrap_or_default()
    }

    /// Position in the dependency chain; lower ranks must exist first.
    pub fn dependency_rank(&self) -> u8 {
        match self {
            ResourceKind::Backend => 0,
            ResourceKind::Frontend => 1,
            ResourceKind::Bind | ResourceKind::Server => 2,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Backend => "backend",
            ResourceKind::Frontend => "frontend",
            ResourceKind::Bind => "bind",
            ResourceKind::Server => "server",
        };
        f.write_str(s)
    }
}

/// Status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    #[default]
    Progressing,
    Ready {
        error: bool,
    },
}

impl ProviderStatus {
    pub const READY: ProviderStatus = ProviderStatus::Ready { error: false };
    pub const FAILED: ProviderStatus = ProviderStatus::Ready { error: true };

    pub fn readiness(&self) -> ReadinessState {
        match self {
            ProviderStatus::Progressing => ReadinessState::Progressing,
            ProviderStatus::Ready { error: false } => ReadinessState::Ready,
            ProviderStatus::Ready { error: true } => ReadinessState::Failed,
        }
    }
}

/// Readiness classification derived from the provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadinessState {
    Progressing,
    Ready,
    Failed,
}

/// Balancing mode of frontends and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Tcp,
    Http,
}

/// Health check a backend runs against its servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheck {
    #[default]
    Tcp,
    Disabled,
}

impl HealthCheck {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, HealthCheck::Disabled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    pub name: String,
    pub load_balancer: Identifier,
    pub mode: Mode,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    pub name: String,
    pub load_balancer: Identifier,
    pub default_backend: Identifier,
    pub mode: Mode,
    #[serde(default)]
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    pub name: String,
    pub frontend: Identifier,
    pub address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    pub name: String,
    pub backend: Identifier,
    pub ip: IpAddr,
    pub port: u16,
    pub check: bool,
    #[serde(default)]
    pub status: ProviderStatus,
}

/// Any of the four resource kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    Backend(Backend),
    Frontend(Frontend),
    Bind(Bind),
    Server(ServerResource),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Backend(_) => ResourceKind::Backend,
            Resource::Frontend(_) => ResourceKind::Frontend,
            Resource::Bind(_) => ResourceKind::Bind,
            Resource::Server(_) => ResourceKind::Server,
        }
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        match self {
            Resource::Backend(r) => r.identifier.as_ref(),
            Resource::Frontend(r) => r.identifier.as_ref(),
            Resource::Bind(r) => r.identifier.as_ref(),
            Resource::Server(r) => r.identifier.as_ref(),
        }
    }

    pub fn set_identifier(&mut self, identifier: Identifier) {
        let slot = match self {
            Resource::Backend(r) => &mut r.identifier,
            Resource::Frontend(r) => &mut r.identifier,
            Resource::Bind(r) => &mut r.identifier,
            Resource::Server(r) => &mut r.identifier,
        };
        *slot = Some(identifier);
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Backend(r) => &r.name,
            Resource::Frontend(r) => &r.name,
            Resource::Bind(r) => &r.name,
            Resource::Server(r) => &r.name,
        }
    }

    pub fn status(&self) -> ProviderStatus {
        match self {
            Resource::Backend(r) => r.status,
            Resource::Frontend(r) => r.status,
            Resource::Bind(r) => r.status,
            Resource::Server(r) => r.status,
        }
    }

    pub fn set_status(&mut self, status: ProviderStatus) {
        let slot = match self {
            Resource::Backend(r) => &mut r.status,
            Resource::Frontend(r) => &mut r.status,
            Resource::Bind(r) => &mut r.status,
            Resource::Server(r) => &mut r.status,
        };
        *slot = status;
    }

    pub fn readiness(&self) -> ReadinessState {
        self.status().readiness()
    }

    /// Identifiers of the objects this resource points at.
    pub fn references(&self) -> Vec<&Identifier> {
        match self {
            Resource::Backend(r) => vec![&r.load_balancer],
            Resource::Frontend(r) => vec![&r.load_balancer, &r.default_backend],
            Resource::Bind(r) => vec![&r.frontend],
            Resource::Server(r) => vec![&r.backend],
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())?;
        if let Some(id) = self.identifier() {
            write!(f, " ({id})")?;
        }
        Ok(())
    }
}

impl From<Backend> for Resource {
    fn from(r: Backend) -> Self {
        Resource::Backend(r)
    }
}

impl From<Frontend> for Resource {
    fn from(r: Frontend) -> Self {
        Resource::Frontend(r)
    }
}

impl From<Bind> for Resource {
    fn from(r: Bind) -> Self {
        Resource::Bind(r)
    }
}

impl From<ServerResource> for Resource {
    fn from(r: ServerResource) -> Self {
        Resource::Server(r)
    }
}
