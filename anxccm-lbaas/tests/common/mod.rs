//! Shared helpers for anxccm-lbaas integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use anxccm_lbaas::{
    Backend, Backoff, HealthCheck, Identifier, InMemoryLbaas, Mode, Port, ProviderStatus,
    ReconcileConfig, Reconciliation, Resource, ResourceKind, Server, ServiceDefinition,
};
use tokio_util::sync::CancellationToken;

pub const EXTERNAL_IP: &str = "192.0.2.10";

/// http:80->30080 and https:443->30443 on one IPv4 address, two endpoints.
pub fn two_port_service() -> ServiceDefinition {
    ServiceDefinition {
        name: "default.web".into(),
        uid: "0b7c3a52-uid".into(),
        external_addresses: vec![EXTERNAL_IP.parse().unwrap()],
        ports: BTreeMap::from([
            (
                "http".to_string(),
                Port {
                    internal: 30080,
                    external: 80,
                },
            ),
            (
                "https".to_string(),
                Port {
                    internal: 30443,
                    external: 443,
                },
            ),
        ]),
        servers: vec![
            Server {
                name: "node-1".into(),
                address: "10.0.0.1".parse().unwrap(),
            },
            Server {
                name: "node-2".into(),
                address: "10.0.0.2".parse().unwrap(),
            },
        ],
    }
}

/// Defaults with a readiness schedule short enough for paused-time tests.
pub fn fast_config() -> ReconcileConfig {
    ReconcileConfig {
        backoff: Backoff {
            initial_ms: 10,
            factor: 1.5,
            jitter: 0.1,
            steps: 8,
            cap_ms: 100,
        },
        ..Default::default()
    }
}

/// In-memory provider with load balancers registered.
pub struct Harness {
    pub api: Arc<InMemoryLbaas>,
    pub lb: Identifier,
}

impl Harness {
    pub fn new() -> Self {
        let api = Arc::new(InMemoryLbaas::new());
        let lb = api.add_load_balancer("lb-1");
        Self { api, lb }
    }

    pub fn reconciliation(&self, service: &ServiceDefinition) -> Reconciliation {
        self.reconciliation_with(service, fast_config())
    }

    pub fn reconciliation_with(
        &self,
        service: &ServiceDefinition,
        config: ReconcileConfig,
    ) -> Reconciliation {
        Reconciliation::direct(
            self.api.clone(),
            self.lb.clone(),
            service.clone(),
            config,
            CancellationToken::new(),
        )
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.api.objects(kind).len()
    }

    pub fn total(&self) -> usize {
        [
            ResourceKind::Backend,
            ResourceKind::Frontend,
            ResourceKind::Bind,
            ResourceKind::Server,
        ]
        .into_iter()
        .map(|kind| self.count(kind))
        .sum()
    }

    /// Put a ready backend tagged for `service` on the provider.
    pub fn seed_backend(&self, service: &ServiceDefinition, name: &str) -> Identifier {
        self.api.insert(
            Resource::from(Backend {
                identifier: None,
                name: name.into(),
                load_balancer: self.lb.clone(),
                mode: Mode::Tcp,
                health_check: HealthCheck::Tcp,
                status: ProviderStatus::READY,
            }),
            &[service.tag()],
        )
    }
}
