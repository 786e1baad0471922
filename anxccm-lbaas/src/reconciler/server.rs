//! Server stage: one server per port and endpoint, in that port's backend.

use tracing::debug;

use super::{Inputs, Resolved};
use crate::compare::{Diff, compare};
use crate::error::Result;
use crate::naming::resource_name;
use crate::resource::{ProviderStatus, ServerResource};

pub(super) fn desired(inputs: &Inputs<'_>, backends: &Resolved) -> Vec<ServerResource> {
    let check = inputs.config.health_check.is_enabled();
    let mut desired = Vec::new();
    for (port_name, port) in &inputs.service.ports {
        let Some(backend) = backends.get(port_name) else {
            debug!(port = %port_name, "Backend not there yet, skipping servers");
            continue;
        };
        for server in &inputs.service.servers {
            desired.push(ServerResource {
                identifier: None,
                name: resource_name(&[server.name.as_str(), port_name.as_str()], &inputs.service.name),
                backend: backend.clone(),
                ip: server.address,
                port: port.internal,
                check,
                status: ProviderStatus::default(),
            });
        }
    }
    desired
}

pub(super) fn plan(
    inputs: &Inputs<'_>,
    backends: &Resolved,
    remote: &[ServerResource],
) -> Result<Diff<ServerResource>> {
    compare(&desired(inputs, backends), remote)
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::Fixture;
    use super::*;
    use crate::resource::HealthCheck;
    use crate::types::Identifier;

    #[test]
    fn test_servers_only_reference_resolved_backends() {
        let fixture = Fixture::new();
        let inputs = fixture.inputs();
        let backends = Resolved::from([("https".to_string(), Identifier::from("be-https"))]);

        let diff = plan(&inputs, &backends, &[]).unwrap();
        assert_eq!(diff.create.len(), fixture.service.servers.len());
        for server in &diff.create {
            assert_eq!(server.backend, Identifier::from("be-https"));
            assert_eq!(server.port, 30443);
            assert!(server.check);
        }
        assert_eq!(diff.create[0].name, "node-1.https.default.web");
    }

    #[test]
    fn test_disabled_health_check_disables_server_check() {
        let mut fixture = Fixture::new();
        fixture.config.health_check = HealthCheck::Disabled;
        let inputs = fixture.inputs();
        let backends = Resolved::from([("http".to_string(), Identifier::from("be-http"))]);

        let diff = plan(&inputs, &backends, &[]).unwrap();
        assert!(diff.create.iter().all(|s| !s.check));
    }
}
