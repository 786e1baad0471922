//! Bind stage: one bind per port and external address.

use tracing::debug;

use super::{Inputs, Resolved};
use crate::compare::{Diff, compare};
use crate::error::Result;
use crate::naming::resource_name;
use crate::resource::{Bind, ProviderStatus};
use crate::types::AddressFamily;

pub(super) fn desired(inputs: &Inputs<'_>, frontends: &Resolved) -> Vec<Bind> {
    let mut desired = Vec::new();
    for (port_name, port) in &inputs.service.ports {
        let Some(frontend) = frontends.get(port_name) else {
            debug!(port = %port_name, "Frontend not there yet, skipping binds");
            continue;
        };
        for address in &inputs.service.external_addresses {
            let family = AddressFamily::of(address);
            desired.push(Bind {
                identifier: None,
                name: resource_name(&[port_name.as_str(), family.as_str()], &inputs.service.name),
                frontend: frontend.clone(),
                address: *address,
                port: port.external,
                status: ProviderStatus::default(),
            });
        }
    }
    desired
}

pub(super) fn plan(
    inputs: &Inputs<'_>,
    frontends: &Resolved,
    remote: &[Bind],
) -> Result<Diff<Bind>> {
    compare(&desired(inputs, frontends), remote)
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::Fixture;
    use super::*;
    use crate::types::Identifier;

    #[test]
    fn test_bind_per_address_family() {
        let mut fixture = Fixture::new();
        fixture
            .service
            .external_addresses
            .push("2001:db8::10".parse().unwrap());
        let inputs = fixture.inputs();
        let frontends = Resolved::from([("http".to_string(), Identifier::from("fe-http"))]);

        let diff = plan(&inputs, &frontends, &[]).unwrap();
        let created: Vec<(&str, u16)> = diff
            .create
            .iter()
            .map(|b| (b.name.as_str(), b.port))
            .collect();
        assert_eq!(
            created,
            vec![("http.v4.default.web", 80), ("http.v6.default.web", 80)]
        );
        assert!(diff.create.iter().all(|b| b.frontend == Identifier::from("fe-http")));
    }

    #[test]
    fn test_binds_of_unresolved_frontend_are_destroyed() {
        let fixture = Fixture::new();
        let inputs = fixture.inputs();
        let remote = vec![Bind {
            identifier: Some("bind-1".into()),
            name: "http.v4.default.web".into(),
            frontend: "fe-old".into(),
            address: "192.0.2.10".parse().unwrap(),
            port: 80,
            status: ProviderStatus::READY,
        }];

        let diff = plan(&inputs, &Resolved::new(), &remote).unwrap();
        assert!(diff.create.is_empty());
        assert_eq!(diff.destroy, remote);
    }
}
