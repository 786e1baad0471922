//! Backend stage: one backend per port.

use super::{Inputs, Stage};
use crate::error::Result;
use crate::naming::resource_name;
use crate::resource::{Backend, ProviderStatus};

pub(super) fn desired(inputs: &Inputs<'_>) -> Vec<(String, Backend)> {
    inputs
        .service
        .ports
        .keys()
        .map(|port_name| {
            let backend = Backend {
                identifier: None,
                name: resource_name(&[port_name.as_str()], &inputs.service.name),
                load_balancer: inputs.load_balancer.clone(),
                mode: inputs.config.mode,
                health_check: inputs.config.health_check,
                status: ProviderStatus::default(),
            };
            (port_name.clone(), backend)
        })
        .collect()
}

pub(super) fn plan(inputs: &Inputs<'_>, remote: &[Backend]) -> Result<Stage<Backend>> {
    Stage::plan(desired(inputs), remote, |b| b.identifier.as_ref())
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::Fixture;
    use super::*;
    use crate::resource::{HealthCheck, Mode};
    use crate::types::Identifier;

    #[test]
    fn test_one_backend_per_port() {
        let fixture = Fixture::new();
        let inputs = fixture.inputs();

        let stage = plan(&inputs, &[]).unwrap();
        let names: Vec<&str> = stage.diff.create.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["http.default.web", "https.default.web"]);
        assert!(stage.resolved.is_empty());
    }

    #[test]
    fn test_existing_backend_resolves_its_port() {
        let fixture = Fixture::new();
        let inputs = fixture.inputs();
        let remote = vec![Backend {
            identifier: Some("be-http".into()),
            name: "http.default.web".into(),
            load_balancer: fixture.load_balancer.clone(),
            mode: Mode::Tcp,
            health_check: HealthCheck::Tcp,
            status: ProviderStatus::READY,
        }];

        let stage = plan(&inputs, &remote).unwrap();
        assert_eq!(stage.diff.create.len(), 1);
        assert_eq!(stage.diff.create[0].name, "https.default.web");
        assert!(stage.diff.destroy.is_empty());
        assert_eq!(stage.resolved.get("http"), Some(&Identifier::from("be-http")));
        assert_eq!(stage.resolved.get("https"), None);
    }

    #[test]
    fn test_health_check_change_unresolves_port() {
        let fixture = Fixture::new();
        let inputs = fixture.inputs();
        let remote = vec![Backend {
            identifier: Some("be-http".into()),
            name: "http.default.web".into(),
            load_balancer: fixture.load_balancer.clone(),
            mode: Mode::Tcp,
            health_check: HealthCheck::Disabled,
            status: ProviderStatus::READY,
        }];

        let stage = plan(&inputs, &remote).unwrap();
        assert_eq!(stage.diff.destroy, remote);
        assert!(stage.resolved.is_empty());
    }
}
