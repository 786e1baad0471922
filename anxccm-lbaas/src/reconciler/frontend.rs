//! Frontend stage: one frontend per port, defaulting to that port's backend.

use tracing::debug;

use super::{Inputs, Resolved, Stage};
use crate::error::Result;
use crate::naming::resource_name;
use crate::resource::{Frontend, ProviderStatus};

pub(super) fn desired(inputs: &Inputs<'_>, backends: &Resolved) -> Vec<(String, Frontend)> {
    let mut desired = Vec::new();
    for port_name in inputs.service.ports.keys() {
        let Some(backend) = backends.get(port_name) else {
            debug!(port = %port_name, "Backend not there yet, skipping frontend");
            continue;
        };
        desired.push((
            port_name.clone(),
            Frontend {
                identifier: None,
                name: resource_name(&[port_name.as_str()], &inputs.service.name),
                load_balancer: inputs.load_balancer.clone(),
                default_backend: backend.clone(),
                mode: inputs.config.mode,
                status: ProviderStatus::default(),
            },
        ));
    }
    desired
}

pub(super) fn plan(
    inputs: &Inputs<'_>,
    backends: &Resolved,
    remote: &[Frontend],
) -> Result<Stage<Frontend>> {
    Stage::plan(desired(inputs, backends), remote, |f| f.identifier.as_ref())
}
