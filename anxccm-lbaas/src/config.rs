//! Reconciliation settings.

use serde::{Deserialize, Serialize};

use crate::error::{LbaasError, Result};
use crate::resource::{HealthCheck, Mode};
use crate::waiter::Backoff;

/// Knobs of one reconciliation. Every field has a default, so a partial JSON
/// object (or none at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Readiness polling schedule.
    pub backoff: Backoff,
    /// Health check of created backends; servers check iff it is enabled.
    pub health_check: HealthCheck,
    pub mode: Mode,
    /// Cycles after which `reconcile` gives up.
    pub max_cycles: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            health_check: HealthCheck::Tcp,
            mode: Mode::Tcp,
            max_cycles: 32,
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_cycles == 0 {
            return Err(LbaasError::InvalidConfig(
                "max_cycles must be at least 1".to_string(),
            ));
        }
        self.backoff.validate()
    }
}
