//! Readiness polling with bounded exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LbaasError, ProviderError, Result};
use crate::provider::LbaasApi;
use crate::resource::{ReadinessState, Resource};
use crate::types::Identifier;

/// Exponential backoff for readiness polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// First interval.
    pub initial_ms: u64,
    /// Multiplier applied after every step.
    pub factor: f64,
    /// Up to this fraction of the interval is added at random.
    pub jitter: f64,
    /// Maximum number of waits before giving up.
    pub steps: u32,
    /// Hard upper bound of a single interval.
    pub cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            factor: 1.5,
            jitter: 0.1,
            steps: 12,
            cap_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Reject settings that would make the interval arithmetic blow up.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LbaasError::InvalidConfig(msg));
        if !self.factor.is_finite() || self.factor < 1.0 {
            return invalid(format!("backoff factor {} must be a finite number >= 1", self.factor));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return invalid(format!("backoff jitter {} must be between 0 and 1", self.jitter));
        }
        if self.cap_ms < self.initial_ms {
            return invalid(format!(
                "backoff cap {}ms is below the initial interval {}ms",
                self.cap_ms, self.initial_ms
            ));
        }
        Ok(())
    }

    /// The sequence of intervals to sleep, `steps` long.
    pub fn intervals(&self) -> Intervals {
        Intervals {
            current: Duration::from_millis(self.initial_ms),
            cap: Duration::from_millis(self.cap_ms),
            factor: self.factor,
            jitter: self.jitter,
            remaining: self.steps,
        }
    }
}

/// Iterator over backoff intervals.
pub struct Intervals {
    current: Duration,
    cap: Duration,
    factor: f64,
    jitter: f64,
    remaining: u32,
}

impl Iterator for Intervals {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut interval = self.current;
        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..self.jitter);
            interval = Duration::from_secs_f64(interval.as_secs_f64() * (1.0 + extra));
        }

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.factor).min(self.cap.as_secs_f64()),
        );
        Some(interval.min(self.cap))
    }
}

/// Poll `objects` until none of them is progressing anymore.
///
/// The first pass re-fetches every object, whatever state it was handed in
/// with; later passes skip objects already seen ready. A failed object ends
/// the wait with `ResourceFailed`, even if others are still progressing.
/// Objects that vanished count as failed.
pub async fn wait_ready<A>(
    api: &A,
    objects: &[Resource],
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<()>
where
    A: LbaasApi + ?Sized,
{
    backoff.validate()?;

    let mut tracked: Vec<(&Resource, &Identifier, ReadinessState)> = objects
        .iter()
        .filter_map(|r| match r.identifier() {
            Some(id) => Some((r, id, r.readiness())),
            None => {
                warn!("Not waiting for {}, it has no identifier", r);
                None
            }
        })
        .collect();

    let mut intervals = backoff.intervals();
    let mut first_pass = true;

    loop {
        for (resource, id, state) in tracked.iter_mut() {
            if !first_pass && *state == ReadinessState::Ready {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(LbaasError::Canceled);
            }
            *state = match api.get(resource.kind(), *id).await {
                Ok(current) => current.readiness(),
                Err(ProviderError::NotFound) => ReadinessState::Failed,
                Err(e) => return Err(e.into()),
            };
        }
        first_pass = false;

        let with_state = |wanted: ReadinessState| -> Vec<Identifier> {
            tracked
                .iter()
                .filter(|(_, _, s)| *s == wanted)
                .map(|(_, id, _)| (*id).clone())
                .collect()
        };

        let failed = with_state(ReadinessState::Failed);
        if !failed.is_empty() {
            return Err(LbaasError::ResourceFailed {
                identifiers: failed,
            });
        }

        let progressing = with_state(ReadinessState::Progressing);
        if progressing.is_empty() {
            return Ok(());
        }

        let Some(interval) = intervals.next() else {
            return Err(LbaasError::WaitTimeout {
                identifiers: progressing,
            });
        };

        debug!(
            progressing = progressing.len(),
            delay_ms = interval.as_millis() as u64,
            "Waiting for LBaaS resources"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(LbaasError::Canceled),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLbaas;
    use crate::resource::{Backend, HealthCheck, Mode, ProviderStatus, ResourceKind};

    fn fast_backoff(steps: u32) -> Backoff {
        Backoff {
            initial_ms: 10,
            factor: 2.0,
            jitter: 0.0,
            steps,
            cap_ms: 40,
        }
    }

    async fn created_backend(api: &InMemoryLbaas, name: &str) -> Resource {
        let resource = Resource::from(Backend {
            identifier: None,
            name: name.to_string(),
            load_balancer: "lb-1".into(),
            mode: Mode::Tcp,
            health_check: HealthCheck::Tcp,
            status: ProviderStatus::default(),
        });
        let id = api.create(&resource).await.unwrap();
        let mut created = resource;
        created.set_identifier(id);
        created
    }

    #[test]
    fn test_intervals_grow_and_cap() {
        let got: Vec<u128> = fast_backoff(5).intervals().map(|d| d.as_millis()).collect();
        assert_eq!(got, vec![10, 20, 40, 40, 40]);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = Backoff {
            initial_ms: 100,
            factor: 1.0,
            jitter: 0.5,
            steps: 50,
            cap_ms: 1000,
        };
        for d in backoff.intervals() {
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_validate_rejects_unusable_backoff() {
        assert!(Backoff::default().validate().is_ok());
        assert!(fast_backoff(3).validate().is_ok());

        let broken = [
            Backoff {
                factor: -1.0,
                ..Backoff::default()
            },
            Backoff {
                factor: f64::NAN,
                ..Backoff::default()
            },
            Backoff {
                factor: f64::INFINITY,
                ..Backoff::default()
            },
            Backoff {
                jitter: f64::INFINITY,
                ..Backoff::default()
            },
            Backoff {
                jitter: -0.1,
                ..Backoff::default()
            },
            Backoff {
                initial_ms: 5000,
                cap_ms: 100,
                ..Backoff::default()
            },
        ];
        for backoff in broken {
            assert!(
                matches!(backoff.validate(), Err(LbaasError::InvalidConfig(_))),
                "{backoff:?} accepted"
            );
        }
    }

    #[test]
    fn test_largest_valid_backoff_does_not_overflow() {
        let backoff = Backoff {
            initial_ms: u64::MAX,
            factor: 1e300,
            jitter: 1.0,
            steps: 3,
            cap_ms: u64::MAX,
        };
        backoff.validate().unwrap();
        assert_eq!(backoff.intervals().count(), 3);
    }

    #[tokio::test]
    async fn test_wait_with_invalid_backoff_is_an_error() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        let object = created_backend(&api, "a.web").await;
        let backoff = Backoff {
            factor: -1.0,
            ..fast_backoff(3)
        };

        let err = wait_ready(&api, &[object], &backoff, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::InvalidConfig(_)));
        assert_eq!(api.journal().gets, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_until_ready() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        api.configure(|f| f.ready_after_polls = 3);
        let objects = vec![
            created_backend(&api, "a.web").await,
            created_backend(&api, "b.web").await,
        ];

        wait_ready(&api, &objects, &fast_backoff(5), &CancellationToken::new())
            .await
            .unwrap();
        for r in api.objects(ResourceKind::Backend) {
            assert_eq!(r.status(), ProviderStatus::READY);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_refetches_objects_handed_in_as_ready() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        api.configure(|f| f.ready_after_polls = 2);
        let mut object = created_backend(&api, "a.web").await;
        object.set_status(ProviderStatus::READY);

        wait_ready(&api, &[object], &fast_backoff(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(api.journal().gets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_takes_priority() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        api.configure(|f| f.ready_after_polls = 1000);
        let slow = created_backend(&api, "slow.web").await;
        let bad = created_backend(&api, "bad.web").await;
        let bad_id = bad.identifier().cloned().unwrap();
        api.set_status(&bad_id, ProviderStatus::FAILED);

        let err = wait_ready(&api, &[slow, bad], &fast_backoff(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LbaasError::ResourceFailed {
                identifiers: vec![bad_id]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_step_budget() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        api.configure(|f| f.ready_after_polls = 1000);
        let object = created_backend(&api, "a.web").await;

        let err = wait_ready(&api, &[object], &fast_backoff(3), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::WaitTimeout { ref identifiers } if identifiers.len() == 1));
        // one initial pass plus one per step
        assert_eq!(api.journal().gets, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let api = InMemoryLbaas::new();
        api.add_load_balancer("lb-1");
        api.configure(|f| f.ready_after_polls = 1000);
        let object = created_backend(&api, "a.web").await;
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            canceller.cancel();
        });

        let err = wait_ready(&api, &[object], &fast_backoff(1000), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LbaasError::Canceled);
    }

    #[tokio::test]
    async fn test_vanished_object_counts_as_failed() {
        let api = InMemoryLbaas::new();
        let mut ghost = Resource::from(Backend {
            identifier: None,
            name: "ghost.web".into(),
            load_balancer: "lb-1".into(),
            mode: Mode::Tcp,
            health_check: HealthCheck::Tcp,
            status: ProviderStatus::Progressing,
        });
        ghost.set_identifier("gone".into());

        let err = wait_ready(&api, &[ghost], &fast_backoff(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LbaasError::ResourceFailed { .. }));
    }
}
