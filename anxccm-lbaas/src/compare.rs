//! Structural diff between desired and remote resource lists.
//!
//! Equality is computed over a fixed set of fields per kind (see the
//! `Comparable` impls below). Identifiers and statuses are never compared,
//! so a freshly synthesized target matches its remote counterpart. A
//! mismatch is never patched: the remote object is destroyed and the target
//! created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::net::IpAddr;

use crate::error::{LbaasError, Result};
use crate::resource::{Backend, Bind, Frontend, HealthCheck, Mode, ResourceKind, ServerResource};
use crate::types::Identifier;

/// A resource type that can be diffed.
pub trait Comparable {
    /// The fields defining identity and equality.
    type Key: Eq + Hash;

    const KIND: ResourceKind;

    fn compare_key(&self) -> Self::Key;

    fn name(&self) -> &str;
}

impl Comparable for Backend {
    type Key = (String, Identifier, Mode, HealthCheck);
    const KIND: ResourceKind = ResourceKind::Backend;

    fn compare_key(&self) -> Self::Key {
        (
            self.name.clone(),
            self.load_balancer.clone(),
            self.mode,
            self.health_check,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Comparable for Frontend {
    type Key = (String, Identifier, Identifier, Mode);
    const KIND: ResourceKind = ResourceKind::Frontend;

    fn compare_key(&self) -> Self::Key {
        (
            self.name.clone(),
            self.load_balancer.clone(),
            self.default_backend.clone(),
            self.mode,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Comparable for Bind {
    type Key = (String, Identifier, IpAddr, u16);
    const KIND: ResourceKind = ResourceKind::Bind;

    fn compare_key(&self) -> Self::Key {
        (
            self.name.clone(),
            self.frontend.clone(),
            self.address,
            self.port,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Comparable for ServerResource {
    type Key = (String, Identifier, IpAddr, u16, bool);
    const KIND: ResourceKind = ResourceKind::Server;

    fn compare_key(&self) -> Self::Key {
        (
            self.name.clone(),
            self.backend.clone(),
            self.ip,
            self.port,
            self.check,
        )
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Result of comparing desired against remote resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<T> {
    /// Targets without a structurally equal remote counterpart.
    pub create: Vec<T>,
    /// Remote objects without a structurally equal target.
    pub destroy: Vec<T>,
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.destroy.is_empty()
    }
}

/// Compute which targets to create and which remote objects to destroy.
///
/// Every remote object matches at most one target, so duplicates on the
/// remote side are destroyed. Two targets with the same key are rejected.
pub fn compare<T: Comparable + Clone>(target: &[T], remote: &[T]) -> Result<Diff<T>> {
    let mut seen = HashSet::with_capacity(target.len());
    for t in target {
        if !seen.insert(t.compare_key()) {
            return Err(LbaasError::DuplicateResource {
                kind: T::KIND,
                name: t.name().to_string(),
            });
        }
    }

    let mut unmatched: HashMap<T::Key, VecDeque<usize>> = HashMap::new();
    for (idx, r) in remote.iter().enumerate() {
        unmatched.entry(r.compare_key()).or_default().push_back(idx);
    }

    let mut matched = vec![false; remote.len()];
    let mut create = Vec::new();
    for t in target {
        match unmatched
            .get_mut(&t.compare_key())
            .and_then(|idxs| idxs.pop_front())
        {
            Some(idx) => matched[idx] = true,
            None => create.push(t.clone()),
        }
    }

    let destroy = remote
        .iter()
        .zip(matched)
        .filter(|(_, m)| !m)
        .map(|(r, _)| r.clone())
        .collect();

    Ok(Diff { create, destroy })
}

/// The first remote object structurally equal to `target`.
pub fn find_match<'a, T: Comparable>(target: &T, remote: &'a [T]) -> Option<&'a T> {
    let key = target.compare_key();
    remote.iter().find(|r| r.compare_key() == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ProviderStatus;

    fn backend(name: &str, id: Option<&str>, health_check: HealthCheck) -> Backend {
        Backend {
            identifier: id.map(Identifier::from),
            name: name.to_string(),
            load_balancer: "lb-1".into(),
            mode: Mode::Tcp,
            health_check,
            status: ProviderStatus::READY,
        }
    }

    #[test]
    fn test_identical_lists_produce_empty_diff() {
        let target = vec![backend("http.web", None, HealthCheck::Tcp)];
        let remote = vec![backend("http.web", Some("be-1"), HealthCheck::Tcp)];

        let diff = compare(&target, &remote).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_mismatch_is_destroy_and_create() {
        let target = vec![backend("http.web", None, HealthCheck::Tcp)];
        let remote = vec![backend("http.web", Some("be-1"), HealthCheck::Disabled)];

        let diff = compare(&target, &remote).unwrap();
        assert_eq!(diff.create, target);
        assert_eq!(diff.destroy, remote);
    }

    #[test]
    fn test_status_and_identifier_are_ignored() {
        let mut remote = backend("http.web", Some("be-1"), HealthCheck::Tcp);
        remote.status = ProviderStatus::Progressing;
        let target = backend("http.web", None, HealthCheck::Tcp);

        let diff = compare(&[target.clone()], &[remote.clone()]).unwrap();
        assert!(diff.is_empty());
        let remote = [remote];
        let matched = find_match(&target, &remote).and_then(|b| b.identifier.clone());
        assert_eq!(matched, Some(Identifier::from("be-1")));
    }

    #[test]
    fn test_remote_duplicates_are_destroyed() {
        let target = vec![backend("http.web", None, HealthCheck::Tcp)];
        let remote = vec![
            backend("http.web", Some("be-1"), HealthCheck::Tcp),
            backend("http.web", Some("be-2"), HealthCheck::Tcp),
        ];

        let diff = compare(&target, &remote).unwrap();
        assert!(diff.create.is_empty());
        assert_eq!(diff.destroy.len(), 1);
        assert_eq!(diff.destroy[0].identifier, Some(Identifier::from("be-2")));
    }

    #[test]
    fn test_duplicate_targets_are_rejected() {
        let target = vec![
            backend("http.web", None, HealthCheck::Tcp),
            backend("http.web", None, HealthCheck::Tcp),
        ];

        let err = compare(&target, &[]).unwrap_err();
        assert_eq!(
            err,
            LbaasError::DuplicateResource {
                kind: ResourceKind::Backend,
                name: "http.web".to_string()
            }
        );
    }

    #[test]
    fn test_bind_key_includes_frontend_reference() {
        let bind = |frontend: &str| Bind {
            identifier: None,
            name: "http.v4.web".into(),
            frontend: frontend.into(),
            address: "192.0.2.1".parse().unwrap(),
            port: 80,
            status: ProviderStatus::READY,
        };

        let diff = compare(&[bind("fe-2")], &[bind("fe-1")]).unwrap();
        assert_eq!(diff.create.len(), 1);
        assert_eq!(diff.destroy.len(), 1);
    }
}
