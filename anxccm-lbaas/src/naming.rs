//! Deterministic resource names.
//!
//! Names are derived from the service identity, the port name and, where
//! relevant, endpoint name or address family. Re-deriving them every cycle
//! yields the same names, which is what lets the comparator recognise
//! existing resources without remembering provider identifiers.

/// Join the non-empty `parts` and the per-service `suffix` with dots.
pub fn resource_name(parts: &[&str], suffix: &str) -> String {
    parts
        .iter()
        .copied()
        .chain(std::iter::once(suffix))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}
