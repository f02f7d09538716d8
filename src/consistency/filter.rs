use super::{Inconsistency, InconsistencyType, Severity};
use std::collections::BTreeSet;

/// Predicate over checker output. Filters run after the scan, so new
/// exclusions never touch the checks themselves.
pub trait InconsistencyFilter: Send + Sync {
    fn keep(&self, inconsistency: &Inconsistency) -> bool;
}

impl<F> InconsistencyFilter for F
where
    F: Fn(&Inconsistency) -> bool + Send + Sync,
{
    fn keep(&self, inconsistency: &Inconsistency) -> bool {
        self(inconsistency)
    }
}

/// Drops every inconsistency of the listed types.
#[derive(Debug, Clone, Default)]
pub struct IgnoreTypes(pub BTreeSet<InconsistencyType>);

impl IgnoreTypes {
    pub fn new(types: impl IntoIterator<Item = InconsistencyType>) -> Self {
        Self(types.into_iter().collect())
    }
}

impl InconsistencyFilter for IgnoreTypes {
    fn keep(&self, inconsistency: &Inconsistency) -> bool {
        !self.0.contains(&inconsistency.kind)
    }
}

/// Mixed-version clusters may carry chunk history written by an older
/// binary that did not maintain it.
pub fn multiversion() -> IgnoreTypes {
    IgnoreTypes::new([InconsistencyType::CorruptedChunkHistory])
}

/// A stepdown can interrupt timeseries creation between the buckets
/// collection and its view.
pub fn stepdown() -> IgnoreTypes {
    IgnoreTypes::new([InconsistencyType::MalformedTimeseriesBucketsCollection])
}

pub fn ignore_transient() -> impl InconsistencyFilter {
    |i: &Inconsistency| i.severity != Severity::Transient
}
