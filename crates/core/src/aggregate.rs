//! Event-sourced aggregate contract.

use crate::error::{DomainError, DomainResult};

/// Identity and revision of an aggregate.
pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    /// Number of events applied so far (the stream revision).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an append.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            return Ok(());
        }
        Err(DomainError::conflict(format!(
            "stream revision mismatch (expected: {self:?}, actual: {actual})"
        )))
    }
}

/// Decide/evolve split used by every aggregate in the workspace.
///
/// `handle` inspects state and returns the events a command produces, without
/// mutating anything. `apply` folds one event into state and bumps the version.
/// Both must be deterministic: replaying a stream always yields the same state.
pub trait Aggregate: AggregateRoot {
    type Command: Clone + core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    fn apply(&mut self, event: &Self::Event);

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold a sequence of events into `self`.
    fn rehydrate<'a, I>(mut self, events: I) -> Self
    where
        Self: Sized,
        Self::Event: 'a,
        I: IntoIterator<Item = &'a Self::Event>,
    {
        for event in events {
            self.apply(event);
        }
        self
    }
}
