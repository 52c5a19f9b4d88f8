//! Optimistic concurrency guard for per-job event indices.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Expected `last_event_index` of a job at append time.
///
/// The writer states the index it last observed; the store only accepts the
/// append if nothing was written in between.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedIndex {
    /// Skip the check (only for single-writer paths that just read the job).
    Any,
    /// Require the job's log to end at exactly this index.
    Exact(u64),
}

impl ExpectedIndex {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedIndex::Any => true,
            ExpectedIndex::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "event index check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_index_must_match() {
        assert!(ExpectedIndex::Exact(3).matches(3));
        assert!(!ExpectedIndex::Exact(3).matches(4));
        assert!(ExpectedIndex::Exact(3).check(2).is_err());
    }

    #[test]
    fn any_always_matches() {
        assert!(ExpectedIndex::Any.matches(0));
        assert!(ExpectedIndex::Any.check(42).is_ok());
    }
}
