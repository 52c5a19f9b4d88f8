//! `studyforge-core` — shared building blocks.
//!
//! This crate contains identifiers, the domain error model, and the optimistic
//! concurrency guard used by the event log (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod sequence;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, JobId, ProgramId, UserId};
pub use sequence::ExpectedIndex;
