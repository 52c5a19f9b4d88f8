//! Program build jobs.
//!
//! ## Components
//!
//! - `BuildJobStore`: job rows plus their append-only event logs
//! - `BuildJobs`: lifecycle operations (create, dedup, patch, append, cancel)
//! - `BuildDispatcher`: claims a job and drives its phases from the checkpoint
//! - `RecoveryService`: explicit retry and stale-heartbeat recovery

pub mod checkpoint;
pub mod dispatcher;
pub mod error;
pub mod machine;
pub mod postgres;
pub mod recovery;
pub mod store;
pub mod types;

pub use checkpoint::{latest_checkpoint, load_checkpoint};
pub use dispatcher::{BuildDispatcher, Collaborators, RunOutcome};
pub use error::BuildError;
pub use machine::{BuildJobs, Submission};
pub use postgres::PostgresBuildJobStore;
pub use recovery::{RecoveryOutcome, RecoveryService, RecoverySweeper, RetryOutcome};
pub use store::{BuildJobStore, ClaimOutcome, InMemoryBuildJobStore, JobStoreError};
pub use types::{BuildJob, JobFilter, JobGuard, JobPage, JobPatch, JobStatus, Pagination};
