//! Program tree storage.
//!
//! The runner commits whole units (a module, a lesson, a resource list, ...)
//! keyed by position. Saving the same unit twice overwrites it, so a unit
//! redone after a crash never duplicates content.

pub mod postgres;
pub mod store;
pub mod tree;

pub use postgres::PostgresProgramStore;
pub use store::{InMemoryProgramStore, ProgramStore, ProgramStoreError};
pub use tree::{Program, ProgramLesson, ProgramModule, ProgramSnapshot, ProgramUnit};
