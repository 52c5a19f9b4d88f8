//! Build events: the append-only record of what a program build did.
//!
//! - `phase`: the fixed phase sequence of a build
//! - `checkpoint`: the resume marker embedded in unit/phase events
//! - `event`: stored events and drafts
//! - `kind`: machine-readable event type names
//! - `payload`: typed view over event payloads

pub mod checkpoint;
pub mod event;
pub mod kind;
pub mod payload;
pub mod phase;

pub use checkpoint::Checkpoint;
pub use event::{BuildEvent, EventDraft, EventLevel, EventStatus};
pub use payload::EventPayload;
pub use phase::BuildPhase;
