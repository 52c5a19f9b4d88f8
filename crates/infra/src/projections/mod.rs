//! Read projections over jobs and programs.

pub mod build_view;

pub use build_view::{BuildView, BuildViewProjector};
