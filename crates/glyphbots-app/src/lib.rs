//! Shared plumbing for the glyphbots daemon and its control client.

pub mod control;
pub mod snapshot;

pub use control::{ControlServer, Request};
