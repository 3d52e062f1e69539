//! Core shared types for Keel.
//!
//! This crate is intentionally small: it only hosts the pieces every other
//! `keel-*` crate needs (version stamping, the shared path table and a few
//! filesystem helpers).

mod fs;
mod intern;
mod panic;

pub use fs::{absolute_path, modified_millis};
pub use intern::PathInterner;
pub use panic::panic_payload_to_str;

/// Version stamped into every persisted blob.
///
/// Blobs written by a different Keel version are treated as cache misses.
pub const KEEL_VERSION: &str = env!("CARGO_PKG_VERSION");
