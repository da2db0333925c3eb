//! Pure, deterministic coordination logic.
//!
//! Nothing in this module performs I/O; everything is testable with plain
//! values. The io/store layers translate between these types and the
//! filesystem/database.

pub mod classify;
pub mod dirty;
pub mod patch;
pub mod plan;
pub mod types;
