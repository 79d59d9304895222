//! File snapshot module: capture, diff, revert, and accept of
//! assistant-made edits.

mod diff;
mod manager;

pub use diff::*;
pub use manager::*;
