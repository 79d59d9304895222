//! Session module for conversation state, queueing, and persistence.

mod manager;
mod queue;
mod state;
mod store;
mod types;

pub use manager::*;
pub use queue::*;
pub use state::*;
pub use store::*;
pub use types::*;
