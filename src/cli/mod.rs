//! CLI module for external process spawning, stream parsing, and the
//! per-session connection boundary.

mod connection;
mod events;
mod process;
mod stream;

pub use connection::*;
pub use events::*;
pub use process::*;
pub use stream::*;
