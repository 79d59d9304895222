//! Configuration types and TOML loading.

mod loader;

pub use loader::*;
