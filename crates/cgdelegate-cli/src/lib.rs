//! cgdelegate CLI
//!
//! Configuration loading and per-container state for the `cgdelegate` binary.

pub mod config;
pub mod state;

pub use config::Config;
pub use state::{ContainerState, StateStore};
