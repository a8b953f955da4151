//! Configuration and logging helpers shared by the farm pool binaries.

mod toml;
pub use toml::duration_from_toml;

pub mod logging;
