//! Configuration types and loading

mod loader;
mod types;

pub use loader::{create_default_config, load, load_str, DEFAULT_OPTIONS_FILE};
pub use types::{Config, PublicConfig};
