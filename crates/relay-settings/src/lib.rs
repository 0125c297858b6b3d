//! # relay-settings
//!
//! Layered configuration for the relay:
//! 1. compiled defaults ([`RelaySettings::default()`])
//! 2. `~/.hapi-relay/settings.json`, deep-merged over the defaults
//! 3. `RELAY_*` environment variables

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{relay_home, RelaySettings};
