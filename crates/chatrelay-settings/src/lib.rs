//! # chatrelay-settings
//!
//! Layered configuration for the chat relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `$CHATRELAY_CONFIG`, else `./chatrelay.json`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `CHATRELAY_*` overrides (highest priority)
//!
//! The merged result is validated before it is returned.
//!
//! # Usage
//!
//! ```no_run
//! use chatrelay_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("endpoint: {}", settings.server.endpoint);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
