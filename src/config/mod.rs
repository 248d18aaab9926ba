//! Configuration module for lungseg
//!
//! Loads config from `$XDG_CONFIG_HOME/lungseg/config.toml` or `~/.config/lungseg/config.toml`.
//! Falls back to embedded defaults if file doesn't exist.
//! Partial configs are merged with defaults using serde's default attributes.
//! Command-line flags override whatever the file says.
//!
//! # Example
//!
//! ```no_run
//! use lungseg::config::Config;
//!
//! let config = Config::load().expect("Failed to load config");
//! println!("Models dir: {}", config.models_dir().unwrap().display());
//! println!("Device: {}", config.prediction.device);
//! ```

pub mod schema;

pub use schema::Config;
