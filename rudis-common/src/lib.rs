//! # rudis-common
//!
//! Shared foundations for the rudis workspace: the error taxonomy every
//! crate reports through, server configuration with its defaults, and the
//! key-pattern matcher used by `KEYS`.

pub mod config;
pub mod error;
pub mod pattern;

pub use config::{AofFsync, Config, NodeRole, PersistenceMode, SlaveNode};
pub use error::{RudisError, RudisResult};
pub use pattern::key_pattern_matches;
