//! # rudis Sync Client
//!
//! Provide a lightweight, synchronous client for the rudis line-oriented
//! command protocol with connection pooling to minimize TCP handshake
//! overhead.

mod client;
mod pool;
mod wire;

pub use client::{ClientConfig, ClientError, ClientResult, ClientTtl, KVClient};
pub use wire::RespValue;
