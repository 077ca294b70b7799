//! # rudis-server
//!
//! The network face of rudis: the line-oriented command listener with RESP
//! replies, the command dispatcher, master/slave snapshot replication, and
//! the cluster gossip service.

pub mod cluster;
pub mod commands;
pub mod dispatch;
pub mod replication;
pub mod resp;
pub mod server;
pub mod stats;

pub use dispatch::{ConnState, ServerContext};
pub use server::Server;
