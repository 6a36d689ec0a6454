//! SwarmSync - a peer-to-peer file synchronization node.
//!
//! Nodes discover each other's file state over authenticated, encrypted TCP
//! connections and converge a shared folder by exchanging change sets found
//! by periodic filesystem rescans.

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod hashing;
pub mod logging;
pub mod peer;
pub mod repository;
pub mod rescan;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
