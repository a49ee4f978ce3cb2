//! replink library
//!
//! This crate lets a remote controller drive an embedded interpreter over a
//! single duplex byte stream:
//! - Length-prefixed message framing and channel acquisition
//! - Command dispatch with reentrant input servicing
//! - Engine trait with a bundled Lua implementation
//! - A controller-side client for the same protocol

pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
