//! Error tiers for the protocol engine.
//!
//! Recoverable engine failures never show up here: they travel to the
//! controller as nonzero status codes. What remains is the fatal tier
//! and the request to exit, both folded into [`Halt`].

use std::collections::TryReserveError;
use std::io;

use thiserror::Error;

use crate::transport::protocol::Major;

/// Conditions the protocol has no recovery for.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("end of file or error reading controlling socket")]
    ReadHeader(#[source] io::Error),

    #[error("end of file or error reading data from controlling socket")]
    ReadBody(#[source] io::Error),

    #[error("error writing controlling socket")]
    Write(#[source] io::Error),

    #[error("out of memory for message len {len}")]
    OutOfMemory {
        len: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("output message too long: {0} bytes")]
    BodyTooLarge(usize),

    #[error("unknown type of input: {0}")]
    UnknownMajor(u8),

    #[error("unexpected message type {0:?}")]
    Unexpected(Major),

    #[error("unsupported host request: {0}")]
    Unsupported(String),

    #[error("error destroying interpreter session: {0:#}")]
    EngineTeardown(anyhow::Error),

    #[error("error closing socket")]
    ChannelClose(#[source] io::Error),
}

/// Why the session loop stopped.
#[derive(Debug, Error)]
pub enum Halt {
    #[error("session exit requested with status {0}")]
    Exit(i32),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl Halt {
    /// Process exit status for this halt.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exit(status) => *status,
            Self::Fatal(_) => 1,
        }
    }
}

/// Answer given to the engine when a callback cannot continue because the
/// session is halting. The engine must abandon the current evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("session is halting")]
pub struct Halted;
