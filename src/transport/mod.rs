//! Transport layer for controller ↔ adapter communication.
//!
//! Provides the [`Framer`], which reads and writes length-prefixed binary
//! messages over any blocking duplex byte stream, and the [`channel`]
//! module that acquires that stream.

pub mod channel;
pub mod protocol;

pub use channel::{Channel, Endpoint};
pub use protocol::{Header, Major, OutputCategory, HEADER_SIZE};

use std::io::{self, Read, Write};

use tracing::trace;

use crate::error::FatalError;

/// Default starting capacity of the body buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Extra room kept past the largest body, so a NUL terminator can be
/// appended without reallocating.
pub const BUFFER_SLACK: usize = 32;

/// Largest body length that may be written (`len` must fit in an `i32`).
pub const MAX_OUTPUT_LEN: usize = i32::MAX as usize;

/// Check an outgoing body length and convert it to the wire field.
pub fn frame_len(len: usize) -> Result<u32, FatalError> {
    if len > MAX_OUTPUT_LEN {
        return Err(FatalError::BodyTooLarge(len));
    }
    u32::try_from(len).map_err(|_| FatalError::BodyTooLarge(len))
}

/// A duplex stream that can be shut down in both directions.
pub trait Duplex: Read + Write {
    /// Shut the stream down so the peer sees end of file.
    fn close(self) -> io::Result<()>;
}

/// Message reader/writer over a blocking duplex stream.
///
/// Owns a single body buffer reused for every incoming message. The buffer
/// grows to fit the largest declared length and never shrinks.
pub struct Framer<S> {
    stream: S,
    body: Vec<u8>,
}

impl<S: Read + Write> Framer<S> {
    /// Wrap a stream with the default buffer capacity.
    pub fn new(stream: S) -> Result<Self, FatalError> {
        Self::with_capacity(stream, DEFAULT_BUFFER_CAPACITY)
    }

    /// Wrap a stream, preallocating `capacity` body bytes.
    pub fn with_capacity(stream: S, capacity: usize) -> Result<Self, FatalError> {
        let mut framer = Self {
            stream,
            body: Vec::new(),
        };
        framer.reserve(capacity)?;
        Ok(framer)
    }

    /// Block until a whole message has arrived.
    ///
    /// Returns the header; the body is available through [`Framer::body`]
    /// until the next read.
    pub fn read_message(&mut self) -> Result<Header, FatalError> {
        let mut raw = [0u8; HEADER_SIZE];
        self.stream
            .read_exact(&mut raw)
            .map_err(FatalError::ReadHeader)?;
        let header = Header::decode(&raw);
        trace!(major = header.major, minor = header.minor, len = header.len, "read header");

        let len = header.len as usize;
        self.reserve(len)?;
        self.body.clear();
        self.body.resize(len, 0);
        self.stream
            .read_exact(&mut self.body)
            .map_err(FatalError::ReadBody)?;
        Ok(header)
    }

    /// Body of the most recently read message.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Block until the header and body are fully written.
    pub fn write_message(&mut self, major: Major, minor: i32, body: &[u8]) -> Result<(), FatalError> {
        let header = Header::new(major, minor, frame_len(body.len())?);
        trace!(major = ?major, minor, len = header.len, "write message");

        self.stream
            .write_all(&header.encode())
            .map_err(FatalError::Write)?;
        if !body.is_empty() {
            self.stream.write_all(body).map_err(FatalError::Write)?;
        }
        self.stream.flush().map_err(FatalError::Write)
    }

    /// Current body buffer capacity.
    pub fn capacity(&self) -> usize {
        self.body.capacity()
    }

    /// Give back the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn reserve(&mut self, len: usize) -> Result<(), FatalError> {
        let wanted = len.saturating_add(BUFFER_SLACK);
        if self.body.capacity() < wanted {
            self.body
                .try_reserve_exact(wanted - self.body.len())
                .map_err(|source| FatalError::OutOfMemory { len, source })?;
        }
        Ok(())
    }
}

impl<S: Duplex> Framer<S> {
    /// Flush and shut down the channel.
    pub fn close(mut self) -> Result<(), FatalError> {
        self.stream.flush().map_err(FatalError::ChannelClose)?;
        self.stream.close().map_err(FatalError::ChannelClose)
    }
}
