//! Wire-level message model.
//!
//! Every message is a fixed 12-byte header followed by `len` body bytes:
//!
//! ```text
//! ┌───────┬───────┬──────────────┬──────────────┬──────────────┐
//! │ major │  pad  │ minor        │ len          │ body         │
//! │ 1 byte│3 bytes│ i32 BE       │ u32 BE       │ len bytes    │
//! └───────┴───────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! The pad bytes are written as zero and ignored on read.

/// Header size in bytes.
pub const HEADER_SIZE: usize = 12;

/// Message kinds. Discriminants are the on-wire major codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Major {
    /// Run the body as engine source text.
    Execute = 1,
    /// Status of an `Execute`; minor carries the engine status.
    ExecuteStatus = 2,
    /// The engine wants a line of input; body is the prompt.
    InputRequest = 3,
    /// Answer to an `InputRequest`; body is the line.
    InputReply = 4,
    /// Host request the adapter refuses to service.
    HostRequest = 5,
    HostReply = 6,
    /// Console text; minor is the output category.
    Output = 7,
    Break = 8,
    /// Fetch the serialized bytes of an expression's value.
    ReadValue = 9,
    ReadValueStatus = 10,
    /// Set the pending target name for the next `Assign`.
    DeclareName = 11,
    /// Assign the body bytes to the declared name.
    Assign = 12,
    AssignStatus = 13,
    Edit = 14,
    File = 15,
    /// Session is terminating; minor is the exit status.
    Exit = 16,
}

impl Major {
    /// On-wire code of this message kind.
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Major {
    /// The unrecognized code.
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Execute,
            2 => Self::ExecuteStatus,
            3 => Self::InputRequest,
            4 => Self::InputReply,
            5 => Self::HostRequest,
            6 => Self::HostReply,
            7 => Self::Output,
            8 => Self::Break,
            9 => Self::ReadValue,
            10 => Self::ReadValueStatus,
            11 => Self::DeclareName,
            12 => Self::Assign,
            13 => Self::AssignStatus,
            14 => Self::Edit,
            15 => Self::File,
            16 => Self::Exit,
            other => return Err(other),
        })
    }
}

/// Categories carried in the minor field of `Output` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OutputCategory {
    Formatted = 1,
    Error = 2,
    Log = 3,
    System = 4,
    /// Reserved: intercepted and turned into an `Exit` message.
    Exit = 5,
    File = 6,
}

impl OutputCategory {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Formatted),
            2 => Some(Self::Error),
            3 => Some(Self::Log),
            4 => Some(Self::System),
            5 => Some(Self::Exit),
            6 => Some(Self::File),
            _ => None,
        }
    }
}

/// Decoded message header.
///
/// `major` is kept as the raw byte so that unknown codes can still be
/// reported; use [`Header::kind`] to classify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u8,
    pub minor: i32,
    pub len: u32,
}

impl Header {
    pub const fn new(major: Major, minor: i32, len: u32) -> Self {
        Self {
            major: major.code(),
            minor,
            len,
        }
    }

    /// Classify the major code.
    pub fn kind(&self) -> Result<Major, u8> {
        Major::try_from(self.major)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.major;
        buf[4..8].copy_from_slice(&self.minor.to_be_bytes());
        buf[8..12].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            major: buf[0],
            minor: i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }
}
