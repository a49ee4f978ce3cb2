//! Interpreter engine boundary.
//!
//! The dispatcher talks to the embedded interpreter only through the
//! [`Engine`] trait; the interpreter talks back only through [`Host`].
//! The bundled implementation embeds Lua.

pub mod lua;

pub use lua::LuaEngine;

use std::fmt;
use std::rc::Weak;

use crate::error::Halted;

/// Engine status code: 0 is success, anything else is an engine error.
pub type Status = i32;

/// Successful status.
pub const OK: Status = 0;

/// Status used when a protocol precondition fails: Assign without a
/// declared name, or a Read-Value reply that is not a flat byte vector.
pub const PROTOCOL_ERROR: Status = 19;

/// Element type of an interpreter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NounType {
    Boolean,
    /// Bytes / characters.
    Literal,
    Integer,
    Float,
    Boxed,
    Other(i64),
}

impl NounType {
    /// Numeric type code used in diagnostics.
    pub const fn code(self) -> i64 {
        match self {
            Self::Boolean => 1,
            Self::Literal => 2,
            Self::Integer => 4,
            Self::Float => 8,
            Self::Boxed => 32,
            Self::Other(code) => code,
        }
    }
}

/// An interpreter value in raw form: element type, shape and data bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Noun {
    pub kind: NounType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Noun {
    /// A flat byte vector.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            kind: NounType::Literal,
            shape: vec![data.len()],
            data,
        }
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// The bytes of a rank-1 literal, or `None` for any other shape or type.
    pub fn as_byte_vector(&self) -> Option<&[u8]> {
        match (self.kind, self.shape.as_slice()) {
            (NounType::Literal, [len]) => self.data.get(..*len),
            _ => None,
        }
    }
}

/// A line of input delivered to the engine: the reply bytes followed by a
/// terminating NUL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLine(Vec<u8>);

impl InputLine {
    pub fn new(text: &[u8]) -> Self {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text);
        line.push(0);
        Self(line)
    }

    /// The text without the terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..self.0.len() - 1]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.0
    }
}

/// Diagnostic snapshot of a host request the adapter refuses.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsupportedRequest {
    pub minor: i32,
    pub argument: Noun,
}

impl fmt::Display for UnsupportedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leading = &self.argument.data[..self.argument.data.len().min(8)];
        write!(
            f,
            "minor={} type={} rank={} shape={:?} len={} leading={:02x?}",
            self.minor,
            self.argument.kind.code(),
            self.argument.rank(),
            self.argument.shape,
            self.argument.data.len(),
            leading,
        )
    }
}

/// Callback surface the engine uses while it runs.
///
/// Every call can fail with [`Halted`]; the engine must then stop the
/// current evaluation and return to its caller.
pub trait Host {
    /// Emit console text. Category 5 requests process exit.
    fn output(&self, category: i32, text: &[u8]) -> Result<(), Halted>;

    /// Ask the controller for a line of input.
    fn request_input(&self, prompt: &[u8]) -> Result<InputLine, Halted>;

    /// Report a request the adapter does not service. Always halts.
    fn unsupported(&self, request: &UnsupportedRequest) -> Halted;
}

/// An embedded interpreter session.
///
/// Methods take `&self`: the engine is re-entered from its own callbacks
/// while an outer evaluation is still on the stack.
pub trait Engine {
    /// Register the callback surface. Called once, before any evaluation.
    fn attach(&self, host: Weak<dyn Host>);

    /// Evaluate source text.
    fn execute(&self, source: &[u8]) -> Status;

    /// Fetch a global by name.
    fn get_value(&self, name: &str) -> Result<Noun, Status>;

    /// Store a global by name.
    fn set_value(&self, name: &str, value: &Noun) -> Status;

    /// Source that resets `slot` to an empty value.
    fn clear_script(&self, slot: &str) -> Vec<u8>;

    /// Source that evaluates `expression` and stores the result in `slot`.
    fn bind_script(&self, slot: &str, expression: &[u8]) -> Vec<u8>;

    /// Source that fails unless `source` holds a value, then stores the
    /// serialized bytes of that value in `reply`.
    fn serialize_script(&self, reply: &str, source: &str) -> Vec<u8>;

    /// Source that deserializes `reply` into the global whose name is the
    /// string held in `name_slot`.
    fn deserialize_script(&self, name_slot: &str, reply: &str) -> Vec<u8>;

    /// Destroy the session.
    fn shutdown(self) -> anyhow::Result<()>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_vector_guard() {
        assert_eq!(Noun::bytes(b"abc".to_vec()).as_byte_vector(), Some(&b"abc"[..]));
        assert_eq!(Noun::bytes(Vec::new()).as_byte_vector(), Some(&b""[..]));

        let scalar = Noun {
            kind: NounType::Literal,
            shape: vec![],
            data: b"a".to_vec(),
        };
        assert_eq!(scalar.as_byte_vector(), None);

        let table = Noun {
            kind: NounType::Literal,
            shape: vec![2, 2],
            data: b"abcd".to_vec(),
        };
        assert_eq!(table.as_byte_vector(), None);

        let ints = Noun {
            kind: NounType::Integer,
            shape: vec![1],
            data: 5i64.to_le_bytes().to_vec(),
        };
        assert_eq!(ints.as_byte_vector(), None);

        let short = Noun {
            kind: NounType::Literal,
            shape: vec![9],
            data: b"abc".to_vec(),
        };
        assert_eq!(short.as_byte_vector(), None);
    }

    #[test]
    fn input_line_is_nul_terminated() {
        let line = InputLine::new(b"2 + 2");
        assert_eq!(line.as_bytes(), b"2 + 2");
        assert_eq!(line.as_bytes_with_nul(), b"2 + 2\0");
        assert_eq!(InputLine::new(b"").as_bytes_with_nul(), b"\0");
    }

    #[test]
    fn unsupported_request_diagnostics() {
        let request = UnsupportedRequest {
            minor: 11,
            argument: Noun::bytes(b"0123456789".to_vec()),
        };
        let text = request.to_string();
        assert!(text.contains("minor=11"));
        assert!(text.contains("type=2"));
        assert!(text.contains("shape=[10]"));
        assert!(text.contains("leading=[30, 31, 32, 33, 34, 35, 36, 37]"));
    }
}
