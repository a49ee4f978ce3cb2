//! Test doubles: a scripted engine and an in-memory duplex stream.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::rc::{Rc, Weak};

use crate::engine::{Engine, Host, Noun, Status, UnsupportedRequest, OK};
use crate::transport::{Duplex, Header, Major, HEADER_SIZE};

/// Status the scripted engine returns when a callback halts it.
pub const HALTED_STATUS: Status = 99;
/// Status for names without a value.
pub const UNDEFINED_STATUS: Status = 21;
/// Status for malformed commands and rejected names.
pub const REJECTED_STATUS: Status = 3;

/// Observable state of a [`ScriptedEngine`], shared with the test.
#[derive(Default)]
pub struct EngineState {
    pub globals: RefCell<HashMap<String, Noun>>,
    pub executed: RefCell<Vec<String>>,
    pub inputs: RefCell<Vec<Vec<u8>>>,
    pub shut_down: Cell<bool>,
    host: RefCell<Option<Weak<dyn Host>>>,
}

impl EngineState {
    pub fn define(&self, name: &str, value: Noun) {
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Noun> {
        self.globals.borrow().get(name).cloned()
    }
}

/// Engine whose "language" is one command per source text:
///
/// `ok`, `fail N`, `print TEXT`, `log TEXT`, `input PROMPT`, `exit TEXT`,
/// `unsupported`, plus the protocol scripts `clear SLOT`,
/// `bind SLOT NAME`, `serialize REPLY SOURCE`, `deserialize NAMESLOT REPLY`.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Rc<EngineState>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Rc<EngineState> {
        Rc::clone(&self.state)
    }

    fn host(&self) -> Option<Rc<dyn Host>> {
        self.state.host.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn run(&self, verb: &str, rest: &str) -> Result<Status, Status> {
        let host = || self.host().ok_or(HALTED_STATUS);
        let halted = |_| HALTED_STATUS;
        let globals = || self.state.globals.borrow_mut();

        Ok(match verb {
            "ok" => OK,
            "fail" => rest.parse().map_err(|_| REJECTED_STATUS)?,
            "print" => {
                host()?.output(1, rest.as_bytes()).map_err(halted)?;
                OK
            }
            "log" => {
                host()?.output(3, rest.as_bytes()).map_err(halted)?;
                OK
            }
            "input" => {
                let line = host()?.request_input(rest.as_bytes()).map_err(halted)?;
                self.state
                    .inputs
                    .borrow_mut()
                    .push(line.as_bytes_with_nul().to_vec());
                host()?.output(1, line.as_bytes()).map_err(halted)?;
                OK
            }
            "exit" => {
                host()?.output(5, rest.as_bytes()).map_err(halted)?;
                OK
            }
            "unsupported" => {
                let request = UnsupportedRequest {
                    minor: 11,
                    argument: Noun::bytes(rest.as_bytes().to_vec()),
                };
                return Err(halted(host()?.unsupported(&request)));
            }
            "clear" => {
                globals().remove(rest);
                OK
            }
            "bind" => {
                let (slot, name) = rest.split_once(' ').ok_or(REJECTED_STATUS)?;
                let mut globals = globals();
                match globals.get(name).cloned() {
                    Some(value) => globals.insert(slot.to_string(), value),
                    None => globals.remove(slot),
                };
                OK
            }
            "serialize" => {
                let (reply, source) = rest.split_once(' ').ok_or(REJECTED_STATUS)?;
                let mut globals = globals();
                let value = globals.get(source).cloned().ok_or(UNDEFINED_STATUS)?;
                globals.insert(reply.to_string(), value);
                OK
            }
            "deserialize" => {
                let (name_slot, reply) = rest.split_once(' ').ok_or(REJECTED_STATUS)?;
                let mut globals = globals();
                let name = globals.get(name_slot).cloned().ok_or(UNDEFINED_STATUS)?;
                let value = globals.get(reply).cloned().ok_or(UNDEFINED_STATUS)?;
                let name = String::from_utf8(name.data).map_err(|_| REJECTED_STATUS)?;
                globals.insert(name, value);
                OK
            }
            _ => REJECTED_STATUS,
        })
    }
}

impl Engine for ScriptedEngine {
    fn attach(&self, host: Weak<dyn Host>) {
        *self.state.host.borrow_mut() = Some(host);
    }

    fn execute(&self, source: &[u8]) -> Status {
        let text = String::from_utf8_lossy(source).into_owned();
        self.state.executed.borrow_mut().push(text.clone());
        let (verb, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));
        self.run(verb, rest).unwrap_or_else(|status| status)
    }

    fn get_value(&self, name: &str) -> Result<Noun, Status> {
        self.state.global(name).ok_or(UNDEFINED_STATUS)
    }

    fn set_value(&self, name: &str, value: &Noun) -> Status {
        if name == crate::dispatch::TARGET_SLOT && value.data.is_empty() {
            return REJECTED_STATUS;
        }
        self.state.define(name, value.clone());
        OK
    }

    fn clear_script(&self, slot: &str) -> Vec<u8> {
        format!("clear {slot}").into_bytes()
    }

    fn bind_script(&self, slot: &str, expression: &[u8]) -> Vec<u8> {
        let mut script = format!("bind {slot} ").into_bytes();
        script.extend_from_slice(expression);
        script
    }

    fn serialize_script(&self, reply: &str, source: &str) -> Vec<u8> {
        format!("serialize {reply} {source}").into_bytes()
    }

    fn deserialize_script(&self, name_slot: &str, reply: &str) -> Vec<u8> {
        format!("deserialize {name_slot} {reply}").into_bytes()
    }

    fn shutdown(self) -> anyhow::Result<()> {
        self.state.shut_down.set(true);
        Ok(())
    }
}

/// Duplex stream that reads from a prepared script and records writes.
pub struct Loopback {
    input: Cursor<Vec<u8>>,
    output: Rc<RefCell<Vec<u8>>>,
}

impl Loopback {
    /// Stream reading `input`; the returned handle sees everything written.
    pub fn new(input: Vec<u8>) -> (Self, Rc<RefCell<Vec<u8>>>) {
        let output = Rc::new(RefCell::new(Vec::new()));
        let stream = Self {
            input: Cursor::new(input),
            output: Rc::clone(&output),
        };
        (stream, output)
    }
}

impl Read for Loopback {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Duplex for Loopback {
    fn close(self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for Loopback {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encode one message with a raw major code.
pub fn raw_frame(major: u8, minor: i32, body: &[u8]) -> Vec<u8> {
    let header = Header {
        major,
        minor,
        len: u32::try_from(body.len()).unwrap(),
    };
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(body);
    bytes
}

/// Encode one message.
pub fn frame(major: Major, minor: i32, body: &[u8]) -> Vec<u8> {
    raw_frame(major.code(), minor, body)
}

/// Split a byte stream into `(major, minor, body)` triples.
pub fn frames(mut bytes: &[u8]) -> Vec<(u8, i32, Vec<u8>)> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        let (head, rest) = bytes.split_at(HEADER_SIZE);
        let header = Header::decode(head.try_into().unwrap());
        let (body, rest) = rest.split_at(header.len as usize);
        out.push((header.major, header.minor, body.to_vec()));
        bytes = rest;
    }
    out
}
