//! Command dispatcher and the reentrant input protocol.
//!
//! [`Dispatcher::handle`] acts on one incoming message. While it runs, the
//! engine may call back through [`Host`]; an input request sends a prompt
//! and then keeps dispatching whatever arrives until the matching
//! Input-Reply, recursing into `handle` for every other message.
//!
//! Termination never unwinds through the engine as a Rust error. A callback
//! that hits a [`Halt`] latches it and answers [`Halted`]; once the engine
//! returns, the dispatcher takes the latched halt and propagates it.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};

use tracing::{debug, error, trace};

use crate::engine::{Engine, Host, InputLine, Noun, Status, UnsupportedRequest, OK, PROTOCOL_ERROR};
use crate::error::{FatalError, Halt, Halted};
use crate::transport::{Framer, Header, Major, OutputCategory};

/// Slot receiving the value of a Read-Value expression.
pub const RESULT_SLOT: &str = "replink_result_";

/// Slot holding serialized bytes on their way in or out of the engine.
pub const REPLY_SLOT: &str = "replink_reply_";

/// Slot holding the name declared for the next Assign.
pub const TARGET_SLOT: &str = "replink_target_";

/// Protocol state for one session.
pub struct Dispatcher<E, S> {
    engine: E,
    framer: RefCell<Framer<S>>,
    /// Status of the last Declare-Name, until an Assign consumes it.
    pending_name: Cell<Option<Status>>,
    halt: RefCell<Option<Halt>>,
}

impl<E: Engine, S: Read + Write> Dispatcher<E, S> {
    pub fn new(engine: E, framer: Framer<S>) -> Self {
        Self {
            engine,
            framer: RefCell::new(framer),
            pending_name: Cell::new(None),
            halt: RefCell::new(None),
        }
    }

    /// Read one message and act on it.
    pub fn step(&self) -> Result<(), Halt> {
        let header = self.read()?;
        self.handle(header)
    }

    /// Act on a message whose header was just read; the body is still in
    /// the framer.
    pub fn handle(&self, header: Header) -> Result<(), Halt> {
        let major = header
            .kind()
            .map_err(FatalError::UnknownMajor)?;
        debug!(major = ?major, minor = header.minor, len = header.len, "Dispatching message");

        match major {
            Major::Execute => self.execute(),
            Major::DeclareName => self.declare_name(),
            Major::Assign => self.assign(),
            Major::ReadValue => self.read_value(),
            Major::HostRequest => {
                let body = self.framer.borrow().body().to_vec();
                let request = UnsupportedRequest {
                    minor: header.minor,
                    argument: Noun::bytes(body),
                };
                error!(request = %request, "Controller sent a host request");
                Err(FatalError::Unsupported(request.to_string()).into())
            }
            Major::Exit => {
                debug!(status = header.minor, "Controller requested exit");
                Err(Halt::Exit(header.minor))
            }
            other => Err(FatalError::Unexpected(other).into()),
        }
    }

    /// Take the engine and framer back.
    pub fn into_parts(self) -> (E, Framer<S>) {
        (self.engine, self.framer.into_inner())
    }

    fn execute(&self) -> Result<(), Halt> {
        let source = self.body();
        let status = self.run(&source)?;
        self.reply(Major::ExecuteStatus, status)
    }

    fn declare_name(&self) -> Result<(), Halt> {
        let name = self.body();
        let status = self.engine.set_value(TARGET_SLOT, &Noun::bytes(name));
        self.check_halt()?;
        trace!(status, "Declared target name");
        self.pending_name.set(Some(status));
        Ok(())
    }

    fn assign(&self) -> Result<(), Halt> {
        match self.pending_name.take() {
            Some(OK) => {}
            Some(status) => return self.reply(Major::AssignStatus, status),
            None => return self.reply(Major::AssignStatus, PROTOCOL_ERROR),
        }

        let status = self.store_declared(&self.body())?;
        self.release(&[TARGET_SLOT, REPLY_SLOT])?;
        self.reply(Major::AssignStatus, status)
    }

    fn store_declared(&self, value: &[u8]) -> Result<Status, Halt> {
        let status = self.engine.set_value(REPLY_SLOT, &Noun::bytes(value));
        self.check_halt()?;
        if status != OK {
            return Ok(status);
        }
        self.run(&self.engine.deserialize_script(TARGET_SLOT, REPLY_SLOT))
    }

    fn read_value(&self) -> Result<(), Halt> {
        let (status, bytes) = self.fetch_value(&self.body())?;
        self.release(&[RESULT_SLOT, REPLY_SLOT])?;
        self.send(Major::ReadValueStatus, status, &bytes)
    }

    /// Status and serialized bytes of `expression`; the bytes are empty
    /// unless the status is 0.
    fn fetch_value(&self, expression: &[u8]) -> Result<(Status, Vec<u8>), Halt> {
        let steps = [
            self.engine.clear_script(RESULT_SLOT),
            self.engine.bind_script(RESULT_SLOT, expression),
            self.engine.serialize_script(REPLY_SLOT, RESULT_SLOT),
        ];
        for script in &steps {
            let status = self.run(script)?;
            if status != OK {
                return Ok((status, Vec::new()));
            }
        }

        let fetched = self.engine.get_value(REPLY_SLOT);
        self.check_halt()?;
        Ok(match fetched {
            Ok(noun) => match noun.as_byte_vector() {
                Some(bytes) => (OK, bytes.to_vec()),
                None => {
                    debug!(kind = ?noun.kind, rank = noun.rank(), "Reply is not a byte vector");
                    (PROTOCOL_ERROR, Vec::new())
                }
            },
            Err(OK) => (PROTOCOL_ERROR, Vec::new()),
            Err(status) => (status, Vec::new()),
        })
    }

    /// Reset protocol slots so they are never visible to later requests.
    fn release(&self, slots: &[&str]) -> Result<(), Halt> {
        for slot in slots {
            let status = self.run(&self.engine.clear_script(slot))?;
            if status != OK {
                debug!(slot, status, "Failed to clear protocol slot");
            }
        }
        Ok(())
    }

    /// Send the prompt, then service messages until the Input-Reply.
    fn await_input(&self, prompt: &[u8]) -> Result<InputLine, Halt> {
        self.send(Major::InputRequest, 0, prompt)?;
        loop {
            let header = self.read()?;
            if header.major == Major::InputReply.code() {
                let line = InputLine::new(self.framer.borrow().body());
                trace!(len = header.len, "Input reply received");
                return Ok(line);
            }
            self.handle(header)?;
        }
    }

    fn emit(&self, category: i32, text: &[u8]) -> Result<(), Halt> {
        if category != OutputCategory::Exit.code() {
            return self.send(Major::Output, category, text);
        }
        let status = exit_status(text);
        self.send(Major::Exit, status, &[])?;
        Err(Halt::Exit(status))
    }

    /// Evaluate source and surface any halt latched during evaluation.
    fn run(&self, source: &[u8]) -> Result<Status, Halt> {
        let status = self.engine.execute(source);
        self.check_halt()?;
        Ok(status)
    }

    fn check_halt(&self) -> Result<(), Halt> {
        match self.halt.borrow_mut().take() {
            Some(halt) => Err(halt),
            None => Ok(()),
        }
    }

    fn latch(&self, halt: Halt) -> Halted {
        let mut slot = self.halt.borrow_mut();
        if slot.is_none() {
            *slot = Some(halt);
        }
        Halted
    }

    fn refuse_if_halted(&self) -> Result<(), Halted> {
        if self.halt.borrow().is_some() {
            return Err(Halted);
        }
        Ok(())
    }

    fn read(&self) -> Result<Header, Halt> {
        Ok(self.framer.borrow_mut().read_message()?)
    }

    /// Copy of the current body; the buffer is reused by nested reads.
    fn body(&self) -> Vec<u8> {
        self.framer.borrow().body().to_vec()
    }

    fn send(&self, major: Major, minor: i32, body: &[u8]) -> Result<(), Halt> {
        Ok(self.framer.borrow_mut().write_message(major, minor, body)?)
    }

    fn reply(&self, major: Major, status: Status) -> Result<(), Halt> {
        self.send(major, status, &[])
    }
}

impl<E: Engine, S: Read + Write> Host for Dispatcher<E, S> {
    fn output(&self, category: i32, text: &[u8]) -> Result<(), Halted> {
        self.refuse_if_halted()?;
        self.emit(category, text).map_err(|halt| self.latch(halt))
    }

    fn request_input(&self, prompt: &[u8]) -> Result<InputLine, Halted> {
        self.refuse_if_halted()?;
        self.await_input(prompt).map_err(|halt| self.latch(halt))
    }

    fn unsupported(&self, request: &UnsupportedRequest) -> Halted {
        error!(request = %request, "Engine made an unsupported host request");
        self.latch(FatalError::Unsupported(request.to_string()).into())
    }
}

/// Exit status carried in exit-category output text.
fn exit_status(text: &[u8]) -> i32 {
    std::str::from_utf8(text)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_parsing() {
        assert_eq!(exit_status(b"7"), 7);
        assert_eq!(exit_status(b" 0\n"), 0);
        assert_eq!(exit_status(b"-2"), -2);
        assert_eq!(exit_status(b"seven"), 1);
        assert_eq!(exit_status(b""), 1);
        assert_eq!(exit_status(b"\xff"), 1);
    }
}
