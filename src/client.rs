//! Controller side of the protocol.
//!
//! [`Controller`] drives an adapter over any duplex stream: it submits
//! source, answers input requests, assigns and reads values, and asks the
//! adapter to exit.

use std::io::{Read, Write};

use thiserror::Error;
use tracing::debug;

use crate::engine::Status;
use crate::error::FatalError;
use crate::transport::{Framer, Major};

/// Errors seen by the controller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FatalError),

    #[error("adapter exited with status {0}")]
    Exited(i32),

    #[error("unexpected message with major code {0}")]
    Unexpected(u8),
}

/// Result of one Execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    /// `(category, text)` for every Output received before the status.
    pub output: Vec<(i32, Vec<u8>)>,
}

impl Outcome {
    /// Concatenated text of every output in `category`.
    pub fn text(&self, category: i32) -> String {
        self.output
            .iter()
            .filter(|(c, _)| *c == category)
            .map(|(_, text)| String::from_utf8_lossy(text))
            .collect()
    }
}

/// Reply to a Read-Value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueReply {
    pub status: Status,
    pub bytes: Vec<u8>,
}

/// Protocol client for one adapter.
pub struct Controller<S> {
    framer: Framer<S>,
}

impl<S: Read + Write> Controller<S> {
    pub fn new(stream: S) -> Result<Self, ClientError> {
        Ok(Self {
            framer: Framer::new(stream)?,
        })
    }

    /// Execute `source`, answering each input request with `on_input`.
    pub fn execute<F>(&mut self, source: &[u8], mut on_input: F) -> Result<Outcome, ClientError>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        self.framer.write_message(Major::Execute, 0, source)?;
        let mut output = Vec::new();
        let status = self.await_status(Major::ExecuteStatus, &mut output, &mut on_input)?;
        Ok(Outcome { status, output })
    }

    /// Declare `name` and assign it the serialized `value`.
    pub fn assign(&mut self, name: &str, value: &[u8]) -> Result<Status, ClientError> {
        self.framer.write_message(Major::DeclareName, 0, name.as_bytes())?;
        self.framer.write_message(Major::Assign, 0, value)?;
        self.await_status(Major::AssignStatus, &mut Vec::new(), &mut refuse_input)
    }

    /// Evaluate `expression` and fetch its serialized value.
    pub fn read_value(&mut self, expression: &[u8]) -> Result<ValueReply, ClientError> {
        self.framer.write_message(Major::ReadValue, 0, expression)?;
        let status = self.await_status(Major::ReadValueStatus, &mut Vec::new(), &mut refuse_input)?;
        Ok(ValueReply {
            status,
            bytes: self.framer.body().to_vec(),
        })
    }

    /// Ask the adapter to exit with `status`. No reply follows.
    pub fn exit(&mut self, status: i32) -> Result<(), ClientError> {
        Ok(self.framer.write_message(Major::Exit, status, &[])?)
    }

    /// Underlying framer, for sending arbitrary messages.
    pub fn framer(&mut self) -> &mut Framer<S> {
        &mut self.framer
    }

    fn await_status(
        &mut self,
        expected: Major,
        output: &mut Vec<(i32, Vec<u8>)>,
        on_input: &mut dyn FnMut(&[u8]) -> Vec<u8>,
    ) -> Result<Status, ClientError> {
        loop {
            let header = self.framer.read_message()?;
            match header.kind() {
                Ok(major) if major == expected => return Ok(header.minor),
                Ok(Major::Output) => output.push((header.minor, self.framer.body().to_vec())),
                Ok(Major::InputRequest) => {
                    let reply = on_input(self.framer.body());
                    self.framer.write_message(Major::InputReply, 0, &reply)?;
                }
                Ok(Major::Exit) => {
                    debug!(status = header.minor, "Adapter exited");
                    return Err(ClientError::Exited(header.minor));
                }
                _ => return Err(ClientError::Unexpected(header.major)),
            }
        }
    }
}

fn refuse_input(_prompt: &[u8]) -> Vec<u8> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frame, frames, Loopback};

    fn controller(replies: &[Vec<u8>]) -> (Controller<Loopback>, std::rc::Rc<std::cell::RefCell<Vec<u8>>>) {
        let (stream, sent) = Loopback::new(replies.concat());
        (Controller::new(stream).unwrap(), sent)
    }

    #[test]
    fn execute_collects_output_and_answers_input() {
        let (mut client, sent) = controller(&[
            frame(Major::Output, 1, b"a"),
            frame(Major::InputRequest, 0, b"name? "),
            frame(Major::Output, 3, b"b"),
            frame(Major::ExecuteStatus, 0, b""),
        ]);

        let mut prompts = Vec::new();
        let outcome = client
            .execute(b"go", |prompt| {
                prompts.push(prompt.to_vec());
                b"bob".to_vec()
            })
            .unwrap();

        assert_eq!(outcome.status, 0);
        assert_eq!(outcome.output, vec![(1, b"a".to_vec()), (3, b"b".to_vec())]);
        assert_eq!(outcome.text(1), "a");
        assert_eq!(prompts, vec![b"name? ".to_vec()]);
        assert_eq!(
            frames(&sent.borrow()),
            vec![
                (Major::Execute.code(), 0, b"go".to_vec()),
                (Major::InputReply.code(), 0, b"bob".to_vec()),
            ]
        );
    }

    #[test]
    fn assign_sends_declare_then_assign() {
        let (mut client, sent) = controller(&[frame(Major::AssignStatus, 0, b"")]);
        assert_eq!(client.assign("x", b"v").unwrap(), 0);
        assert_eq!(
            frames(&sent.borrow()),
            vec![
                (Major::DeclareName.code(), 0, b"x".to_vec()),
                (Major::Assign.code(), 0, b"v".to_vec()),
            ]
        );
    }

    #[test]
    fn read_value_returns_body() {
        let (mut client, _) = controller(&[frame(Major::ReadValueStatus, 0, b"abc")]);
        let reply = client.read_value(b"x").unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(reply.bytes, b"abc");
    }

    #[test]
    fn exit_message_ends_exchange() {
        let (mut client, _) = controller(&[frame(Major::Exit, 7, b"")]);
        let err = client.execute(b"bye", |_| Vec::new()).unwrap_err();
        assert!(matches!(err, ClientError::Exited(7)));
    }

    #[test]
    fn unexpected_message_is_an_error() {
        let (mut client, _) = controller(&[frame(Major::AssignStatus, 0, b"")]);
        let err = client.execute(b"x", |_| Vec::new()).unwrap_err();
        assert!(matches!(err, ClientError::Unexpected(13)));
    }

    #[test]
    fn exit_sends_status_in_minor() {
        let (mut client, sent) = controller(&[]);
        client.exit(4).unwrap();
        assert_eq!(frames(&sent.borrow()), vec![(Major::Exit.code(), 4, Vec::new())]);
    }
}
