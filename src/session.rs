//! Session lifecycle.
//!
//! A session owns exactly one engine and one channel. Starting it registers
//! the dispatcher as the engine's callback surface; running it loops
//! read → dispatch until something halts; shutting it down destroys the
//! engine and closes the channel.

use std::rc::{Rc, Weak};

use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::engine::{Engine, Host};
use crate::error::{FatalError, Halt};
use crate::transport::{Duplex, Framer};

/// A running protocol session.
pub struct Session<E: Engine + 'static, S: Duplex + 'static> {
    dispatcher: Rc<Dispatcher<E, S>>,
}

impl<E: Engine + 'static, S: Duplex + 'static> Session<E, S> {
    /// Wrap the channel and register callbacks with the engine.
    pub fn start(engine: E, stream: S, config: &SessionConfig) -> Result<Self, FatalError> {
        let framer = Framer::with_capacity(stream, config.initial_buffer_capacity)?;
        let dispatcher = Rc::new_cyclic(|this: &Weak<Dispatcher<E, S>>| {
            let host: Weak<dyn Host> = this.clone();
            engine.attach(host);
            Dispatcher::new(engine, framer)
        });
        info!(
            buffer_capacity = config.initial_buffer_capacity,
            "Session started"
        );
        Ok(Self { dispatcher })
    }

    /// Serve messages until the session halts.
    pub fn run(&self) -> Halt {
        loop {
            if let Err(halt) = self.dispatcher.step() {
                debug!(halt = %halt, "Session loop stopped");
                return halt;
            }
        }
    }

    /// Destroy the engine, then flush and shut down the channel.
    pub fn shutdown(self) -> Result<(), FatalError> {
        let dispatcher = Rc::try_unwrap(self.dispatcher).map_err(|_| {
            FatalError::EngineTeardown(anyhow::anyhow!("session is still referenced"))
        })?;
        let (engine, framer) = dispatcher.into_parts();
        engine.shutdown().map_err(FatalError::EngineTeardown)?;
        framer.close()?;
        info!("Session shut down");
        Ok(())
    }
}
