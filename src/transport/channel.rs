//! Acquisition of the controlling duplex channel.
//!
//! The controller is reached either by connecting to `host:port` over TCP
//! or by adopting a descriptor that the parent process left open.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::Duplex;

/// Where the controller lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Connect to a listening controller.
    Connect { host: String, port: u16 },
    /// Adopt an already-connected descriptor.
    Descriptor(i32),
}

impl Endpoint {
    /// Parse `host:port`, or a bare `port` on `localhost`.
    pub fn parse_connect(spec: &str) -> Result<Self> {
        let (host, port) = match spec.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => ("localhost", spec),
        };
        if host.is_empty() {
            bail!("missing host name in '{spec}'");
        }
        let port = port
            .parse::<u16>()
            .with_context(|| format!("invalid port number '{port}'"))?;
        Ok(Self::Connect {
            host: host.to_string(),
            port,
        })
    }

    /// Parse a descriptor number.
    pub fn parse_descriptor(spec: &str) -> Result<Self> {
        let fd = spec
            .parse::<i32>()
            .with_context(|| format!("invalid file descriptor number '{spec}'"))?;
        if fd < 0 {
            bail!("invalid file descriptor number '{spec}'");
        }
        Ok(Self::Descriptor(fd))
    }

    /// Open the channel described by this endpoint.
    pub fn open(&self) -> Result<Channel> {
        match self {
            Self::Connect { host, port } => {
                debug!(host = %host, port, "Connecting to controller");
                let stream = TcpStream::connect((host.as_str(), *port))
                    .with_context(|| format!("cannot connect socket to {host}:{port}"))?;
                stream
                    .set_nodelay(true)
                    .context("cannot unbuffer socket")?;
                info!(peer = %self, "Connected to controller");
                Ok(Channel::Tcp(stream))
            }
            Self::Descriptor(fd) => {
                let file = adopt_descriptor(*fd)?;
                info!(fd, "Adopted controlling descriptor");
                Ok(Channel::Inherited(file))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_connect(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { host, port } => write!(f, "{host}:{port}"),
            Self::Descriptor(fd) => write!(f, "fd {fd}"),
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn adopt_descriptor(fd: i32) -> Result<File> {
    use std::os::fd::{FromRawFd, OwnedFd};

    // SAFETY: the descriptor number was handed to us by the parent process
    // for our exclusive use; nothing else in this process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(File::from(owned))
}

#[cfg(not(unix))]
fn adopt_descriptor(fd: i32) -> Result<File> {
    bail!("adopting descriptor {fd} is only supported on unix")
}

/// The controlling duplex byte stream.
#[derive(Debug)]
pub enum Channel {
    Tcp(TcpStream),
    Inherited(File),
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            Self::Inherited(file) => file.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            Self::Inherited(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            Self::Inherited(file) => file.flush(),
        }
    }
}

impl Duplex for Channel {
    fn close(self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            // Closed on drop.
            Self::Inherited(_) => Ok(()),
        }
    }
}
