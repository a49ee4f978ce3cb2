//! replink adapter
//!
//! Connects to a controller (or adopts an inherited descriptor) and serves
//! the message protocol against an embedded Lua session until the
//! controller or the script asks to exit.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use replink::{
    config::Config,
    engine::LuaEngine,
    error::Halt,
    session::Session,
    transport::Endpoint,
};

#[derive(Parser, Debug)]
#[command(name = "replink")]
#[command(about = "Serve an embedded interpreter session to a remote controller")]
#[command(group(ArgGroup::new("channel").required(true).args(["connect", "fd"])))]
struct Args {
    /// Controller address: host:port, or a bare port on localhost
    #[arg(long, alias = "jconnect", value_parser = Endpoint::parse_connect)]
    connect: Option<Endpoint>,

    /// Already-connected file descriptor to adopt
    #[arg(long, alias = "jfd", value_parser = Endpoint::parse_descriptor)]
    fd: Option<Endpoint>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // stderr only; stdout belongs to the interpreter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let endpoint = args
        .connect
        .or(args.fd)
        .context("Either --connect or --fd is required")?;

    let engine = LuaEngine::new(&config.engine).context("Failed to start interpreter")?;
    let channel = endpoint.open()?;
    info!(endpoint = %endpoint, "Controller channel open");

    let session = Session::start(engine, channel, &config.session)?;
    let halt = session.run();
    if let Halt::Fatal(e) = &halt {
        error!(error = %e, "Session failed");
    }

    if let Err(e) = session.shutdown() {
        error!(error = %e, "Teardown failed");
        std::process::exit(1);
    }

    info!(status = halt.exit_code(), "Exiting");
    std::process::exit(halt.exit_code());
}
