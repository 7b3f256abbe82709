//! CLI dispatcher for the application binary.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use argus::pipeline::{self, RuntimeOverrides};

/// Parse CLI arguments and run the requested subcommand. Invoking the binary
/// with no subcommand serves with environment defaults.
pub fn dispatch() -> Result<()> {
    let cli = AppCli::parse();
    match cli.command {
        Some(Command::Serve(args)) => pipeline::run(args.into()),
        None => pipeline::run(RuntimeOverrides::default()),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "argus",
    version,
    about = "Multi-camera AI surveillance pipeline"
)]
struct AppCli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the surveillance pipeline and API server.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Bind address (overrides APP_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Bind port (overrides APP_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Frame storage directory (overrides FRAME_STORE_ROOT).
    #[arg(long)]
    frames_root: Option<PathBuf>,
}

impl From<ServeArgs> for RuntimeOverrides {
    fn from(args: ServeArgs) -> Self {
        RuntimeOverrides {
            host: args.host,
            port: args.port,
            frames_root: args.frames_root,
        }
    }
}
