use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "gpubridge",
    author,
    version,
    about = "Brokers GPU buffers, the display socket and the vendor Vulkan channel"
)]
pub struct Cli {
    /// Read configuration from FILE instead of the per-user `gpubridge.toml`.
    #[arg(long, global = true, value_name = "FILE", env = "GPUBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Listen on the display socket and hand off client connections.
    Serve(ServeArgs),
    /// Prewarm, initialise the vendor channel and resolve entry points.
    Probe(ProbeArgs),
    /// Print the resolved configuration file and effective settings.
    Where(WhereArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path; overrides `socket.path`.
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Treat the socket path as relative to DIR and reset its directory first.
    #[arg(long, value_name = "DIR")]
    pub rootfs: Option<PathBuf>,

    /// Bounded wait per accept in milliseconds; overrides `socket.accept_timeout`.
    #[arg(long, value_name = "MILLISECONDS")]
    pub timeout_ms: Option<u64>,

    /// Stop after this many connections (0 = keep serving).
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub max_connections: u32,

    /// Exit after the first wait that ends without a client.
    #[arg(long)]
    pub idle_exit: bool,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Entry points to resolve (defaults to the loader bootstrap set).
    #[arg(value_name = "NAME")]
    pub names: Vec<String>,

    /// Also allocate, map and release a test buffer (e.g. `64x64`).
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub buffer: Option<String>,
}

#[derive(Args, Debug)]
pub struct WhereArgs {
    /// Emit JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
