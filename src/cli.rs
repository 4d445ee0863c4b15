//! Command-line surface, adapted from the teacher's `cli::commands::Cli`.

use clap::Parser;
use std::path::PathBuf;

/// SOCKS5-over-SSH tunnel broker: expose a local SOCKS5 proxy that tunnels
/// traffic over one or two cascaded SSH hops.
#[derive(Parser, Debug)]
#[command(name = "socks-ssh-broker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the tunnel config JSON document.
    #[arg(short, long, default_value = "tunnel_config.json")]
    pub config: PathBuf,

    /// Override the config's local_port.
    #[arg(short, long)]
    pub local_port: Option<u16>,

    /// Attempt server-side remediation on the first hop if connecting fails.
    #[arg(long)]
    pub repair: bool,
}
