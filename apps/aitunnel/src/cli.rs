use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "aitunnel",
    version,
    about = "Unified AI-gateway reverse proxy with SSH reverse-tunnel egress"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a commented starter config.
    Init {
        /// Config path (defaults to TUNNEL_CONFIG / ~/.ai-tunnel/config.yaml).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Start the gateway (daemonized unless -f).
    Start {
        /// Stay in the foreground instead of daemonizing.
        #[arg(short = 'f', long)]
        foreground: bool,
        #[arg(long, env = "TUNNEL_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Stop a running daemon.
    Stop,
    /// Stop then start the daemon.
    Restart {
        #[arg(long, env = "TUNNEL_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Report whether the daemon is running.
    Status,
    /// Print the daemon log.
    Logs {
        /// Keep following the log as it grows.
        #[arg(short = 'f', long)]
        follow: bool,
    },
}
