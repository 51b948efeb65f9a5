//! WhisperLink - authenticated peer-to-peer chat
//!
//! A CLI for encrypted chat and file transfer between peers that trust each
//! other's identity fingerprints. Works over plain TCP or Tor.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{ChatCommand, CommandExecutor, HostsCommand, IdentityCommand};

/// WhisperLink - authenticated peer-to-peer chat
///
/// Every session is a signed X25519 exchange between two identities that have
/// already trusted each other's fingerprints. Messages and files travel in
/// AES-256-GCM frames and keys rotate during the session.
#[derive(Parser)]
#[command(name = "whisperlink")]
#[command(version)]
#[command(about = "Authenticated, forward-secret peer-to-peer chat over TCP or Tor")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or show your identity
    Identity(IdentityCommand),

    /// Manage trusted hosts
    Hosts(HostsCommand),

    /// Start an interactive chat session
    Chat(ChatCommand),
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("whisperlink=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Identity(cmd) => cmd.execute(),
        Commands::Hosts(cmd) => cmd.execute(),
        Commands::Chat(cmd) => cmd.execute(),
    }
}
