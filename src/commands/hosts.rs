//! Hosts command - manage the trust store.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use whisperlink::chat::config;
use whisperlink::trust::{marker_path, parse_fingerprint, MigrationOutcome, TrustStore};

use super::{open_trust_store, CommandExecutor};

/// Manage trusted hosts.
///
/// A host is trusted by the SHA-256 fingerprint of its identity key. Only
/// trusted hosts can complete a handshake with you.
#[derive(Args, Debug)]
pub struct HostsCommand {
    #[command(subcommand)]
    pub action: HostsAction,
}

#[derive(Subcommand, Debug)]
pub enum HostsAction {
    /// List trusted hosts
    List,

    /// Trust a host
    Add(HostsAddArgs),

    /// Stop trusting the host at an endpoint
    Remove(HostsRemoveArgs),

    /// Give a host a display name
    Rename(HostsRenameArgs),

    /// Import the trust store written by older releases
    Migrate,
}

#[derive(Args, Debug)]
pub struct HostsAddArgs {
    /// Endpoint (host:port or name.onion[:port])
    pub endpoint: String,

    /// The host's fingerprint (64 hex characters)
    pub fingerprint: String,

    /// Display name
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct HostsRemoveArgs {
    /// Endpoint of the host to remove
    pub endpoint: String,
}

#[derive(Args, Debug)]
pub struct HostsRenameArgs {
    /// The host's fingerprint
    pub fingerprint: String,

    /// New display name
    pub name: String,
}

impl CommandExecutor for HostsCommand {
    fn execute(&self) -> Result<()> {
        match &self.action {
            HostsAction::List => list_hosts(),
            HostsAction::Add(args) => add_host(args),
            HostsAction::Remove(args) => remove_host(args),
            HostsAction::Rename(args) => rename_host(args),
            HostsAction::Migrate => migrate_hosts(),
        }
    }
}

fn list_hosts() -> Result<()> {
    let store = open_trust_store()?;

    if store.is_empty() {
        println!("No trusted hosts.");
        println!();
        println!("Add one with: whisperlink hosts add <endpoint> <fingerprint>");
        return Ok(());
    }

    println!("Trusted hosts:");
    println!();
    for entry in store.list() {
        println!(
            "  {:<16} {:<32} {}",
            entry.label(),
            entry.endpoint,
            entry.fingerprint
        );
    }
    Ok(())
}

fn add_host(args: &HostsAddArgs) -> Result<()> {
    let store = open_trust_store()?;
    let fingerprint = parse_fingerprint(&args.fingerprint)?;
    let entry = store
        .add(fingerprint, &args.endpoint, args.name.as_deref())
        .context("Failed to add host")?;

    println!("Trusted {} at {}", entry.label(), entry.endpoint);
    Ok(())
}

fn remove_host(args: &HostsRemoveArgs) -> Result<()> {
    let store = open_trust_store()?;
    let entry = store
        .remove_by_endpoint(&args.endpoint)
        .context("Failed to remove host")?;

    println!("Removed {} ({})", entry.label(), entry.fingerprint.short());
    Ok(())
}

fn rename_host(args: &HostsRenameArgs) -> Result<()> {
    let store = open_trust_store()?;
    let fingerprint = parse_fingerprint(&args.fingerprint)?;
    store
        .rename(&fingerprint, &args.name)
        .context("Failed to rename host")?;

    println!("Renamed {} to '{}'", fingerprint.short(), args.name);
    Ok(())
}

fn migrate_hosts() -> Result<()> {
    let legacy = config::legacy_trust_store_path().context("Unable to determine the config directory")?;
    let current = config::trust_store_path().context("Unable to determine the config directory")?;

    match TrustStore::migrate(&legacy, &current).context("Migration failed")? {
        MigrationOutcome::NothingToMigrate => {
            println!("No legacy trust store at {}", legacy.display());
        }
        MigrationOutcome::AlreadyMigrated => {
            println!("Already migrated ({})", marker_path(&legacy).display());
        }
        MigrationOutcome::Migrated { imported, skipped } => {
            println!("Imported {} host(s), skipped {}", imported, skipped);
            println!("Trust store: {}", current.display());
        }
    }
    Ok(())
}
