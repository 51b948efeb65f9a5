//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod chat;
mod hosts;
mod identity;

pub use chat::ChatCommand;
pub use hosts::HostsCommand;
pub use identity::IdentityCommand;

use std::path::PathBuf;

use anyhow::{Context, Result};

use whisperlink::chat::config;
use whisperlink::crypto::Identity;
use whisperlink::trust::TrustStore;

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Prompt for a passphrase (input hidden).
fn prompt_passphrase(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read passphrase")
}

/// Prompt twice and require both entries to match.
fn prompt_new_passphrase() -> Result<String> {
    let first = prompt_passphrase("New passphrase: ")?;
    let second = prompt_passphrase("Repeat passphrase: ")?;
    if first != second {
        anyhow::bail!("Passphrases do not match");
    }
    if first.is_empty() {
        anyhow::bail!("Passphrase must not be empty");
    }
    Ok(first)
}

fn identity_path() -> Result<PathBuf> {
    config::identity_path().context("Unable to determine the config directory")
}

/// Load the stored identity, asking for the passphrase when the key is sealed.
fn load_identity() -> Result<Identity> {
    let path = identity_path()?;
    if !path.exists() {
        anyhow::bail!(
            "No identity at {}. Run 'whisperlink identity init' first.",
            path.display()
        );
    }
    let passphrase = if Identity::is_sealed(&path).context("Failed to read identity")? {
        Some(prompt_passphrase("Identity passphrase: ")?)
    } else {
        None
    };
    Identity::load(&path, passphrase.as_deref()).context("Failed to load identity")
}

/// Open the trust store, importing a legacy store first if one is present.
fn open_trust_store() -> Result<TrustStore> {
    let current = config::trust_store_path().context("Unable to determine the config directory")?;
    if let Some(legacy) = config::legacy_trust_store_path() {
        TrustStore::migrate(&legacy, &current).context("Failed to migrate legacy trust store")?;
    }
    TrustStore::open(current).context("Failed to open trust store")
}
