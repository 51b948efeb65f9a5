//! Identity command - create, show and replace the local identity.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use whisperlink::crypto::Identity;

use super::{identity_path, load_identity, prompt_new_passphrase, CommandExecutor};

/// Manage your long-term identity key.
///
/// Peers trust you by the fingerprint of this key, so share it with them
/// out of band (in person, over a call, on a signed page).
#[derive(Args, Debug)]
pub struct IdentityCommand {
    #[command(subcommand)]
    pub action: IdentityAction,
}

#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Generate a new identity
    Init(IdentityInitArgs),

    /// Print your fingerprint
    Show,

    /// Replace your identity with a new one (peers must re-add you)
    Reset(IdentityResetArgs),
}

#[derive(Args, Debug)]
pub struct IdentityInitArgs {
    /// Protect the key file with a passphrase
    #[arg(long)]
    pub seal: bool,
}

#[derive(Args, Debug)]
pub struct IdentityResetArgs {
    /// Protect the new key file with a passphrase
    #[arg(long)]
    pub seal: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

impl CommandExecutor for IdentityCommand {
    fn execute(&self) -> Result<()> {
        match &self.action {
            IdentityAction::Init(args) => init_identity(args),
            IdentityAction::Show => show_identity(),
            IdentityAction::Reset(args) => reset_identity(args),
        }
    }
}

fn init_identity(args: &IdentityInitArgs) -> Result<()> {
    let path = identity_path()?;
    if path.exists() {
        bail!(
            "Identity already exists at {}. Use 'identity reset' to replace it.",
            path.display()
        );
    }

    let passphrase = if args.seal {
        Some(prompt_new_passphrase()?)
    } else {
        None
    };
    let identity = Identity::load_or_create(&path, passphrase.as_deref())
        .context("Failed to create identity")?;

    println!("Identity created: {}", path.display());
    println!("Fingerprint: {}", identity.fingerprint());
    Ok(())
}

fn show_identity() -> Result<()> {
    let identity = load_identity()?;
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Short:       {}", identity.fingerprint().short());
    Ok(())
}

fn reset_identity(args: &IdentityResetArgs) -> Result<()> {
    let path = identity_path()?;

    if !args.yes {
        println!("This replaces your identity. Every peer will have to trust the new fingerprint.");
        println!("Type 'yes' to continue:");
        let mut answer = String::new();
        std::io::stdin()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;
        if answer.trim() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let passphrase = if args.seal {
        Some(prompt_new_passphrase()?)
    } else {
        None
    };
    let identity =
        Identity::reset(&path, passphrase.as_deref()).context("Failed to reset identity")?;

    println!("New fingerprint: {}", identity.fingerprint());
    Ok(())
}
