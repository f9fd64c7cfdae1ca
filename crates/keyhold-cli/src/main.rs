use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use keyhold_core::{Config, Error, PinVault, UserContext};
use tracing::debug;
use zeroize::Zeroizing;

const ENV_PIN: &str = "KEYHOLD_PIN";
const ENV_PIN_CONFIRM: &str = "KEYHOLD_PIN_CONFIRM";
const ENV_RECOVERY_KEY: &str = "KEYHOLD_RECOVERY_KEY";

#[derive(Parser)]
#[command(name = "keyhold")]
#[command(about = "Manage this device's end-to-end encryption identity", long_about = None)]
struct Cli {
    /// Config file (JSON). Defaults to the platform config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding config and KEYHOLD_DB
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enable encryption for a user on this device
    Enroll {
        user: String,
        /// Also remember this device so it can unlock without a PIN
        #[arg(long)]
        remember: bool,
    },

    /// Check a PIN (or the remembered device) opens the identity
    Unlock {
        user: String,
        /// Use the remembered-device bundle instead of a PIN
        #[arg(long)]
        remembered: bool,
    },

    /// Recover with the recovery key and choose a new PIN
    Recover { user: String },

    /// Stop remembering this device; PIN and recovery key keep working
    Forget { user: String },

    /// Remove the user's identity and bundles from this device
    SignOut { user: String },

    /// Show enrollment state, device uuid and public key
    Status { user: String },

    /// Print the fingerprint of the session key shared with a peer
    SessionFingerprint {
        user: String,
        /// Peer public key, base64url
        peer: String,
        #[arg(long)]
        remembered: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyhold=info,keyhold_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let vault = PinVault::from_config(&config)?;
    debug!(db = %config.database_path.display(), "using identity store");

    match cli.command {
        Commands::Enroll { user, remember } => {
            let pin = prompt_pin_twice("New PIN: ")?;
            let outcome = vault
                .enable_with_pin(&user, &pin, remember)
                .await
                .map_err(|e| user_facing(e, UserContext::Enrollment))?;

            eprintln!("Write down this recovery key. It will not be shown again:");
            println!("{}", outcome.recovery_key.display_string().as_str());
            eprintln!();
            print_json(&serde_json::json!({
                "user": outcome.user_id,
                "device_uuid": outcome.device_uuid,
                "public_key": outcome.public_key.to_base64(),
                "fingerprint": outcome.public_key.fingerprint(),
                "remembered": outcome.remembered,
                "state": outcome.state.to_string(),
            }))?;
        }

        Commands::Unlock { user, remembered } => {
            let identity = if remembered {
                vault.unlock_remembered(&user).await
            } else {
                let pin = prompt_pin("PIN: ")?;
                vault.unlock_with_pin(&user, &pin).await
            }
            .map_err(|e| user_facing(e, UserContext::Unlock))?;

            print_json(&serde_json::json!({
                "user": identity.user_id,
                "device_id": identity.device_id,
                "device_uuid": identity.device_uuid,
                "public_key": identity.public_key.to_base64(),
                "unlocked": true,
            }))?;
        }

        Commands::Recover { user } => {
            let key = prompt_secret(ENV_RECOVERY_KEY, "Recovery key: ")?;
            let recovered = vault
                .recover_with_key(&user, &key)
                .await
                .map_err(|e| user_facing(e, UserContext::Recovery))?;
            let pin = prompt_pin_twice("New PIN: ")?;
            let identity = vault
                .set_new_pin(recovered, &pin)
                .await
                .map_err(|e| user_facing(e, UserContext::Recovery))?;

            print_json(&serde_json::json!({
                "user": identity.user_id,
                "public_key": identity.public_key.to_base64(),
                "pin_reset": true,
            }))?;
        }

        Commands::Forget { user } => {
            vault.forget_device(&user).await?;
            eprintln!("This device will ask for the PIN next time.");
        }

        Commands::SignOut { user } => {
            vault.sign_out(&user).await?;
            eprintln!("Removed local identity for {user}.");
        }

        Commands::Status { user } => {
            let enrolled = vault.is_enrolled(&user).await?;
            let device = vault.store().get_device(&user).await?;
            let remembered = vault.store().get_remembered_bundle(&user).await?.is_some();
            print_json(&serde_json::json!({
                "user": user,
                "enrolled": enrolled,
                "remembered": remembered,
                "device_id": device.as_ref().map(|d| d.device_id.clone()),
                "device_uuid": device.as_ref().and_then(|d| d.device_uuid),
                "public_key": device.as_ref().map(|d| d.public_key.to_base64()),
                "fingerprint": device.as_ref().map(|d| d.public_key.fingerprint()),
            }))?;
        }

        Commands::SessionFingerprint {
            user,
            peer,
            remembered,
        } => {
            let identity = if remembered {
                vault.unlock_remembered(&user).await
            } else {
                let pin = prompt_pin("PIN: ")?;
                vault.unlock_with_pin(&user, &pin).await
            }
            .map_err(|e| user_facing(e, UserContext::Unlock))?;

            let session = identity.session_key(&peer)?;
            println!("{}", session.fingerprint());
        }
    }

    vault.store().close().await;
    Ok(())
}

/// Log the detail, hand the user the generic message.
fn user_facing(e: Error, context: UserContext) -> anyhow::Error {
    debug!(kind = e.kind(), error = %e, "operation failed");
    anyhow!(e.user_message(context))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn prompt_secret(env: &str, prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(env) {
        if !value.is_empty() {
            return Ok(Zeroizing::new(value));
        }
    }
    let value = rpassword::prompt_password(prompt).map_err(|e| anyhow!("prompt: {e}"))?;
    Ok(Zeroizing::new(value))
}

fn prompt_pin(prompt: &str) -> Result<Zeroizing<String>> {
    prompt_secret(ENV_PIN, prompt)
}

fn prompt_pin_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pin) = std::env::var(ENV_PIN) {
        if !pin.is_empty() {
            if let Ok(confirm) = std::env::var(ENV_PIN_CONFIRM) {
                if confirm != pin {
                    return Err(anyhow!("PIN confirmation mismatch"));
                }
            }
            return Ok(Zeroizing::new(pin));
        }
    }
    let first = prompt_pin(prompt)?;
    keyhold_core::vault::validate_pin(&first)
        .map_err(|e| anyhow!(e.user_message(UserContext::Enrollment)))?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm PIN: ").map_err(|e| anyhow!("prompt: {e}"))?,
    );
    if first != second {
        return Err(anyhow!("PINs do not match"));
    }
    Ok(first)
}
