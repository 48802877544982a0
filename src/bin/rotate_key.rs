//! shellfleet-rotate-key - rotate the credential encryption key
//!
//! Mints a new primary key and re-encrypts every secret in the server
//! registry under it. Rows that cannot be decrypted are reported and left as
//! they are; running again with `--migrate-only` retries them without minting
//! another key.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use shellfleet::registry::ServerRegistry;
use shellfleet::{CredentialVault, FleetConfig, JsonFileRegistry, RotationOrchestrator, RotationReport};

#[derive(Parser)]
#[command(name = "shellfleet-rotate-key")]
#[command(about = "Rotate the shellfleet credential key and migrate stored secrets")]
#[command(version)]
struct Cli {
    /// Key file (default: SHELLFLEET_KEY_FILE or var/encryption.key)
    #[arg(short, long)]
    key_file: Option<PathBuf>,

    /// Server registry file (default: SHELLFLEET_REGISTRY_FILE or var/servers.json)
    #[arg(short, long)]
    registry: Option<PathBuf>,

    /// Re-encrypt stale rows under the current key without minting a new one
    #[arg(long)]
    migrate_only: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    shellfleet::init_logging();
    let cli = Cli::parse();

    let config = FleetConfig::from_env().context("Invalid SHELLFLEET_* environment")?;
    let key_file = cli.key_file.unwrap_or(config.key_file);
    let registry_file = cli.registry.unwrap_or(config.registry_file);

    let vault = Arc::new(
        CredentialVault::open(&key_file)
            .with_context(|| format!("Failed to open key file {}", key_file.display()))?,
    );
    let registry: Arc<dyn ServerRegistry> = Arc::new(JsonFileRegistry::new(&registry_file));
    let rows = registry
        .list()
        .await
        .with_context(|| format!("Failed to read registry {}", registry_file.display()))?
        .len();

    println!("Key file:  {}", key_file.display());
    println!("Registry:  {} ({} servers)", registry_file.display(), rows);
    println!("Primary:   {}", vault.primary_version());

    if !cli.yes {
        let action = if cli.migrate_only {
            "Re-encrypt stale credentials under the current key?"
        } else {
            "Generate a new key and re-encrypt all credentials?"
        };
        if !confirm(action)? {
            println!("Aborted.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let orchestrator = RotationOrchestrator::new(vault, registry);
    let report = if cli.migrate_only {
        orchestrator.migrate_only().await
    } else {
        orchestrator.rotate_and_migrate().await
    }
    .context("Key rotation failed")?;

    print_report(&report);
    info!("Rotation finished with primary key {}", report.version);

    Ok(if report.is_complete() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_report(report: &RotationReport) {
    println!();
    println!("Primary key is now {}", report.version);
    println!("  migrated:  {}", report.migrated.len());
    println!("  unchanged: {}", report.unchanged.len());
    println!("  skipped:   {}", report.skipped.len());

    for row in &report.skipped {
        println!("    {}: {}", row.alias, row.reason);
    }
    if !report.is_complete() {
        println!();
        println!("Some rows were not migrated. Fix them and rerun with --migrate-only.");
    }
}
