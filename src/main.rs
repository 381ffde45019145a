//! `fuel-closing` command line driver.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fuel_closing_lib::db::{self, DbState};
use fuel_closing_lib::draft::{draft_key, DraftManager};
use fuel_closing_lib::meter::HighVolumePolicy;
use fuel_closing_lib::store::remote::RemoteStore;
use fuel_closing_lib::store::{PersistentStore, ScratchStore};
use fuel_closing_lib::{
    diagnostics, reconciliation, ClosingConfig, ClosingSubmitter, SubmissionReceipt,
    SubmissionRequest,
};

/// Fuel station daily closing.
#[derive(Parser, Debug)]
#[command(name = "fuel-closing", version, about, long_about = None)]
struct Cli {
    /// Database and log directory (overrides FUEL_CLOSING_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print reconciliation totals for a closing input file.
    Totals {
        #[arg(long)]
        input: PathBuf,
    },
    /// Submit a closing input file to the configured store.
    Submit {
        #[arg(long)]
        input: PathBuf,
        /// Id of the user closing the shift.
        #[arg(long)]
        actor: String,
    },
    /// Inspect or discard the saved draft of a location.
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
    /// Print local database health.
    Health,
}

#[derive(Subcommand, Debug)]
enum DraftAction {
    Show {
        #[arg(long)]
        location: i64,
    },
    Clear {
        #[arg(long)]
        location: i64,
    },
}

fn read_request(path: &Path) -> Result<SubmissionRequest> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid closing input {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn submit_with<S: PersistentStore>(
    store: &S,
    scratch: &DbState,
    policy: HighVolumePolicy,
    request: &SubmissionRequest,
) -> Result<SubmissionReceipt> {
    let mut submitter = ClosingSubmitter::new(store, scratch).with_policy(policy);
    Ok(submitter.submit(request).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ClosingConfig {
        data_dir: cli.data_dir.unwrap_or_else(ClosingConfig::data_dir_from_env),
        ..ClosingConfig::default()
    };

    let log_dir = config.log_dir();
    diagnostics::prune_old_logs(&log_dir, config.log_retention_files);
    let _guard = fuel_closing_lib::init_tracing(&log_dir).context("failed to initialize logging")?;
    info!("Starting fuel-closing v{}", env!("CARGO_PKG_VERSION"));
    config.apply_env();

    let local = db::init(&config.data_dir).map_err(|e| anyhow!(e))?;
    {
        let conn = local.conn.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
        config.apply_local_overrides(&conn);
    }

    match cli.command {
        Commands::Totals { input } => {
            let request = read_request(&input)?;
            let totals = reconciliation::compute(
                &request.readings,
                &request.sessions,
                &request.payments,
                &config.high_volume,
            );
            print_json(&totals)?;
        }
        Commands::Submit { input, actor } => {
            let mut request = read_request(&input)?;
            request.actor_id = Some(actor);
            let policy = config.high_volume.clone();
            let receipt = match &config.remote {
                Some(remote) => {
                    let store = RemoteStore::new(&remote.base_url, &remote.api_key)?;
                    submit_with(&store, &local, policy, &request).await?
                }
                None => submit_with(&local, &local, policy, &request).await?,
            };
            print_json(&receipt)?;
        }
        Commands::Draft { action } => match action {
            DraftAction::Show { location } => match local.get(&draft_key(location))? {
                Some(raw) => {
                    let value: serde_json::Value = serde_json::from_str(&raw)
                        .context("stored draft is not valid JSON")?;
                    print_json(&value)?;
                }
                None => println!("no draft for location {location}"),
            },
            DraftAction::Clear { location } => {
                DraftManager::new(&local, location).clear()?;
                println!("draft for location {location} cleared");
            }
        },
        Commands::Health => {
            let health = diagnostics::get_store_health(&local).map_err(|e| anyhow!(e))?;
            print_json(&serde_json::json!({
                "about": diagnostics::get_about_info(),
                "health": health,
            }))?;
        }
    }

    Ok(())
}
