//! Classy Sync agent: keeps one account's subscription status in sync with
//! the Classy Taxi backend and reports health as JSON.

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest"
)]

mod observability;

use std::{path::PathBuf, time::Instant};

use anyhow::{Context, Result};
use clap::Parser;
use classy_sync::{
    SyncNotice,
    config::{StoreKind, SyncConfig},
    identity::IdentityEvent,
    models::{AccountCredential, AccountId},
    runtime::SyncRuntime,
};
use observability::{HealthReport, LogFormat, init_observability};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "classy-sync-agent")]
#[command(about = "Reconcile Classy Taxi subscriptions for one account")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CLASSY_SYNC_CONFIG", default_value = "classy-sync.toml")]
    config: PathBuf,

    /// Account to sign in as
    #[arg(short, long)]
    account: String,

    /// Identity token for the account
    #[arg(long, env = "CLASSY_SYNC_TOKEN", hide_env_values = true)]
    token: String,

    /// Push-routing id of this install (random when omitted)
    #[arg(long)]
    instance_id: Option<String>,

    /// Sync once, print the health report and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_observability(LogFormat::from_env());
    if let Err(e) = run(Cli::parse()).await {
        error!(error = %format!("{e:#}"), "Agent failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let started = Instant::now();
    let config = SyncConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let instance_id = cli.instance_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let runtime = SyncRuntime::from_config(&config, Some(instance_id.clone()))
        .context("building sync runtime")?;
    let account = AccountId::new(cli.account).context("invalid --account")?;
    let credential = AccountCredential::new(account, cli.token).context("invalid --token")?;

    if config.store.kind == StoreKind::File
        && let Err(e) = runtime.resume(credential.clone())
    {
        warn!(error = %e, "Could not restore last-known-good state");
    }

    let outcome = runtime.on_identity(IdentityEvent::SignedIn(credential)).await;
    let health = || {
        HealthReport::from_snapshot(
            &runtime.engine().snapshot(),
            &instance_id,
            started.elapsed().as_secs(),
        )
    };

    if cli.once {
        println!("{}", health().to_json()?);
        outcome.context("initial sync failed")?;
        return Ok(());
    }
    match outcome {
        Ok(outcome) => info!(?outcome, "Initial sync finished"),
        Err(e) => warn!(error = %e, "Initial sync failed, continuing with periodic refresh"),
    }

    let refresher = runtime.spawn_periodic_refresh();
    let mut snapshots = runtime.subscribe();
    let mut notices = runtime.notices();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = health();
                info!(status = report.status.as_str(), report = %report.to_json()?, "Health");
            }
            notice = notices.recv() => match notice {
                Ok(SyncNotice::IdentityRefreshRequired { account }) => {
                    warn!(account = %account, "Token rejected; restart with a fresh --token");
                }
                Ok(notice) => info!(?notice, "Sync notice"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notice stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    refresher.abort();
    Ok(())
}
