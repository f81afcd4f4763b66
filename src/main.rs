//! # Nurture: lead engagement campaign engine
//!
//! Usage:
//!   nurture serve                                  # Gateway + dispatcher workers
//!   nurture dispatch-once                          # One sweep, then exit
//!   nurture reconcile [--apply]                    # Duplicate report / cleanup
//!   nurture metrics --from 2026-03-01 --to 2026-04-01 [--sequence 3]
//!   nurture unsubscribe lead@example.com [--reason "asked by phone"]
//!   nurture init-config                            # Write ~/.nurture/config.toml

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use nurture_campaign::{CampaignDb, CampaignService, MetricsQuery, join_workers, spawn_dispatcher};
use nurture_core::NurtureConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nurture", version, about = "📬 Nurture: triggered, rate-limited email sequences")]
struct Cli {
    /// Config file (default: ~/.nurture/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway and the background dispatcher workers
    Serve {
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a single dispatch sweep and exit
    DispatchOnce,
    /// Report duplicate sent deliveries; remove them with --apply
    Reconcile {
        #[arg(long)]
        apply: bool,
    },
    /// Delivery metrics for a [from, to) window
    Metrics {
        /// RFC 3339 timestamp or YYYY-MM-DD (UTC midnight)
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        sequence: Option<i64>,
    },
    /// Opt an address out and cancel its pending deliveries
    Unsubscribe {
        email: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Opt an address back in
    Resubscribe { email: String },
    /// Today's admission counters
    Usage,
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

/// `YYYY-MM-DD` means midnight UTC; anything else must be RFC 3339.
fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).context("invalid date")?;
        return Ok(midnight.and_utc());
    }
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("'{raw}' is neither YYYY-MM-DD nor RFC 3339"))?
        .with_timezone(&Utc))
}

fn load_config(path: Option<&Path>) -> Result<NurtureConfig> {
    let config = match path {
        Some(p) => NurtureConfig::load_from(p)?,
        None => NurtureConfig::load()?,
    };
    Ok(config)
}

fn open_service(config: &NurtureConfig) -> Result<Arc<CampaignService>> {
    let db_path = expand_path(&config.database.path);
    let db = CampaignDb::open(Path::new(&db_path)).with_context(|| format!("opening {db_path}"))?;
    tracing::info!("💾 Campaign DB: {db_path}");
    let transport = nurture_mail::build_transport(&config.mail)?;
    Ok(Arc::new(CampaignService::new(Arc::new(db), config, transport)?))
}

/// Wait for `stop` or for the gateway to exit on its own, then stop the workers.
/// A gateway that exits first (e.g. failed to bind) is an error.
async fn run_until_stopped(
    mut server: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    stop: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    let finished = tokio::select! {
        signal = stop => {
            if let Err(e) = signal {
                tracing::error!("❌ Signal listener failed: {e}");
            }
            tracing::info!("🛑 Shutdown requested");
            None
        }
        result = &mut server => Some(result),
    };
    let _ = shutdown_tx.send(true);
    join_workers(workers).await;
    match finished {
        Some(result) => {
            result?.context("gateway failed")?;
            anyhow::bail!("gateway stopped unexpectedly")
        }
        None => server.await?,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "nurture=debug,nurture_campaign=debug,nurture_gateway=debug,tower_http=debug"
    } else {
        "nurture=info,nurture_campaign=info,nurture_mail=info,nurture_gateway=info"
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
    }

    if let Command::InitConfig { force } = &cli.command {
        let path = cli.config.clone().unwrap_or_else(NurtureConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        NurtureConfig::default().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;
    let service = open_service(&config)?;

    match cli.command {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers = spawn_dispatcher(service.dispatcher(), shutdown_rx.clone());
            tracing::info!("🚀 {} dispatcher worker(s) started", workers.len());

            let mut gateway_shutdown = shutdown_rx;
            let state = nurture_gateway::AppState::new(service.clone(), config);
            let server = tokio::spawn(nurture_gateway::start(state, async move {
                let _ = gateway_shutdown.changed().await;
            }));
            run_until_stopped(server, workers, shutdown_tx, tokio::signal::ctrl_c()).await?;
        }
        Command::DispatchOnce => {
            let report = service.dispatch_once().await?;
            print_json(&report)?;
        }
        Command::Reconcile { apply } => {
            let groups = service.find_duplicates()?;
            if !apply {
                let removable: usize = groups.iter().map(|g| g.remove.len()).sum();
                print_json(&groups)?;
                println!("🔎 {} group(s), {removable} row(s) would be removed (dry run)", groups.len());
            } else {
                let report = service.reconcile(&groups)?;
                print_json(&report)?;
                if !report.index_restored {
                    println!("⚠️  Idempotency index still missing; run reconcile again");
                }
            }
        }
        Command::Metrics { from, to, sequence } => {
            let mut query = MetricsQuery::new(parse_time(&from)?, parse_time(&to)?);
            query.sequence_id = sequence;
            print_json(&service.metrics(&query)?)?;
        }
        Command::Unsubscribe { email, reason } => {
            let outcome = service.unsubscribe(&email, reason.as_deref())?;
            print_json(&outcome)?;
        }
        Command::Resubscribe { email } => {
            let changed = service.resubscribe(&email)?;
            println!("{}", if changed { "✅ Resubscribed" } else { "ℹ️  Already subscribed" });
        }
        Command::Usage => print_json(&service.usage()?)?,
        Command::InitConfig { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_time_accepts_dates_and_rfc3339() {
        assert_eq!(parse_time("2026-03-01").unwrap(), Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(
            parse_time("2026-03-01T10:30:00+02:00").unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap()
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_serve_exits_when_gateway_cannot_bind() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = NurtureConfig::default();
        config.gateway.port = taken.local_addr().unwrap().port();
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let service =
            Arc::new(CampaignService::new(db, &config, Arc::new(nurture_mail::LogTransport::new())).unwrap());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut worker_rx = shutdown_rx.clone();
        let worker = tokio::spawn(async move {
            let _ = worker_rx.changed().await;
        });
        let state = nurture_gateway::AppState::new(service, config);
        let server = tokio::spawn(nurture_gateway::start(state, async move {
            let _ = shutdown_rx.changed().await;
        }));

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run_until_stopped(server, vec![worker], shutdown_tx, std::future::pending()),
        )
        .await
        .expect("serve should not wait for a signal once the gateway is gone");
        assert!(outcome.unwrap_err().to_string().contains("gateway failed"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["nurture", "reconcile", "--apply"]).unwrap();
        assert!(matches!(cli.command, Command::Reconcile { apply: true }));
        let cli = Cli::try_parse_from(["nurture", "-v", "metrics", "--from", "2026-03-01", "--to", "2026-04-01"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Metrics { sequence: None, .. }));
    }
}
