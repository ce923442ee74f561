use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opsfeed_core::{Category, Counts};
use opsfeed_sync::{
    build_engine, live_listener, poller_config, EngineConfig, OperatorSession, Poller,
    RefreshOutcome, SourceOutcome, ToastBoard,
};
use opsfeed_web::{port_from_env, serve, AppState};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "opsfeed")]
#[command(about = "Back-office notification feed")]
struct Cli {
    /// Read source responses from `<dir>/<source_id>.json` instead of the API.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the per-source report.
    Poll,
    /// Poll, listen for pushes and serve the JSON feed until Ctrl-C.
    Serve,
    /// Print persisted unread counts and the newest notifications.
    Status {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    MarkAllRead,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();
    let fixtures = cli.fixtures.as_deref();

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => {
            let engine = build_engine(&config, fixtures).await?;
            let outcome = engine.refresh_now().await;
            engine.dispose();
            print_outcome(&outcome);
        }
        Commands::Serve => run_serve(config, fixtures.map(PathBuf::from)).await?,
        Commands::Status { limit } => {
            let engine = build_engine(&config, fixtures).await?;
            let state = engine.sorted_state().await;
            print_counts(&state.counts);
            for item in state.items.iter().take(limit) {
                println!(
                    "{} [{}] {}: {}",
                    if item.read { " " } else { "*" },
                    item.source_type,
                    item.title,
                    item.message
                );
            }
            engine.dispose();
        }
        Commands::MarkAllRead => {
            let engine = build_engine(&config, fixtures).await?;
            engine.mark_all_as_read().await;
            print_counts(&engine.state().await.counts);
            engine.dispose();
        }
    }

    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::env::var("OPSFEED_LOG_FORMAT").as_deref() {
        Ok("json") => fmt().json().with_env_filter(filter).with_target(true).init(),
        _ => fmt().with_env_filter(filter).with_target(true).init(),
    }
}

async fn run_serve(config: EngineConfig, fixtures: Option<PathBuf>) -> Result<()> {
    let engine = build_engine(&config, fixtures.as_deref()).await?;
    let toasts = Arc::new(ToastBoard::default());

    let poller = Poller::spawn(Arc::clone(&engine), poller_config(&config));
    let listener = live_listener(&config, &engine, Arc::clone(&toasts));
    if let Some(listener) = &listener {
        let session = OperatorSession {
            user_id: "operator".to_string(),
            token: config.api_token.clone(),
            roles: vec![config.operator_role.clone()],
        };
        if !listener.start(session) {
            warn!("no API token configured; live channel disabled");
        }
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let shutdown = async move {
        let _ = stop_rx.changed().await;
    };
    let mut server = tokio::spawn(serve(
        AppState::new(Arc::clone(&engine), toasts),
        port_from_env(),
        shutdown,
    ));

    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!("shutdown requested");
            None
        }
        joined = &mut server => Some(joined),
    };

    engine.dispose();
    poller.shutdown().await;
    if let Some(listener) = &listener {
        listener.stop();
    }
    let joined = match early_exit {
        Some(joined) => joined,
        None => {
            let _ = stop_tx.send(true);
            server.await
        }
    };
    joined.context("joining web server")?
}

fn print_outcome(outcome: &RefreshOutcome) {
    match outcome {
        RefreshOutcome::Completed(report) => {
            println!(
                "poll complete: run_id={} created={} evicted={}",
                report.run_id, report.created, report.evicted
            );
            for source in &report.sources {
                match &source.outcome {
                    SourceOutcome::Fetched { fetched, created } => println!(
                        "  {:<12} {:<9} fetched={fetched} created={created}",
                        source.source_id, source.category
                    ),
                    SourceOutcome::Failed { reason } => println!(
                        "  {:<12} {:<9} FAILED {reason}",
                        source.source_id, source.category
                    ),
                }
            }
            print_counts(&report.counts);
        }
        RefreshOutcome::AlreadyInFlight => println!("poll skipped: a pass is already running"),
        RefreshOutcome::Disposed => println!("poll dropped: engine disposed"),
    }
}

fn print_counts(counts: &Counts) {
    let per_category = Category::ALL
        .iter()
        .map(|c| format!("{c}={}", counts.get(*c)))
        .collect::<Vec<_>>()
        .join(" ");
    println!("unread: {per_category} total={}", counts.total());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_poll_and_fixtures_is_global() {
        let cli = Cli::try_parse_from(["opsfeed"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["opsfeed", "status", "--limit", "3", "--fixtures", "fixtures"])
            .unwrap();
        assert_eq!(cli.fixtures, Some(PathBuf::from("fixtures")));
        assert!(matches!(cli.command, Some(Commands::Status { limit: 3 })));
    }
}
