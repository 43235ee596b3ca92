use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sera_core::{today, Platform, SnapshotWindow};
use sera_report::AttendanceAggregator;
use sera_store::PgStore;
use sera_sync::{
    maybe_build_scheduler, DailySyncReconciler, EngagementScope, EngagementSyncer,
    SpecialSubmission, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sera-cli")]
#[command(about = "Social engagement reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one daily reconciliation pass over every eligible client.
    Sync {
        #[arg(long, default_value = "instagram")]
        platform: String,
        /// Reconcile only this client; unknown or inactive clients fail.
        #[arg(long)]
        client: Option<String>,
    },
    /// Merge engagement snapshots for one client's posts today.
    Engagement {
        #[arg(long)]
        client: String,
        #[arg(long, default_value = "instagram")]
        platform: String,
        /// Restrict to manually uploaded posts.
        #[arg(long)]
        manual_only: bool,
        /// Explicit post links or content ids; skips day discovery.
        #[arg(long)]
        content: Vec<String>,
    },
    /// Register a manually submitted special-assignment post.
    Submit {
        #[arg(long)]
        client: String,
        #[arg(long, default_value = "instagram")]
        platform: String,
        link: String,
    },
    /// Remove a post from a client's task scope.
    Exclude {
        #[arg(long)]
        client: String,
        #[arg(long, default_value = "instagram")]
        platform: String,
        link: String,
    },
    /// Today's attendance report for a client's directorate scope.
    Attendance {
        #[arg(long)]
        client: String,
        #[arg(long, default_value = "instagram")]
        platform: String,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

fn parse_platform(raw: &str) -> Result<Platform> {
    Platform::parse(raw).with_context(|| format!("unsupported platform: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?,
    );
    let fetcher = config.build_fetcher()?;

    match cli.command.unwrap_or(Commands::Sync {
        platform: "instagram".to_string(),
        client: None,
    }) {
        Commands::Sync { platform, client } => {
            let platform = parse_platform(&platform)?;
            let reconciler =
                DailySyncReconciler::new(store, fetcher, config.daily_post_limit);
            match client {
                Some(client) => {
                    let outcome = reconciler
                        .sync_client_by_id(&client, platform, Utc::now())
                        .await?;
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                None => {
                    let summary = reconciler.sync_all(platform, Utc::now()).await;
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
            }
        }
        Commands::Engagement {
            client,
            platform,
            manual_only,
            content,
        } => {
            let platform = parse_platform(&platform)?;
            let syncer = EngagementSyncer::new(store, fetcher);
            let now = Utc::now();
            let scope = EngagementScope {
                manual_only,
                explicit: (!content.is_empty()).then_some(content),
            };
            let summary = syncer
                .sync_client(
                    &client,
                    platform,
                    today(now),
                    &scope,
                    SnapshotWindow::resolve(None, None, now),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Submit {
            client,
            platform,
            link,
        } => {
            let platform = parse_platform(&platform)?;
            let submission = SpecialSubmission::new(store, fetcher);
            match submission.submit(&client, platform, &link, Utc::now()).await {
                Ok(outcome) => println!("{}", serde_json::to_string_pretty(&outcome)?),
                Err(err) => {
                    eprintln!("rejected ({}): {err}", err.status());
                    std::process::exit(1);
                }
            }
        }
        Commands::Exclude {
            client,
            platform,
            link,
        } => {
            let platform = parse_platform(&platform)?;
            let submission = SpecialSubmission::new(store, fetcher);
            submission.exclude(&client, platform, &link).await?;
            println!("excluded {link} for {client}");
        }
        Commands::Attendance { client, platform } => {
            let platform = parse_platform(&platform)?;
            let aggregator = AttendanceAggregator::new(store);
            let now = Utc::now();
            let report = aggregator
                .report(
                    &client,
                    platform,
                    today(now),
                    SnapshotWindow::resolve(None, None, now),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Schedule => {
            let reconciler = Arc::new(DailySyncReconciler::new(
                store,
                fetcher,
                config.daily_post_limit,
            ));
            match maybe_build_scheduler(&config, reconciler).await? {
                Some(scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    info!(
                        cron_1 = %config.sync_cron_1,
                        cron_2 = %config.sync_cron_2,
                        "scheduler running; press ctrl-c to stop"
                    );
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                }
                None => {
                    eprintln!("scheduler disabled; set SERA_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
