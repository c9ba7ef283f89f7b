//! oxide-safeguard CLI
//!
//! Command-line tool for applying schema revisions safely.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_safeguard::config::{SafeguardConfig, CONFIG_FILE};
use oxide_safeguard::error::SafeguardError;
use oxide_safeguard::pipeline::{Pipeline, RunOptions};
use oxide_safeguard_core::graph::LoadTarget;

/// Lint, back up, apply, verify and roll back schema revisions.
#[derive(Parser)]
#[command(name = "oxide-safeguard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Database URL (overrides the configuration file).
    #[arg(short, long, env = "DATABASE_URL")]
    database: Option<String>,

    /// Revisions directory (overrides the configuration file).
    #[arg(short, long)]
    revisions: Option<PathBuf>,

    /// Cancel the run after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct PlanArgs {
    /// Revision to move to (the single head if not specified).
    #[arg(short, long)]
    target: Option<String>,

    /// Skip the scratch simulation and lock estimates.
    #[arg(long)]
    skip_simulation: bool,

    /// Allow backfills above the configured row threshold.
    #[arg(long)]
    allow_large_backfill: bool,

    /// Treat warnings as blocking.
    #[arg(long)]
    strict: bool,
}

impl PlanArgs {
    fn options(&self, dry_run: bool) -> RunOptions {
        RunOptions {
            target: LoadTarget::from_option(self.target.as_deref()),
            skip_simulation: self.skip_simulation,
            allow_large_backfill: self.allow_large_backfill,
            dry_run,
            strict: self.strict,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database (create bookkeeping tables, record the schema).
    Init,

    /// Lint revision files without connecting to the database.
    Lint {
        /// Treat warnings as blocking.
        #[arg(long)]
        strict: bool,
    },

    /// Show the validated plan and its SQL.
    Plan(PlanArgs),

    /// Apply pending revisions.
    Apply {
        #[command(flatten)]
        plan: PlanArgs,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Check the database against a revision.
    Verify {
        /// Revision the database should be at (the single head if not specified).
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Restore a backup.
    Rollback {
        /// Backup id.
        #[arg(long)]
        backup: String,

        /// Repeat the backup id to confirm the restore.
        #[arg(long)]
        confirm: String,
    },

    /// Show applied revisions.
    History,

    /// List backups.
    Backups,

    /// Remove a stale migration lock.
    ForceUnlock,
}

fn cancellation(timeout: Option<u64>) -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("Interrupted; cancelling run"),
            () = deadline => warn!("Timeout reached; cancelling run"),
            () = child.cancelled() => return,
        }
        child.cancel();
    });
    token
}

async fn run(
    command: Commands,
    config: SafeguardConfig,
    token: &CancellationToken,
) -> Result<(), SafeguardError> {
    match command {
        Commands::Init => {
            info!("Initializing database...");
            let state = Pipeline::new(config).init().await?;
            info!(fingerprint = %state.fingerprint.short(), "Database initialized.");
        }

        Commands::Lint { strict } => {
            let report = Pipeline::new(config)
                .options(RunOptions {
                    strict,
                    ..RunOptions::default()
                })
                .lint()?;
            for finding in &report.findings {
                println!("{finding}");
            }
            info!(
                linted = report.linted,
                sealed = report.sealed,
                "No blocking findings."
            );
        }

        Commands::Plan(args) => {
            let plan = Pipeline::new(config).options(args.options(false)).plan().await?;
            if plan.is_empty() {
                info!("Database is up to date.");
                return Ok(());
            }
            for finding in &plan.findings {
                println!("{finding}");
            }
            println!("{}", plan.render_sql());
        }

        Commands::Apply { plan, dry_run } => {
            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
            }
            let outcome = Pipeline::new(config)
                .options(plan.options(dry_run))
                .apply(token)
                .await?;
            if let Some(report) = &outcome.report {
                info!(committed = report.committed.len(), "Apply finished.");
            }
        }

        Commands::Verify { target } => {
            let report = Pipeline::new(config)
                .options(RunOptions {
                    target: LoadTarget::from_option(target.as_deref()),
                    ..RunOptions::default()
                })
                .verify()
                .await?;
            for probe in &report.probes {
                let mark = if probe.passed { "ok" } else { "FAILED" };
                println!(" [{mark}] {}", probe.probe);
            }
            report.into_result()?;
            info!("Verification passed.");
        }

        Commands::Rollback { backup, confirm } => {
            let outcome = Pipeline::new(config).rollback(&backup, &confirm).await?;
            info!(
                revision = ?outcome.state.revision.as_ref().map(|r| r.as_str()),
                "Backup restored."
            );
        }

        Commands::History => {
            let entries = Pipeline::new(config).history().await?;
            if entries.is_empty() {
                info!("No revisions have been applied yet.");
            } else {
                println!("\nHistory:");
                println!("{:-<60}", "");
                for entry in &entries {
                    println!(
                        " {:>7} {} ({}, {})",
                        entry.direction.as_str(),
                        entry.revision,
                        entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                        entry.fingerprint.short()
                    );
                }
                println!();
            }
        }

        Commands::Backups => {
            let backups = Pipeline::new(config).backups_list().await?;
            for backup in &backups {
                println!(
                    " {} {} ({} bytes, {})",
                    backup.id,
                    backup.revision().map_or("(empty)", |r| r.as_str()),
                    backup.size,
                    if backup.location.is_some() {
                        "uploaded"
                    } else {
                        "local only"
                    }
                );
            }
        }

        Commands::ForceUnlock => {
            if Pipeline::new(config).force_unlock().await? {
                warn!("Removed migration lock.");
            } else {
                info!("No migration lock was held.");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = SafeguardConfig::load(&cli.config)?;
    if let Some(database) = cli.database {
        config.database.url = database;
    }
    if let Some(revisions) = cli.revisions {
        config.revisions.dir = revisions;
    }

    let token = cancellation(cli.timeout);
    let result = run(cli.command, config, &token).await;
    token.cancel();

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
    Ok(())
}
