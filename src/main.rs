//! coursesync CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use coursesync::git::CheckoutState;
use coursesync::{
    sync_all, BatchReport, EnvTokenSupplier, NonInteractive, SyncConfig, SyncEngine,
    SyncOutcome, TerminalInteraction, UpstreamSync, UserInteraction,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coursesync")]
#[command(about = "Keep course repositories in sync with their remotes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "coursesync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, update and fork-sync every configured repository
    Sync {
        /// Answer yes to every question instead of prompting
        #[arg(short, long)]
        yes: bool,

        /// Only sync repositories with these names
        #[arg(long, num_args = 1..)]
        only: Vec<String>,

        /// Print the batch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the local state of every configured repository
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coursesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Sync { yes, only, json } => run_sync(&config, yes, &only, json).await,
        Commands::Status => show_status(&config).await,
    }
}

fn build_engine(config: &SyncConfig, assume_yes: bool) -> SyncEngine {
    let ui: Arc<dyn UserInteraction> = if assume_yes || config.assume_yes {
        Arc::new(NonInteractive { assume_yes: true })
    } else {
        Arc::new(TerminalInteraction)
    };
    let credentials = Arc::new(EnvTokenSupplier::new(config.tokens.clone()));
    SyncEngine::from_config(config, credentials, ui)
}

async fn run_sync(
    config: &SyncConfig,
    assume_yes: bool,
    only: &[String],
    json: bool,
) -> anyhow::Result<()> {
    let mut repos = config.repositories();
    if !only.is_empty() {
        for name in only {
            if !repos.iter().any(|r| &r.name == name) {
                anyhow::bail!("no repository named '{}' in the configuration", name);
            }
        }
        repos.retain(|r| only.contains(&r.name));
    }

    let engine = build_engine(config, assume_yes);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; finishing the current repository...");
            on_interrupt.cancel();
        }
    });

    let report = sync_all(&engine, &repos, &cancel).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.cancelled {
        anyhow::bail!("cancelled with {} repositories not synced", report.skipped.len());
    }
    if !report.is_success() {
        anyhow::bail!("{} repositories failed to sync", report.failures());
    }
    Ok(())
}

fn outcome_label(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::Cloned => "cloned",
        SyncOutcome::Updated => "updated",
        SyncOutcome::Unchanged => "up to date",
        SyncOutcome::Recovered => "recovered",
        SyncOutcome::SkippedDirty => "skipped (local changes)",
        SyncOutcome::Failed => "FAILED",
    }
}

fn print_report(report: &BatchReport) {
    let width = report
        .attempts
        .iter()
        .map(|a| a.name.len())
        .max()
        .unwrap_or(0);

    for attempt in &report.attempts {
        let mut line = format!(
            "{:width$}  {}",
            attempt.name,
            outcome_label(attempt.outcome),
            width = width
        );
        match &attempt.upstream {
            Some(UpstreamSync::Synced(fork)) if fork.updated => {
                line.push_str(&format!(", merged {} upstream commit(s)", fork.behind));
                if !fork.pushed {
                    line.push_str(" (not pushed)");
                }
            }
            Some(UpstreamSync::Failed { .. }) => line.push_str(", upstream FAILED"),
            _ => {}
        }
        println!("{line}");

        if let Some(backup) = &attempt.backup {
            println!("{:width$}  backup: {}", "", backup.display(), width = width);
        }
        if let Some(error) = &attempt.error {
            println!("{:width$}  {}", "", error, width = width);
        }
        if let Some(UpstreamSync::Failed { error }) = &attempt.upstream {
            println!("{:width$}  {}", "", error, width = width);
        }
        if let Some(UpstreamSync::Synced(fork)) = &attempt.upstream {
            if let Some(stash) = &fork.unrestored_stash {
                println!(
                    "{:width$}  local changes kept in {} (run `git stash pop {}`)",
                    "",
                    stash,
                    stash,
                    width = width
                );
            }
        }
    }

    for name in &report.skipped {
        println!("{:width$}  not started", name, width = width);
    }
}

async fn show_status(config: &SyncConfig) -> anyhow::Result<()> {
    let engine = build_engine(config, true);
    let probe = engine.probe();

    println!("Workspace: {}", config.workspace_root.display());
    println!();

    for repo in config.repositories() {
        let state = probe.state(&repo.path).await?;
        let detail = match &state {
            CheckoutState::Absent => "not cloned".to_string(),
            CheckoutState::Detached => format!("detached{}", dirty_suffix(&probe, &repo.path).await?),
            CheckoutState::OnBranch(branch) => {
                format!("on {}{}", branch, dirty_suffix(&probe, &repo.path).await?)
            }
        };
        println!("{}  {}  ({})", repo.name, detail, repo.path.display());
    }
    Ok(())
}

async fn dirty_suffix(probe: &coursesync::git::Probe<'_>, path: &Path) -> anyhow::Result<&'static str> {
    if probe.merge_in_progress(path) {
        return Ok(", merge in progress");
    }
    if probe.has_conflicts(path).await? {
        return Ok(", conflicts");
    }
    Ok(if probe.is_clean(path).await? {
        ""
    } else {
        ", local changes"
    })
}
