mod ai;
mod config;
mod error;
mod mailbox;
mod matcher;
mod merge;
mod models;
mod pipeline;
mod store;

use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::ai::Classifier;
use crate::config::Config;
use crate::mailbox::ImapMailbox;
use crate::pipeline::CycleReport;
use crate::store::{SqliteStore, TrackerStore};

#[derive(Parser)]
#[command(
    name = "apptrack",
    about = "Job application tracker fed by your mailbox",
    version
)]
struct Cli {
    /// Path to a JSON config file (default: ./apptrack.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config file and create the database
    Init,
    /// Reconcile recent emails once and exit
    Check {
        /// How far back to look, in hours
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },
    /// Deep rescan: reconcile a longer window, ignoring the watermark
    Search {
        /// How far back to look, in days
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Show tracked applications grouped by status
    Summary,
    /// Poll the mailbox on an interval until interrupted
    Watch,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Init => cmd_init(&cfg, cli.config.as_deref()),
        Command::Check { hours } => {
            if hours <= 0 {
                bail!("--hours must be positive");
            }
            cmd_once(&cfg, Duration::hours(hours), true)
        }
        Command::Search { days } => {
            if days <= 0 {
                bail!("--days must be positive");
            }
            cmd_once(&cfg, Duration::days(days), false)
        }
        Command::Summary => cmd_summary(&cfg),
        Command::Watch => cmd_watch(&cfg),
    }
}

fn open_store(cfg: &Config) -> anyhow::Result<SqliteStore> {
    let path = cfg.database_path();
    SqliteStore::open(&path, &cfg.table)
        .with_context(|| format!("failed to open database at {}", path.display()))
}

fn build_frontend(cfg: &Config) -> anyhow::Result<(ImapMailbox, Classifier)> {
    if cfg.imap.username.is_empty() {
        bail!("imap.username is not configured; run 'apptrack init' and edit the config");
    }
    let provider = ai::create_provider(cfg)?;
    let classifier = Classifier::new(provider, cfg);
    let mailbox = ImapMailbox::new(cfg.imap.clone());
    Ok((mailbox, classifier))
}

fn cmd_init(cfg: &Config, config_path: Option<&Path>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(|| Path::new("apptrack.json"));
    if path.exists() {
        println!("Config already exists at {}", path.display());
    } else {
        let content = serde_json::to_string_pretty(&Config::default())?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote starter config to {}", path.display());
        println!("Edit imap.username and the password file, then run 'apptrack check'.");
    }

    open_store(cfg)?;
    println!("Database ready at {}", cfg.database_path().display());
    Ok(())
}

fn cmd_once(cfg: &Config, window: Duration, respect_watermark: bool) -> anyhow::Result<()> {
    let (mut mailbox, classifier) = build_frontend(cfg)?;
    let mut store = open_store(cfg)?;
    let mut state = store.load_state()?;

    let now = Utc::now();
    let floor = now - window;
    let since = match state.watermark {
        Some(w) if respect_watermark && w > floor => w,
        _ => floor,
    };

    info!(since = %since, "reconciling");
    let report = pipeline::run_cycle(
        &mut mailbox,
        &classifier,
        &mut store,
        cfg,
        &mut state,
        since,
        now,
    )?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!(
        "Checked {} emails: {} new, {} updated, {} skipped, {} failed",
        report.fetched, report.created, report.updated, report.skipped, report.failed
    );
    if report.failed > 0 {
        println!("Failed emails will be retried on the next run.");
    }
}

fn cmd_summary(cfg: &Config) -> anyhow::Result<()> {
    let mut store = open_store(cfg)?;
    let records = store.list_records()?;
    if records.is_empty() {
        println!("No applications tracked yet. Run 'apptrack check' first.");
        return Ok(());
    }

    println!("{} applications tracked\n", records.len());
    for status in models::Status::ALL {
        let matching: Vec<_> = records.iter().filter(|r| r.status == status).collect();
        if matching.is_empty() {
            continue;
        }
        println!("{} ({})", status, matching.len());
        for r in matching {
            let mut line = format!("  {} - {}", r.company, r.position);
            line.push_str(&format!("  (applied {})", r.date_applied));
            if let Some(location) = &r.location {
                line.push_str(&format!(", {location}"));
            }
            println!("{line}");
        }
        println!();
    }
    Ok(())
}

fn cmd_watch(cfg: &Config) -> anyhow::Result<()> {
    let (mut mailbox, classifier) = build_frontend(cfg)?;
    let mut store = open_store(cfg)?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        if let Ok(rt) = rt {
            if rt.block_on(tokio::signal::ctrl_c()).is_ok() {
                info!("shutdown requested");
                flag.store(true, Ordering::Relaxed);
            }
        }
    });

    pipeline::run_watch(&mut mailbox, &classifier, &mut store, cfg, &stop)?;
    Ok(())
}
