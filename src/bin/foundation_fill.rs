//! foundation-fill: populate computed tables for a cohort
//!
//! ```bash
//! # everything reachable from the catalog snapshot
//! foundation-fill --catalog catalog.json fill
//!
//! # models and responses of one cohort, without the collision sleep
//! foundation-fill --catalog catalog.json fill --cohort cohort.json \
//!     --stage model --stage response --no-sleep
//!
//! # pack a trained cohort
//! foundation-fill --catalog catalog.json export manifest.json cohort.zip
//! ```
//!
//! Settings come from `FOUNDATION_*` variables, log levels from `RUST_LOG`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use foundation::catalog::{Catalog, PopulateOptions};
use foundation::config::Settings;
use foundation::export::{export, ExportManifest};
use foundation::fill::{fill, Cohort, Stage};
use foundation::workspace::Workspace;

#[derive(Debug, Parser)]
#[command(name = "foundation-fill", version, about = "Populate foundation tables")]
struct Cli {
    /// Catalog snapshot, created if absent and rewritten on success
    #[arg(long, default_value = "catalog.json")]
    catalog: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Populate tables in dependency order
    Fill {
        /// Cohort JSON restricting datasets, networks and instances
        #[arg(long)]
        cohort: Option<PathBuf>,
        /// Stages to run (default: all)
        #[arg(long = "stage", value_parser = parse_stage)]
        stages: Vec<Stage>,
        /// Skip job reservation (single worker)
        #[arg(long)]
        local: bool,
        /// Record failing keys and continue
        #[arg(long)]
        suppress_errors: bool,
        /// Skip the random start-up delay
        #[arg(long)]
        no_sleep: bool,
    },
    /// Write a cohort archive
    Export {
        /// Export manifest JSON
        manifest: PathBuf,
        /// Output ZIP
        output: PathBuf,
    },
}

fn parse_stage(raw: &str) -> std::result::Result<Stage, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| format!("unknown stage `{raw}` (recording, dataset, model, response)"))
}

fn open(cli: &Cli) -> Result<Workspace> {
    let settings = Settings::from_env().context("reading FOUNDATION_* settings")?;
    let catalog = if cli.catalog.exists() {
        Catalog::load(&cli.catalog).with_context(|| format!("loading {}", cli.catalog.display()))?
    } else {
        info!(path = %cli.catalog.display(), "starting an empty catalog");
        Catalog::new()
    };
    Ok(Workspace::open(catalog, settings)?)
}

async fn run(cli: Cli) -> Result<()> {
    let ws = open(&cli)?;
    match cli.command {
        Command::Fill {
            cohort,
            stages,
            local,
            suppress_errors,
            no_sleep,
        } => {
            let cohort = match cohort {
                Some(path) => Cohort::from_json(&path).with_context(|| format!("reading {}", path.display()))?,
                None => Cohort::default(),
            };
            let stages = if stages.is_empty() { Stage::ALL.to_vec() } else { stages };
            let options = PopulateOptions {
                reserve_jobs: !local,
                suppress_errors,
                limit: None,
            };

            if !no_sleep {
                let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=10_000));
                info!(?delay, "collision sleep");
                tokio::time::sleep(delay).await;
            }

            let catalog_path = cli.catalog.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let report = fill(&ws, &cohort, &stages, options)?;
                info!(made = report.made(), missing = report.missing(), "fill done");
                for (table, outcome) in &report.tables {
                    for (key, message) in &outcome.errors {
                        error!(table, key = %key, "{message}");
                    }
                }
                ws.catalog().save(&catalog_path)?;
                Ok(())
            })
            .await
            .context("fill task panicked")??;
        }
        Command::Export { manifest, output } => {
            let manifest = ExportManifest::from_json(&manifest)
                .with_context(|| format!("reading {}", manifest.display()))?;
            let path = export(&ws, &manifest, &output)?;
            info!(path = %path.display(), "export written");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_writer(io::stderr).with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        return Err(e);
    }
    Ok(())
}
