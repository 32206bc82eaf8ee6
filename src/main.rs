//! repromap CLI - benchmark connectome processing recipes.
//!
//! This is the command-line entry point for repromap. It orchestrates the
//! full pipeline:
//!
//! 1. Configuration: load repromap.toml, apply CLI overrides, validate
//! 2. Ensemble Discovery: enumerate observed recipe identifiers
//! 3. Grid Resolution: token parsing + Cartesian product per modality
//! 4. Store Population: resolve every (scan x recipe) pair in parallel
//! 5. Scoring: discriminability per recipe, sorted summary tables
//!
//! Design philosophy:
//! - Never abort on missing data; the missingness ledger is the audit trail
//! - Fail fast only on configuration errors, before any work starts
//! - Keep all logic in the library; this binary just narrates

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use owo_colors::OwoColorize;

use repromap::config::RunConfig;
use repromap::{report, store};

/// Benchmark connectome processing recipes by reproducibility.
///
/// repromap walks a derivatives tree, resolves every recipe the naming
/// convention encodes, and reports which recipes best discriminate subjects
/// across sessions.
///
/// Examples:
///   repromap --base-dir /data/outs            # Benchmark with defaults
///   repromap --config study.toml              # Full study configuration
///   repromap --base-dir /data/outs --top 20   # Show more of the leaderboard
#[derive(Parser, Debug)]
#[command(name = "repromap")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Path to a repromap.toml configuration file
    ///
    /// Defaults to ./repromap.toml when present; every field in the file is
    /// optional except the base directory (which may instead come from
    /// --base-dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root of the derivatives tree
    ///
    /// Overrides base-dir from the configuration file. Must contain the
    /// per-modality topology tables and/or embeddings_all_<modality> trees.
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// How many leaderboard rows to print per grid
    #[arg(long, default_value = "10")]
    top: usize,

    /// Skip writing the missingness ledger CSV
    #[arg(long)]
    no_ledger: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = RunConfig::load(cli.config.as_deref(), cli.base_dir.as_deref())?;

    if cfg.reliability {
        // Reliability estimation plugs in through the library API; the
        // bundled binary only reports discriminability.
        eprintln!(
            "{}",
            "reliability requested but no estimator is bundled; reporting \
             discriminability only"
                .yellow()
        );
    }

    let out = store::build_store(&cfg)?;
    println!(
        "Resolved {} entries across {} grids ({} misses).",
        out.store.len_entries(),
        out.grids.len(),
        out.ledger.len()
    );

    if !cli.no_ledger && !out.ledger.is_empty() {
        let ledger_path = cfg.base_dir.join("missingness.csv");
        out.ledger.write_csv(&ledger_path)?;
        println!("Missingness ledger: {}", ledger_path.display());
    }

    let rows = report::run(&cfg, &out, None)?;
    if rows.is_empty() {
        println!("{}", "No recipe produced a usable feature space.".yellow());
        return Ok(());
    }

    for ((modality, alg), _) in &out.grids {
        let grid_rows: Vec<_> = rows
            .iter()
            .filter(|r| r.modality == *modality && r.alg == *alg)
            .collect();
        if grid_rows.is_empty() {
            continue;
        }
        println!("\n=== {modality} / {alg} ===");
        for row in grid_rows.iter().take(cli.top) {
            match row.discriminability {
                Some(stat) => println!("  {:.4}  {}", stat.green(), row.recipe),
                None => println!("  {}  {}", "  -   ".dimmed(), row.recipe),
            }
        }
        println!(
            "Summary: {}",
            cfg.base_dir
                .join(format!("grid_clean_{modality}_{alg}.csv"))
                .display()
        );
    }

    Ok(())
}
