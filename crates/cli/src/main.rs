//! Strategy Evolver: island-model genetic search over trading strategy parameters
//!
//! Usage:
//!   evolver run --symbols BTCUSDT,ETHUSDT  # Evolve against Binance daily bars
//!   evolver run --data-dir bars/  # Evolve against local JSON bars
//!   evolver checkpoints  # Latest checkpoint of each run
//!   evolver cleanup --keep 5  # Prune old checkpoints

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use engine::{
    decode_snapshot, load_market_data, BacktestEvaluator, BinanceClient, EvolverConfig,
    GeneticOptimizer, HistoricalDataProvider, Insight, JsonDirProvider, OptimizationOutcome,
    ProgressRecord, ProgressSink, SqliteCheckpointSink,
};
use persistence::Database;
use tracing::{info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));
const DEFAULT_DB_PATH: &str = "data/evolver.db";

#[derive(Parser)]
#[command(name = "evolver")]
#[command(about = "Genetic optimizer for multi-factor trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evolution
    Run {
        /// JSON config file (defaults are used for anything missing)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Symbols to trade (comma-separated)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Timeline symbol (defaults to the first symbol)
        #[arg(long)]
        reference: Option<String>,
        /// Days of daily history
        #[arg(long)]
        days: Option<u32>,
        /// Generation budget
        #[arg(long)]
        generations: Option<u32>,
        #[arg(long)]
        islands: Option<usize>,
        /// Genomes per island
        #[arg(long)]
        population: Option<usize>,
        /// RNG seed for a reproducible run
        #[arg(long)]
        seed: Option<u64>,
        /// Read `<SYMBOL>.json` bar files from this directory instead of Binance
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Write the final snapshot as JSON
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List the latest checkpoint of every run
    Checkpoints {
        /// Show the stored best parameters of one run
        #[arg(long)]
        run: Option<String>,
    },
    /// Keep the newest N checkpoints per run, delete the rest
    Cleanup {
        #[arg(long, default_value_t = 5)]
        keep: u32,
    },
}

/// CLI overrides layered on top of the config file
#[derive(Debug, Default)]
struct Overrides {
    symbols: Vec<String>,
    reference: Option<String>,
    days: Option<u32>,
    generations: Option<u32>,
    islands: Option<usize>,
    population: Option<usize>,
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut EvolverConfig) {
        if !self.symbols.is_empty() {
            config.symbols = self.symbols;
        }
        if self.reference.is_some() {
            config.reference_symbol = self.reference;
        }
        if let Some(days) = self.days {
            config.days = days;
        }
        if let Some(generations) = self.generations {
            config.optimizer.max_generations = generations;
        }
        if let Some(islands) = self.islands {
            config.optimizer.islands = islands;
        }
        if let Some(population) = self.population {
            config.optimizer.population_size = population;
        }
        if self.seed.is_some() {
            config.optimizer.seed = self.seed;
        }
    }
}

/// `--verbose` wins, then `RUST_LOG` (which may come from `.env`), then the info default
fn log_directives(verbose: bool, rust_log: Option<String>) -> String {
    if verbose {
        return "debug,engine=debug,evolver=debug,sqlx=warn".to_string();
    }
    match rust_log {
        Some(directives) if !directives.trim().is_empty() => directives,
        _ => "info,engine=info,evolver=info,sqlx=warn".to_string(),
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::new(log_directives(verbose, std::env::var("RUST_LOG").ok()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

async fn open_db() -> anyhow::Result<(Database, String)> {
    let db_path = std::env::var("EVOLVER_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let db = Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    Ok((db, db_path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            symbols,
            reference,
            days,
            generations,
            islands,
            population,
            seed,
            data_dir,
            export,
        } => {
            let overrides = Overrides {
                symbols,
                reference,
                days,
                generations,
                islands,
                population,
                seed,
            };
            cmd_run(config, overrides, data_dir, export).await?;
        }
        Commands::Checkpoints { run } => {
            cmd_checkpoints(run).await?;
        }
        Commands::Cleanup { keep } => {
            cmd_cleanup(keep).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Run command
// ============================================================================

/// Prints one line per reported generation
struct ConsoleProgress;

#[async_trait]
impl ProgressSink for ConsoleProgress {
    async fn report(&self, p: &ProgressRecord, insights: &[Insight]) -> anyhow::Result<()> {
        println!(
            "  Gen {:>4} | best {:>10.3} | avg {:>10.3} | {:>6.1} eval/s | diversity {:>5.1}% | mutation {:.3}",
            p.generation, p.best_fitness, p.avg_fitness, p.evaluation_rate, p.diversity_pct, p.mutation_rate
        );
        for insight in insights.iter().filter(|i| i.generation == p.generation) {
            println!("         {}", insight.message);
        }
        Ok(())
    }
}

async fn cmd_run(
    config_path: Option<PathBuf>,
    overrides: Overrides,
    data_dir: Option<PathBuf>,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("\n=== Strategy Evolver v{} ===", APP_VERSION);

    let mut config = match &config_path {
        Some(path) => EvolverConfig::load(path)?,
        None => EvolverConfig::default(),
    };
    overrides.apply(&mut config);
    let space = config.validate()?;
    let reference = config
        .reference()
        .context("no reference symbol")?
        .to_string();

    let (db, db_path) = open_db().await?;
    println!("Database: {}", db_path);
    println!("Symbols: {} (reference {})", config.symbols.join(", "), reference);
    println!(
        "Days: {} | Islands: {} x {} | Generations: {}",
        config.days,
        config.optimizer.islands,
        config.optimizer.population_size,
        config.optimizer.max_generations
    );

    let provider: Box<dyn HistoricalDataProvider> = match data_dir {
        Some(dir) => {
            println!("Data: {}", dir.display());
            Box::new(JsonDirProvider::new(dir))
        }
        None => match std::env::var("EVOLVER_DATA_URL") {
            Ok(url) => {
                println!("Data: {}", url);
                Box::new(BinanceClient::with_base_url(&url)?)
            }
            Err(_) => Box::new(BinanceClient::new()?),
        },
    };

    let end = Utc::now();
    let start = end - Duration::days(i64::from(config.days));
    let market = load_market_data(
        provider.as_ref(),
        &config.symbols,
        &reference,
        start,
        end,
        config.backtest.min_reference_bars,
    )
    .await?;
    println!("Loaded: {}\n", market.symbol_names().join(", "));

    let evaluator = Arc::new(BacktestEvaluator::new(
        Arc::new(market),
        config.backtest.clone(),
    ));
    let sink = SqliteCheckpointSink::new(db.pool_clone())
        .with_config_json(serde_json::to_string(&config)?);

    let optimizer = GeneticOptimizer::new(config.optimizer.clone(), space, evaluator)?
        .with_checkpoint_sink(Arc::new(sink))
        .with_progress_sink(Arc::new(ConsoleProgress));
    println!("Run: {}", optimizer.run_id());
    println!("Press Ctrl+C to stop after the current generation\n");

    let progress = optimizer.progress();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress.cancel();
    });

    let outcome = optimizer.run().await?;
    print_outcome(&outcome);

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&outcome.snapshot)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("\nSnapshot exported to {}", path.display());
    }

    Ok(())
}

fn print_outcome(outcome: &OptimizationOutcome) {
    println!(
        "\nFinished: {:?} after {} generations, {} evaluations",
        outcome.status, outcome.generations, outcome.total_evaluations
    );

    let Some(best) = &outcome.best else {
        println!("No strategy passed the judge.");
        if let Some(top) = &outcome.unaccepted {
            println!(
                "Top rejected genome #{}: fitness {:.3}, verdict {} (not accepted)",
                top.genome.id, top.genome.fitness, top.judgement.verdict
            );
            for warning in &top.judgement.warnings {
                println!("  ! {}", warning);
            }
        }
        return;
    };

    let r = &best.result;
    println!(
        "\nBest genome #{} (generation {}, island {}): {}",
        best.genome.id, best.genome.generation, best.genome.island, best.judgement.verdict
    );
    println!(
        "  Fitness {:.3} | Return {:+.1}% | Sharpe {:.2} | Sortino {:.2} | MaxDD {:.1}% | Trades {} | WR {:.1}%",
        best.genome.fitness,
        r.total_return * 100.0,
        r.sharpe_ratio,
        r.sortino_ratio,
        r.max_drawdown * 100.0,
        r.total_trades,
        r.win_rate * 100.0
    );
    for warning in &best.judgement.warnings {
        println!("  ! {}", warning);
    }

    println!("\n  {:<20} {:>10}", "Parameter", "Value");
    println!("  {}", "-".repeat(31));
    for (id, value) in best.genome.genes.iter() {
        println!("  {:<20} {:>10.4}", id.name(), value);
    }

    if !outcome.snapshot.best_by_regime.is_empty() {
        println!("\n  Best by regime:");
        for (regime, genome) in &outcome.snapshot.best_by_regime {
            println!("    {:<16} #{:<8} fitness {:.3}", regime, genome.id, genome.fitness);
        }
    }
}

// ============================================================================
// Checkpoints / cleanup commands
// ============================================================================

async fn cmd_checkpoints(run: Option<String>) -> anyhow::Result<()> {
    let (db, db_path) = open_db().await?;
    let repo = db.checkpoints();

    if let Some(run_id) = run {
        let record = repo
            .latest_for_run(&run_id)
            .await?
            .with_context(|| format!("no checkpoints for run {}", run_id))?;
        let snapshot = decode_snapshot(&record)?;
        println!(
            "{}: generation {}, {} evaluations",
            run_id, snapshot.generation, snapshot.total_evaluations
        );
        match (snapshot.global_best, snapshot.unaccepted_best) {
            (Some(best), _) => println!("{}", serde_json::to_string_pretty(&best.genes)?),
            (None, Some(top)) => {
                println!("No accepted best yet. Top rejected genome (not accepted):");
                println!("{}", serde_json::to_string_pretty(&top.genes)?);
            }
            (None, None) => println!("No accepted best yet."),
        }
        return Ok(());
    }

    let latest = repo.latest_per_run().await?;
    if latest.is_empty() {
        println!("No checkpoints in {}", db_path);
        return Ok(());
    }

    println!(
        "  {:<24} {:>6} {:>10} {:>10} {:<12} {:<16}",
        "Run", "Gen", "Evals", "Best", "Verdict", "Saved"
    );
    println!("  {}", "-".repeat(83));
    for r in latest {
        let saved = r
            .created_at_utc()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:>6} {:>10} {:>10} {:<12} {:<16}",
            r.run_id,
            r.generation,
            r.total_evaluations,
            r.best_fitness
                .map(|f| format!("{:.3}", f))
                .unwrap_or_else(|| "-".to_string()),
            r.verdict.unwrap_or_else(|| "-".to_string()),
            saved,
        );
    }
    Ok(())
}

async fn cmd_cleanup(keep: u32) -> anyhow::Result<()> {
    info!("Checkpoint cleanup, keeping newest {} per run", keep);

    let (db, db_path) = open_db().await?;
    info!("Database opened: {}", db_path);

    let repo = db.checkpoints();
    let deleted = repo.cleanup_keep_last(keep).await?;

    info!("Running VACUUM to reclaim disk space...");
    if let Err(e) = repo.vacuum().await {
        warn!(error = %e, "VACUUM failed");
    }

    let remaining = repo.count().await?;
    info!("Done! Deleted {} checkpoints, {} remaining.", deleted, remaining);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "evolver",
            "run",
            "--symbols",
            "SOLUSDT,XRPUSDT",
            "--generations",
            "40",
            "--seed",
            "9",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                symbols,
                generations,
                seed,
                data_dir,
                ..
            } => {
                assert_eq!(symbols, vec!["SOLUSDT", "XRPUSDT"]);
                assert_eq!(generations, Some(40));
                assert_eq!(seed, Some(9));
                assert!(data_dir.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_log_directives_precedence() {
        let from_env = Some("engine=trace".to_string());
        assert_eq!(log_directives(false, from_env.clone()), "engine=trace");
        assert!(log_directives(true, from_env).starts_with("debug"));
        assert!(log_directives(false, None).starts_with("info"));
        assert!(log_directives(false, Some("  ".to_string())).starts_with("info"));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = EvolverConfig::default();
        Overrides {
            symbols: vec!["ADAUSDT".to_string()],
            islands: Some(2),
            population: Some(20),
            seed: Some(1),
            ..Default::default()
        }
        .apply(&mut config);

        assert_eq!(config.symbols, vec!["ADAUSDT"]);
        assert_eq!(config.reference(), Some("ADAUSDT"));
        assert_eq!(config.optimizer.islands, 2);
        assert_eq!(config.optimizer.population_size, 20);
        assert_eq!(config.optimizer.seed, Some(1));
        // untouched
        assert_eq!(config.days, 730);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cleanup_default_keep() {
        let cli = Cli::try_parse_from(["evolver", "cleanup"]).unwrap();
        assert!(matches!(cli.command, Commands::Cleanup { keep: 5 }));
    }
}
