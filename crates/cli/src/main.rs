//! Pattern Miner — pattern-based strategy discovery on daily candles
//!
//! Usage:
//!   pattern-miner simulate --data dax.csv                — backtest one strategy
//!   pattern-miner optimize --data dax.csv --duration 60  — random-search session
//!   pattern-miner meta --data dax.csv --split 70 --duration 60 \
//!       --lookback-min 3 --lookback-max 10 --perf-min 0 --perf-max 0.5
//!                                                        — walk-forward filter validation
//!   pattern-miner check --data dax.csv --test gold.csv   — replay on unrelated datasets

mod data;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use engine::{
    derive_metrics, prepare_features, rank_analysis, run_meta_optimization, run_robustness_check,
    run_weights_analysis, simulate, ConstraintSet, FilterGrid, KpiSet, MetaEvent, MetaReport,
    MetaRequest, OptimizerEvent, OptimizerOptions, ParamConstraint, ParameterRange, RankAnalysis,
    RankBucket, SearchOptimizer, SimulationResult, SortColumn, SortDirection, StrategySettings,
    WeightSample,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::info;

use data::{dataset_name, load_candles};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "pattern-miner")]
#[command(about = "Pattern-based strategy discovery on daily candles", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest and print its KPIs
    Simulate {
        /// Candle file (CSV or TSV)
        #[arg(long)]
        data: PathBuf,
        /// Strategy settings JSON (defaults when absent)
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Optional JSON export path for the full result
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Search strategy settings with the adaptive random optimizer
    Optimize {
        /// Candle file (CSV or TSV)
        #[arg(long)]
        data: PathBuf,
        /// Search duration in seconds
        #[arg(long, default_value_t = 60)]
        duration: u64,
        /// Leaderboard sort column: robustness, annual, daily, trades, win-rate
        #[arg(long, default_value = "robustness")]
        sort: String,
        /// Sort direction: desc, asc
        #[arg(long, default_value = "desc")]
        direction: String,
        /// Leaderboard size
        #[arg(long, default_value_t = 10)]
        top: usize,
        /// Worker tasks (default: available cores; PATTERN_MINER_WORKERS overrides)
        #[arg(long)]
        workers: Option<usize>,
        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Disable constraint learning
        #[arg(long)]
        no_learning: bool,
        /// Seconds between constraint-learning passes
        #[arg(long, default_value_t = 120)]
        learning_interval: u64,
        /// Optional JSON export path for the leaderboard
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Walk-forward validation of trade-filter rules
    Meta {
        /// Candle file (CSV or TSV)
        #[arg(long)]
        data: PathBuf,
        /// Training share of the dataset in percent
        #[arg(long, default_value_t = 70.0)]
        split: f64,
        /// Phase-1 search duration in seconds
        #[arg(long, default_value_t = 60)]
        duration: u64,
        /// Trade-lookback grid axis
        #[arg(long, default_value_t = 3.0)]
        lookback_min: f64,
        #[arg(long, default_value_t = 10.0)]
        lookback_max: f64,
        #[arg(long, default_value_t = 1.0)]
        lookback_step: f64,
        /// Min-performance grid axis, percent per held day
        #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
        perf_min: f64,
        #[arg(long, default_value_t = 0.5, allow_negative_numbers = true)]
        perf_max: f64,
        #[arg(long, default_value_t = 0.1)]
        perf_step: f64,
        /// Weight-sensitivity sampling runs (0 skips the analysis)
        #[arg(long, default_value_t = 0)]
        weights_runs: usize,
        /// Worker tasks for phase 1 (PATTERN_MINER_WORKERS overrides)
        #[arg(long)]
        workers: Option<usize>,
        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Optional JSON export path for the full report
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Replay a strategy on unrelated datasets
    Check {
        /// Training candle file the rank bins are fitted on
        #[arg(long)]
        data: PathBuf,
        /// Test candle files, one report row per file
        #[arg(long, required = true, num_args = 1..)]
        test: Vec<PathBuf>,
        /// Strategy settings JSON (defaults when absent)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "debug,engine=debug,pattern_miner=debug"
    } else {
        "info,engine=info,pattern_miner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(filter)
        .init();
}

fn parse_sort_column(s: &str) -> SortColumn {
    match s.to_lowercase().as_str() {
        "annual" | "cagr" => SortColumn::AnnualReturn,
        "daily" => SortColumn::AvgDailyTradeReturn,
        "trades" => SortColumn::TradeCount,
        "win-rate" | "win_rate" | "winrate" => SortColumn::WinRate,
        _ => SortColumn::RobustnessRatio,
    }
}

fn parse_direction(s: &str) -> SortDirection {
    match s.to_lowercase().as_str() {
        "asc" | "ascending" => SortDirection::Asc,
        _ => SortDirection::Desc,
    }
}

/// CLI flag first, then the PATTERN_MINER_WORKERS env var, then the
/// optimizer's own core-count default.
fn resolve_workers(flag: Option<usize>) -> Option<usize> {
    flag.or_else(|| {
        std::env::var("PATTERN_MINER_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Simulate {
            data,
            settings,
            export,
        } => {
            cmd_simulate(&data, settings.as_deref(), export.as_deref())?;
        }
        Commands::Optimize {
            data,
            duration,
            sort,
            direction,
            top,
            workers,
            seed,
            no_learning,
            learning_interval,
            export,
        } => {
            let options = OptimizerOptions {
                sort_column: parse_sort_column(&sort),
                sort_direction: parse_direction(&direction),
                capacity: top.max(1),
                workers: resolve_workers(workers),
                learning_enabled: !no_learning,
                learning_interval: Duration::from_secs(learning_interval.max(1)),
                seed,
                ..OptimizerOptions::default()
            };
            cmd_optimize(&data, duration, options, export.as_deref()).await?;
        }
        Commands::Meta {
            data,
            split,
            duration,
            lookback_min,
            lookback_max,
            lookback_step,
            perf_min,
            perf_max,
            perf_step,
            weights_runs,
            workers,
            seed,
            export,
        } => {
            let grid = FilterGrid {
                trade_lookback: ParameterRange::new(lookback_min, lookback_max, lookback_step),
                min_performance: ParameterRange::new(perf_min, perf_max, perf_step),
            };
            let phase1 = OptimizerOptions {
                workers: resolve_workers(workers),
                seed,
                ..OptimizerOptions::default()
            };
            cmd_meta(
                &data,
                split,
                duration,
                grid,
                phase1,
                weights_runs,
                seed,
                export.as_deref(),
            )
            .await?;
        }
        Commands::Check {
            data,
            test,
            settings,
        } => {
            cmd_check(&data, &test, settings.as_deref())?;
        }
    }

    Ok(())
}

// ============================================================================
// Simulate command — one backtest
// ============================================================================

fn cmd_simulate(
    data: &Path,
    settings_path: Option<&Path>,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let candles = load_candles(data)?;
    let settings = load_settings(settings_path)?;
    let series = prepare_features(&candles)?;

    println!("\n=== Pattern Miner v{} ===", APP_VERSION);
    println!(
        "Dataset: {} ({} candles, {} feature days)",
        dataset_name(data),
        candles.len(),
        series.len()
    );
    println!("Strategy: {}", format_settings(&settings));

    let result = match simulate(&settings, &series) {
        Some(result) => result,
        None => {
            println!("\nNot enough history: the series must clear lookback + pattern length before the first tradable day.");
            return Ok(());
        }
    };

    print_kpis(&result.kpis);

    if let Some(path) = export {
        export_json(path, &result)?;
    }
    Ok(())
}

// ============================================================================
// Optimize command — random-search session
// ============================================================================

async fn cmd_optimize(
    data: &Path,
    duration: u64,
    options: OptimizerOptions,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let candles = load_candles(data)?;
    let series = Arc::new(prepare_features(&candles)?);

    println!("\n=== Pattern Miner v{} ===", APP_VERSION);
    println!(
        "Dataset: {} ({} feature days) | Duration: {}s | Sort: {} {}",
        dataset_name(data),
        series.len(),
        duration,
        options.sort_column.label(),
        options.sort_direction.label()
    );
    if let Some(seed) = options.seed {
        println!("Seed: {}", seed);
    }
    println!();

    let capacity = options.capacity;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let optimizer = SearchOptimizer::spawn(events_tx);
    optimizer.start(series, options);

    let deadline = tokio::time::sleep(Duration::from_secs(duration.max(1)));
    tokio::pin!(deadline);

    let mut constraints = ConstraintSet::default();
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events_rx.recv() => match event {
                Some(OptimizerEvent::Status(status)) => {
                    print!(
                        "\r  {} | tested {} | phase {} | board {}/{}   ",
                        status.state.label(),
                        status.tested,
                        status.phase,
                        status.leaderboard_len,
                        capacity
                    );
                }
                Some(OptimizerEvent::ConstraintsUpdated(update)) => constraints = update,
                Some(OptimizerEvent::LeaderboardUpdated(_)) => {}
                None => break,
            },
        }
    }
    println!();

    // Snapshot before stop, stopping clears the session
    let results = optimizer.snapshot().await;
    let status = optimizer.status().await;
    optimizer.stop();

    info!(
        tested = status.tested,
        results = results.len(),
        "search finished"
    );

    if results.is_empty() {
        println!("\nNo strategy with at least one completed trade was found.");
        return Ok(());
    }

    print_leaderboard(&results);
    print_constraints(&constraints);

    if let Some(best) = results.first() {
        println!("\nBest strategy: {}", format_settings(&best.settings));
        print_kpis(&best.kpis);
    }

    if let Some(path) = export {
        let plain: Vec<&SimulationResult> = results.iter().map(|r| r.as_ref()).collect();
        export_json(path, &plain)?;
    }
    Ok(())
}

// ============================================================================
// Meta command — walk-forward filter validation
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn cmd_meta(
    data: &Path,
    split: f64,
    duration: u64,
    grid: FilterGrid,
    phase1: OptimizerOptions,
    weights_runs: usize,
    seed: Option<u64>,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let candles = load_candles(data)?;
    let rows = derive_metrics(&candles);

    println!("\n=== Pattern Miner v{} ===", APP_VERSION);
    println!(
        "Dataset: {} ({} derived days) | Split: {:.0}/{:.0} | Phase 1 budget: {}s",
        dataset_name(data),
        rows.len(),
        split,
        100.0 - split,
        duration
    );

    let request = MetaRequest {
        split_fraction: split / 100.0,
        grid,
        phase1,
        phase1_budget: Duration::from_secs(duration.max(1)),
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                MetaEvent::Phase1Started {
                    training_len,
                    validation_len,
                } => {
                    println!(
                        "\nPhase 1: searching base strategies ({} training days, {} validation days)...",
                        training_len, validation_len
                    );
                }
                MetaEvent::Phase2Progress { done, total } => {
                    print!("\r  Validating rules... {}/{}   ", done, total);
                }
                MetaEvent::Finished { rules } => {
                    println!("\r  Validated {} rules.          ", rules);
                }
            }
        }
    });

    let report = run_meta_optimization(request, &rows, Some(events_tx)).await?;
    let _ = printer.await;

    print_meta_report(&report);
    let analysis = rank_analysis(&report.results);
    print_rank_analysis(&analysis);

    let samples = if weights_runs > 0 && !report.results.is_empty() {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let samples = run_weights_analysis(&report.results, weights_runs, &mut rng);
        print_weight_samples(&samples);
        samples
    } else {
        Vec::new()
    };

    if let Some(path) = export {
        let payload = serde_json::json!({
            "report": report,
            "rank_analysis": analysis,
            "weight_samples": samples,
        });
        export_json(path, &payload)?;
    }
    Ok(())
}

// ============================================================================
// Check command — cross-dataset robustness
// ============================================================================

fn cmd_check(
    data: &Path,
    test_paths: &[PathBuf],
    settings_path: Option<&Path>,
) -> anyhow::Result<()> {
    let training = load_candles(data)?;
    let settings = load_settings(settings_path)?;

    let mut tests = Vec::with_capacity(test_paths.len());
    for path in test_paths {
        tests.push((dataset_name(path), load_candles(path)?));
    }

    println!("\n=== Pattern Miner v{} ===", APP_VERSION);
    println!(
        "Training: {} ({} candles)",
        dataset_name(data),
        training.len()
    );
    println!("Strategy: {}", format_settings(&settings));

    let report = run_robustness_check(&settings, &training, &tests)?;

    println!("\nRobustness Check:");
    println!("  {:<24} {:>12} {:>7}", "Dataset", "AvgTrade%", "Trades");
    println!("  {}", "-".repeat(46));
    for row in &report {
        println!(
            "  {:<24} {:>+12.3} {:>7}",
            row.name, row.avg_trade_return, row.trade_count
        );
    }
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

fn load_settings(path: Option<&Path>) -> anyhow::Result<StrategySettings> {
    use anyhow::Context;

    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let settings: StrategySettings = serde_json::from_str(&raw)
                .with_context(|| format!("invalid settings JSON in {}", path.display()))?;
            Ok(settings)
        }
        None => Ok(StrategySettings::default()),
    }
}

fn export_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    use anyhow::Context;

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, &json).with_context(|| format!("failed to write {}", path.display()))?;
    println!("\nResults exported to {}", path.display());
    Ok(())
}

fn format_settings(settings: &StrategySettings) -> String {
    let factors: Vec<String> = settings
        .factors
        .iter()
        .map(|f| format!("{} w{:.0}", f.key.label(), f.weight))
        .collect();
    format!(
        "{} | pattern {} | hold {} | lookback {} | tol {:.1} | occ {}-{} | {}",
        settings.mode.label(),
        settings.pattern_length,
        settings.holding_period,
        settings.lookback,
        settings.tolerance,
        settings.min_occurrences,
        settings.max_occurrences,
        factors.join(", "),
    )
}

fn format_settings_compact(settings: &StrategySettings) -> String {
    let factors: Vec<&str> = settings.factors.iter().map(|f| f.key.label()).collect();
    format!(
        "{} p{} h{} lb{} t{:.1} o{}-{} [{}]",
        settings.mode.label(),
        settings.pattern_length,
        settings.holding_period,
        settings.lookback,
        settings.tolerance,
        settings.min_occurrences,
        settings.max_occurrences,
        factors.join(", ")
    )
}

fn print_kpis(kpis: &KpiSet) {
    println!("\nKPIs:");
    println!("  {:<26} {:>12.2}", "Final value", kpis.final_value);
    println!("  {:<26} {:>11.2}%", "Annual return (CAGR)", kpis.annual_return);
    println!("  {:<26} {:>12}", "Completed trades", kpis.trade_count);
    println!("  {:<26} {:>11.1}%", "Win rate", kpis.win_rate);
    println!("  {:<26} {:>11.3}%", "Avg trade return", kpis.avg_trade_return);
    println!(
        "  {:<26} {:>11.3}%",
        "Avg daily trade return", kpis.avg_daily_trade_return
    );
    println!(
        "  {:<26} {:>11.1}%",
        "Max drawdown",
        kpis.max_drawdown * 100.0
    );
    println!(
        "  {:<26} {:>10.0} d",
        "Longest drawdown", kpis.longest_drawdown_duration
    );
    println!(
        "  {:<26} {:>12.1}",
        "Robustness ratio", kpis.robustness_ratio
    );
}

fn print_leaderboard(results: &[Arc<SimulationResult>]) {
    println!("\nTop {} Strategies:", results.len());
    println!(
        "  {:>3}  {:>8} {:>8} {:>7} {:>7} {:>9}  {}",
        "#", "Robust", "CAGR%", "Trades", "WR%", "AvgDay%", "Strategy"
    );
    println!("  {}", "-".repeat(100));
    for (i, result) in results.iter().enumerate() {
        let k = &result.kpis;
        println!(
            "  {:>3}  {:>8.1} {:>+8.1} {:>7} {:>6.1}% {:>+9.3}  {}",
            i + 1,
            k.robustness_ratio,
            k.annual_return,
            k.trade_count,
            k.win_rate,
            k.avg_daily_trade_return,
            format_settings_compact(&result.settings),
        );
    }
}

fn print_constraints(constraints: &ConstraintSet) {
    let learned: Vec<_> = constraints
        .params()
        .filter(|(_, c)| !matches!(c, ParamConstraint::Unconstrained))
        .collect();
    if constraints.phase == 0 && learned.is_empty() {
        return;
    }

    println!("\nConstraints (learning phase {}):", constraints.phase);
    for (key, constraint) in learned {
        match constraint {
            ParamConstraint::Locked { value } => {
                println!("  {:<18} locked at {:.1}", key.label(), value)
            }
            ParamConstraint::Range { min, max } => {
                println!("  {:<18} {:.1} .. {:.1}", key.label(), min, max)
            }
            ParamConstraint::Unconstrained => {}
        }
    }
    if let Some((min, max)) = constraints.num_factors {
        println!("  {:<18} {} .. {}", "Factors", min, max);
    }
    if !constraints.locked_factors.is_empty() {
        let labels: Vec<&str> = constraints
            .locked_factors
            .iter()
            .map(|k| k.label())
            .collect();
        println!("  {:<18} {}", "Adopted factors", labels.join(", "));
    }
}

fn print_meta_report(report: &MetaReport) {
    println!(
        "\nTraining: {} days | Validation: {} days | Base strategies: {}",
        report.training_len, report.validation_len, report.base_strategies
    );
    println!(
        "Benchmark avg daily change: IS {:+.3}% | OOS {:+.3}%",
        report.benchmark_is, report.benchmark_oos
    );
    if report.results.is_empty() {
        println!("\nNo rules validated: phase 1 found no base strategies.");
        return;
    }

    println!("\nRule Ranking (by OOS avg daily return):");
    println!(
        "  {:>3}  {:<22} {:>9} {:>9} {:>11} {:>7}",
        "#", "Rule", "IS%/d", "OOS%/d", "Profit", "Trades"
    );
    println!("  {}", "-".repeat(68));
    for (i, r) in report.results.iter().enumerate() {
        println!(
            "  {:>3}  {:<22} {:>+9.3} {:>+9.3} {:>+11.2} {:>7}",
            i + 1,
            r.rule.name,
            r.avg_daily_return_is,
            r.avg_daily_return_oos,
            r.total_profit,
            r.total_trades
        );
    }
}

fn print_rank_analysis(analysis: &RankAnalysis) {
    if analysis.by_trade_lookback.is_empty() && analysis.by_min_performance.is_empty() {
        return;
    }
    println!("\nMean OOS rank by trade lookback:");
    print_rank_buckets(&analysis.by_trade_lookback, 0);
    println!("\nMean OOS rank by min performance:");
    print_rank_buckets(&analysis.by_min_performance, 1);
}

fn print_rank_buckets(buckets: &[RankBucket], decimals: usize) {
    println!("  {:>10} {:>10} {:>7}", "Value", "MeanRank", "Rules");
    for bucket in buckets {
        println!(
            "  {:>10.prec$} {:>10.2} {:>7}",
            bucket.value,
            bucket.mean_rank,
            bucket.rules,
            prec = decimals
        );
    }
}

fn print_weight_samples(samples: &[WeightSample]) {
    if samples.is_empty() {
        return;
    }
    println!(
        "\nWeight sensitivity (top {} weightings by stability):",
        samples.len()
    );
    println!(
        "  {:>3}  {:<22} {:>9}  {}",
        "#", "A/D/W/MDD/DDD", "Stability", "Top rule"
    );
    println!("  {}", "-".repeat(64));
    for (i, sample) in samples.iter().enumerate() {
        let w = sample.weights.as_array();
        println!(
            "  {:>3}  {:<22} {:>9.1}  {}",
            i + 1,
            format!("{:.0}/{:.0}/{:.0}/{:.0}/{:.0}", w[0], w[1], w[2], w[3], w[4]),
            sample.stability,
            sample.top_rule
        );
    }
}
