//! `voltra` CLI: runs historical backtests and prints one JSON report to
//! stdout. Progress and diagnostics go to stderr via `tracing` when
//! `--log` (or `BACKTEST_LOG=1`) is set.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use voltra_backtester::runner::RunSettings;
use voltra_backtester::{build_report, merge_metrics, run_files, ExecutionModel};
use voltra_core::StrategySetting;
use voltra_quant::IvPriceMode;
use voltra_strategy::register_builtin_strategies;

#[derive(Parser)]
#[command(author, version, about = "voltra options trading runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay one or more parquet files through a strategy.
    Backtest(BacktestArgs),
}

#[derive(Args)]
struct BacktestArgs {
    /// Parquet file (single-file mode); omit when using --files.
    #[arg(value_name = "PARQUET", required_unless_present = "files")]
    parquet: Option<String>,

    /// Strategy class name, e.g. StraddleCycle.
    #[arg(value_name = "STRATEGY")]
    strategy: Option<String>,

    /// Explicit list of parquet files (multi-day mode).
    #[arg(long, num_args = 1.., value_name = "FILE")]
    files: Vec<PathBuf>,

    /// Per-contract fee.
    #[arg(long, default_value_t = 0.35)]
    fee_rate: f64,

    /// Market-order slippage in basis points.
    #[arg(long, default_value_t = 5.0)]
    slippage_bps: f64,

    /// Flat risk-free rate used by the greeks.
    #[arg(long, default_value_t = 0.05)]
    risk_free_rate: f64,

    /// IV input price selection: mid, bid, or ask.
    #[arg(long, default_value = "mid")]
    iv_price_mode: String,

    /// Enable info-level logging on stderr.
    #[arg(long)]
    log: bool,

    /// Trailing strategy settings as key=value numeric pairs.
    #[arg(value_name = "KEY=VALUE", trailing_var_arg = true)]
    settings: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Backtest(args) => match run_backtest(args) {
            Ok(report) => {
                println!("{report}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                let payload = serde_json::json!({
                    "status": "error",
                    "error": format!("{err:#}"),
                });
                println!("{payload}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run_backtest(args: BacktestArgs) -> Result<String> {
    let log_enabled = args.log
        || std::env::var("BACKTEST_LOG")
            .map(|value| value == "1" || value == "true")
            .unwrap_or(false);
    if log_enabled {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let (files, strategy) = resolve_inputs(&args)?;
    if args.fee_rate < 0.0 {
        bail!("fee_rate must be >= 0");
    }
    let iv_price_mode: IvPriceMode = args
        .iv_price_mode
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let strategy_setting = parse_settings(&args.settings)?;

    register_builtin_strategies();

    let settings = RunSettings {
        strategy_class: strategy,
        strategy_setting,
        model: ExecutionModel {
            fee_rate: args.fee_rate,
            slippage_bps: args.slippage_bps.max(0.0),
        },
        risk_free_rate: args.risk_free_rate,
        iv_price_mode,
    };

    let started = Instant::now();
    let outcomes = run_files(&files, &settings).context("backtest run failed")?;
    let duration_seconds = started.elapsed().as_secs_f64();

    let metrics = merge_metrics(&outcomes);
    let daily: Vec<(String, voltra_backtester::BacktestResult)> = outcomes
        .into_iter()
        .map(|outcome| (outcome.file, outcome.result))
        .collect();
    let report = build_report(
        &daily,
        &metrics,
        args.fee_rate,
        args.risk_free_rate,
        iv_price_mode.as_str(),
        duration_seconds,
    );
    serde_json::to_string(&report).context("failed to serialize report")
}

/// Reconcile the positional grammar: in single-file mode the positionals
/// are `<parquet> <strategy>`; with `--files` the strategy may arrive as a
/// leftover positional or as the trailing `--files` value (a bare name
/// without path separators is a strategy, not a file).
fn resolve_inputs(args: &BacktestArgs) -> Result<(Vec<PathBuf>, String)> {
    if !args.files.is_empty() {
        let mut files = args.files.clone();
        let strategy = args
            .strategy
            .clone()
            .or_else(|| args.parquet.clone())
            .or_else(|| {
                let last = files.last()?.to_string_lossy().into_owned();
                if looks_like_strategy_name(&last) {
                    files.pop();
                    Some(last)
                } else {
                    None
                }
            })
            .context("strategy name not specified")?;
        if files.is_empty() {
            bail!("no parquet files specified");
        }
        return Ok((files, strategy));
    }
    let parquet = args.parquet.clone().context("no parquet file specified")?;
    let strategy = args.strategy.clone().context("strategy name not specified")?;
    Ok((vec![PathBuf::from(parquet)], strategy))
}

fn looks_like_strategy_name(value: &str) -> bool {
    !value.contains('/') && !value.contains('\\') && !value.contains('.')
}

/// Parse trailing `key=value` pairs into the flat numeric settings map.
/// Malformed or non-numeric pairs are skipped.
fn parse_settings(pairs: &[String]) -> Result<StrategySetting> {
    let mut setting = StrategySetting::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        if key.is_empty() || value.is_empty() {
            continue;
        }
        if let Ok(number) = value.parse::<f64>() {
            setting.insert(key.to_string(), number);
        }
    }
    Ok(setting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_numeric_pairs_only() {
        let setting = parse_settings(&[
            "position_size=2".into(),
            "timer_trigger=5".into(),
            "label=fast".into(),
            "broken".into(),
        ])
        .unwrap();
        assert_eq!(setting.get("position_size"), Some(&2.0));
        assert_eq!(setting.get("timer_trigger"), Some(&5.0));
        assert!(!setting.contains_key("label"));
        assert_eq!(setting.len(), 2);
    }

    fn args_with(
        parquet: Option<&str>,
        strategy: Option<&str>,
        files: Vec<&str>,
    ) -> BacktestArgs {
        BacktestArgs {
            parquet: parquet.map(str::to_string),
            strategy: strategy.map(str::to_string),
            files: files.into_iter().map(PathBuf::from).collect(),
            fee_rate: 0.35,
            slippage_bps: 5.0,
            risk_free_rate: 0.05,
            iv_price_mode: "mid".into(),
            log: false,
            settings: Vec::new(),
        }
    }

    #[test]
    fn multi_file_mode_reads_strategy_from_leftover_positional() {
        let args = args_with(Some("StraddleCycle"), None, vec!["a.parquet", "b.parquet"]);
        let (files, strategy) = resolve_inputs(&args).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(strategy, "StraddleCycle");
    }

    #[test]
    fn multi_file_mode_peels_trailing_strategy_from_files() {
        let args = args_with(None, None, vec!["a.parquet", "b.parquet", "StraddleCycle"]);
        let (files, strategy) = resolve_inputs(&args).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(strategy, "StraddleCycle");
    }

    #[test]
    fn single_file_mode_requires_both_positionals() {
        let args = args_with(Some("a.parquet"), Some("StraddleCycle"), Vec::new());
        let (files, strategy) = resolve_inputs(&args).unwrap();
        assert_eq!(files, vec![PathBuf::from("a.parquet")]);
        assert_eq!(strategy, "StraddleCycle");
        assert!(resolve_inputs(&args_with(Some("a.parquet"), None, Vec::new())).is_err());
    }
}
