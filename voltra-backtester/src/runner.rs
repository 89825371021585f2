//! Multi-day runner: one isolated engine per file, a small worker pool
//! over a shared file queue, results merged back in file order.
//!
//! Engines share no mutable state; the only coordination is the queue of
//! file indices, the result slots, and a completion counter used for
//! progress logging.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use anyhow::Result;
use tracing::{error, info};
use voltra_core::StrategySetting;
use voltra_data::HistoricalDataEngine;
use voltra_quant::IvPriceMode;

use crate::reporting::TimestepMetric;
use crate::{BacktestEngine, BacktestResult, ExecutionModel};

/// Worker threads used for multi-file runs.
const NUM_ENGINES: usize = 4;

/// Everything needed to run one file end to end.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub strategy_class: String,
    pub strategy_setting: StrategySetting,
    pub model: ExecutionModel,
    pub risk_free_rate: f64,
    pub iv_price_mode: IvPriceMode,
}

/// Result of one file's run plus its metric stream.
#[derive(Clone, Debug)]
pub struct DailyOutcome {
    pub file: String,
    pub result: BacktestResult,
    pub metrics: Vec<TimestepMetric>,
}

fn run_one(path: &PathBuf, settings: &RunSettings) -> Result<DailyOutcome> {
    let mut data = HistoricalDataEngine::new();
    data.set_risk_free_rate(settings.risk_free_rate);
    data.set_iv_price_mode(settings.iv_price_mode);
    data.load_parquet(path, None)?;

    let mut engine = BacktestEngine::from_data(&mut data, settings.model)?;
    engine.add_strategy(&settings.strategy_class, &settings.strategy_setting)?;
    let result = engine.run()?;
    Ok(DailyOutcome {
        file: path.to_string_lossy().into_owned(),
        result,
        metrics: engine.metrics().to_vec(),
    })
}

/// Run every file, single-threaded for one file, a fixed worker pool
/// otherwise. Outcomes come back in file order; a file whose run failed
/// yields an outcome whose result carries the error.
pub fn run_files(files: &[PathBuf], settings: &RunSettings) -> Result<Vec<DailyOutcome>> {
    if files.len() == 1 {
        return Ok(vec![outcome_or_error(&files[0], settings)]);
    }

    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..files.len()).collect());
    let slots: Mutex<Vec<Option<DailyOutcome>>> = Mutex::new(vec![None; files.len()]);
    let completed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..NUM_ENGINES.min(files.len()) {
            scope.spawn(|| loop {
                let index = {
                    let mut queue = queue.lock().expect("file queue poisoned");
                    match queue.pop_front() {
                        Some(index) => index,
                        None => break,
                    }
                };
                let outcome = outcome_or_error(&files[index], settings);
                slots.lock().expect("result slots poisoned")[index] = Some(outcome);
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    completed = done,
                    total = files.len(),
                    file = %files[index].display(),
                    "backtest file finished"
                );
            });
        }
    });

    Ok(slots
        .into_inner()
        .expect("result slots poisoned")
        .into_iter()
        .flatten()
        .collect())
}

fn outcome_or_error(path: &PathBuf, settings: &RunSettings) -> DailyOutcome {
    match run_one(path, settings) {
        Ok(outcome) => outcome,
        Err(err) => {
            error!(file = %path.display(), error = %err, "backtest file failed");
            DailyOutcome {
                file: path.to_string_lossy().into_owned(),
                result: BacktestResult {
                    errors: vec![format!("{err:#}")],
                    ..BacktestResult::default()
                },
                metrics: Vec::new(),
            }
        }
    }
}

/// Merge per-file metric streams in file order, re-basing the timestep
/// counter so the combined sequence is strictly increasing.
#[must_use]
pub fn merge_metrics(outcomes: &[DailyOutcome]) -> Vec<TimestepMetric> {
    let mut merged = Vec::with_capacity(outcomes.iter().map(|o| o.metrics.len()).sum());
    let mut base = 0usize;
    for outcome in outcomes {
        for metric in &outcome.metrics {
            let mut metric = metric.clone();
            metric.timestep += base;
            merged.push(metric);
        }
        base += outcome.metrics.len();
    }
    merged
}
