//! Run reporting: per-timestep metrics, cross-day PnL stitching, LTTB
//! chart downsampling, and the JSON report emitted by the CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::BacktestResult;

/// Chart series are capped at this many points via LTTB.
const MAX_CHART_POINTS: usize = 1000;

/// One per-bar sample of the running holding summary.
#[derive(Clone, Debug, Serialize)]
pub struct TimestepMetric {
    pub timestep: usize,
    pub timestamp: DateTime<Utc>,
    pub pnl: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub fees: f64,
}

/// Largest-Triangle-Three-Buckets downsampling over a single Y series with
/// X = 0..N-1. Returns selected indices including first and last; series
/// already within the threshold come back whole.
#[must_use]
pub fn lttb_downsample_indices(values: &[f64], threshold: usize) -> Vec<usize> {
    let n = values.len();
    if threshold >= n || threshold < 3 || n == 0 {
        return (0..n).collect();
    }

    let mut out = Vec::with_capacity(threshold);
    out.push(0);

    let bucket_size = (n - 2) as f64 / (threshold - 2) as f64;
    let mut anchor = 0usize;

    for i in 0..threshold - 2 {
        let bucket_start = 1.0 + i as f64 * bucket_size;
        let bucket_end = bucket_start + bucket_size;
        let start = bucket_start.floor() as usize;
        let end = (bucket_end.floor() as usize).min(n - 1);

        // Average of the following bucket serves as point C.
        let next_start = bucket_end.floor() as usize;
        let next_end = ((bucket_end + bucket_size).floor() as usize).min(n - 1);
        let (mut avg_x, mut avg_y, mut count) = (0.0, 0.0, 0usize);
        for j in next_start..next_end {
            avg_x += j as f64;
            avg_y += values[j];
            count += 1;
        }
        if count == 0 {
            avg_x = anchor as f64;
            avg_y = values[anchor];
        } else {
            avg_x /= count as f64;
            avg_y /= count as f64;
        }

        let ax = anchor as f64;
        let ay = values[anchor];
        let mut max_area = -1.0;
        let mut selected = start;
        for j in start..end {
            let area = ((ax - avg_x) * (values[j] - ay) - (ax - j as f64) * (avg_y - ay)).abs();
            if area > max_area {
                max_area = area;
                selected = j;
            }
        }
        out.push(selected);
        anchor = selected;
    }

    out.push(n - 1);
    out
}

/// Stitch a multi-day metric sequence into one continuous PnL path.
///
/// Each engine reports PnL relative to its own day; days are chained by
/// shifting every day's curve by the previous day's close. Returns the
/// stitched path and the indices where a new day begins.
#[must_use]
pub fn stitch_pnl(metrics: &[TimestepMetric]) -> (Vec<f64>, Vec<usize>) {
    let mut full = Vec::with_capacity(metrics.len());
    let mut boundaries = Vec::new();
    let mut prev_date = None;
    let mut offset = 0.0;
    let mut day_start_pnl = 0.0;
    for (i, metric) in metrics.iter().enumerate() {
        let date = metric.timestamp.date_naive();
        if prev_date != Some(date) {
            if prev_date.is_some() && i > 0 {
                offset += metrics[i - 1].pnl - day_start_pnl;
                boundaries.push(i);
            }
            prev_date = Some(date);
            day_start_pnl = metric.pnl;
        }
        full.push(metric.pnl - day_start_pnl + offset);
    }
    (full, boundaries)
}

/// Maximum peak-to-trough drop of a stitched PnL path.
#[must_use]
pub fn max_drawdown(path: &[f64]) -> f64 {
    let mut peak = f64::MIN;
    let mut drawdown = 0.0f64;
    for &value in path {
        peak = peak.max(value);
        drawdown = drawdown.max(peak - value);
    }
    if path.is_empty() {
        0.0
    } else {
        drawdown
    }
}

/// Annualized Sharpe ratio of per-day net returns (sample stdev, 252 days).
#[must_use]
pub fn daily_sharpe(daily_returns: &[f64]) -> f64 {
    if daily_returns.len() < 2 {
        return 0.0;
    }
    let n = daily_returns.len() as f64;
    let mean = daily_returns.iter().sum::<f64>() / n;
    let var = daily_returns
        .iter()
        .map(|ret| (ret - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let std = var.sqrt();
    if std > 1e-12 {
        mean / std * 252.0_f64.sqrt()
    } else {
        0.0
    }
}

/// Chart-ready series: the stitched PnL plus greeks sampled at the same
/// LTTB-selected indices, so all four lines share one x grid.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ChartData {
    pub pnl: Vec<f64>,
    pub x_greek: Vec<usize>,
    pub delta: Vec<f64>,
    pub theta: Vec<f64>,
    pub gamma: Vec<f64>,
    pub day_boundaries: Vec<usize>,
}

/// Per-file breakdown in the report.
#[derive(Clone, Debug, Serialize)]
pub struct DailyReport {
    pub file: String,
    pub pnl: f64,
    pub net_pnl: f64,
    pub fees: f64,
    pub orders: usize,
    pub timesteps: usize,
    pub rows: usize,
}

/// Aggregate block of the report.
#[derive(Clone, Debug, Serialize)]
pub struct ReportSummary {
    pub strategy_name: String,
    pub portfolio_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_timesteps: usize,
    pub total_rows: usize,
    pub total_orders: usize,
    pub max_delta: f64,
    pub max_gamma: f64,
    pub max_theta: f64,
    pub max_drawdown: f64,
    pub daily_sharpe: f64,
    pub total_fees: f64,
    pub fill_mode: &'static str,
    pub fee_rate: f64,
    pub risk_free_rate: f64,
    pub iv_price_mode: String,
    pub final_pnl: f64,
    pub net_pnl: f64,
    pub num_days: usize,
    pub duration_seconds: f64,
}

/// Full JSON document written to stdout by the backtest CLI.
#[derive(Clone, Debug, Serialize)]
pub struct BacktestReport {
    pub status: &'static str,
    pub result: ReportSummary,
    pub daily_results: Vec<DailyReport>,
    pub chart_data: ChartData,
    pub errors: Vec<String>,
}

/// Assemble the report from per-day results and the merged metric stream.
#[must_use]
pub fn build_report(
    daily: &[(String, BacktestResult)],
    metrics: &[TimestepMetric],
    fee_rate: f64,
    risk_free_rate: f64,
    iv_price_mode: &str,
    duration_seconds: f64,
) -> BacktestReport {
    let mut summary = ReportSummary {
        strategy_name: String::new(),
        portfolio_name: "backtest".into(),
        start_time: None,
        end_time: None,
        processed_timesteps: 0,
        total_rows: 0,
        total_orders: 0,
        max_delta: 0.0,
        max_gamma: 0.0,
        max_theta: 0.0,
        max_drawdown: 0.0,
        daily_sharpe: 0.0,
        total_fees: 0.0,
        fill_mode: "buy=ask,sell=bid",
        fee_rate,
        risk_free_rate,
        iv_price_mode: iv_price_mode.to_string(),
        final_pnl: 0.0,
        net_pnl: 0.0,
        num_days: daily.len(),
        duration_seconds,
    };

    let mut daily_reports = Vec::with_capacity(daily.len());
    let mut daily_returns = Vec::with_capacity(daily.len());
    let mut errors = Vec::new();
    for (file, result) in daily {
        if summary.strategy_name.is_empty() {
            summary.strategy_name = result.strategy_name.clone();
            summary.portfolio_name = result.portfolio_name.clone();
            summary.start_time = result.start_time;
        }
        summary.end_time = result.end_time.or(summary.end_time);
        summary.processed_timesteps += result.processed_timesteps;
        summary.total_rows += result.total_rows;
        summary.total_orders += result.total_orders;
        summary.final_pnl += result.final_pnl;
        summary.total_fees += result.cumulative_fees;
        summary.max_delta = summary.max_delta.max(result.max_delta);
        summary.max_gamma = summary.max_gamma.max(result.max_gamma);
        summary.max_theta = summary.max_theta.max(result.max_theta);
        errors.extend(result.errors.iter().cloned());

        let net = result.final_pnl - result.cumulative_fees;
        daily_returns.push(net);
        daily_reports.push(DailyReport {
            file: file.clone(),
            pnl: result.final_pnl,
            net_pnl: net,
            fees: result.cumulative_fees,
            orders: result.total_orders,
            timesteps: result.processed_timesteps,
            rows: result.total_rows,
        });
    }
    summary.net_pnl = summary.final_pnl - summary.total_fees;
    summary.daily_sharpe = daily_sharpe(&daily_returns);

    let (full_pnl, day_boundaries) = stitch_pnl(metrics);
    summary.max_drawdown = max_drawdown(&full_pnl);

    let indices = lttb_downsample_indices(&full_pnl, MAX_CHART_POINTS);
    let chart_data = ChartData {
        pnl: indices.iter().map(|&i| full_pnl[i]).collect(),
        x_greek: indices.clone(),
        delta: indices.iter().map(|&i| metrics[i].delta).collect(),
        theta: indices.iter().map(|&i| metrics[i].theta).collect(),
        gamma: indices.iter().map(|&i| metrics[i].gamma).collect(),
        day_boundaries,
    };

    BacktestReport {
        status: "ok",
        result: summary,
        daily_results: daily_reports,
        chart_data,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metric(day: u32, step: usize, pnl: f64) -> TimestepMetric {
        TimestepMetric {
            timestep: step,
            timestamp: Utc
                .with_ymd_and_hms(2026, 3, day, 15, step as u32 % 60, 0)
                .unwrap(),
            pnl,
            delta: pnl / 10.0,
            gamma: 0.0,
            theta: 0.0,
            fees: 0.0,
        }
    }

    #[test]
    fn lttb_keeps_endpoints_and_respects_threshold() {
        let values: Vec<f64> = (0..500).map(|i| (i as f64 * 0.1).sin()).collect();
        let indices = lttb_downsample_indices(&values, 100);
        assert_eq!(indices.len(), 100);
        assert_eq!(indices[0], 0);
        assert_eq!(*indices.last().unwrap(), 499);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));

        let short = lttb_downsample_indices(&values[..50], 100);
        assert_eq!(short.len(), 50);
    }

    #[test]
    fn stitching_chains_days_by_close() {
        let metrics = vec![
            metric(2, 0, 0.0),
            metric(2, 1, 40.0),
            // Next day's engine restarts its PnL at zero.
            metric(3, 2, 0.0),
            metric(3, 3, -15.0),
        ];
        let (path, boundaries) = stitch_pnl(&metrics);
        assert_eq!(path, vec![0.0, 40.0, 40.0, 25.0]);
        assert_eq!(boundaries, vec![2]);
        assert_eq!(max_drawdown(&path), 15.0);
    }

    #[test]
    fn sharpe_is_zero_for_degenerate_series() {
        assert_eq!(daily_sharpe(&[10.0]), 0.0);
        assert_eq!(daily_sharpe(&[10.0, 10.0, 10.0]), 0.0);
        assert!(daily_sharpe(&[10.0, -5.0, 12.0]).is_finite());
    }

    #[test]
    fn report_serializes_to_json() {
        let result = BacktestResult {
            strategy_name: "StraddleCycle_backtest".into(),
            portfolio_name: "backtest".into(),
            processed_timesteps: 2,
            final_pnl: 40.0,
            cumulative_fees: 0.7,
            ..BacktestResult::default()
        };
        let metrics = vec![metric(2, 0, 0.0), metric(2, 1, 40.0)];
        let report = build_report(
            &[("day1.parquet".into(), result)],
            &metrics,
            0.35,
            0.05,
            "mid",
            1.25,
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["result"]["net_pnl"], 39.3);
        assert_eq!(json["daily_results"][0]["file"], "day1.parquet");
        assert_eq!(json["chart_data"]["pnl"][1], 40.0);
    }
}
