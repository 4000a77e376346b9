use super::types::{Statistics, Trajectory};

const P5: f64 = 0.05;
const P25: f64 = 0.25;
const P50: f64 = 0.50;
const P75: f64 = 0.75;
const P95: f64 = 0.95;

/// Linear interpolation between order statistics; `p` in [0, 1], `sorted` ascending.
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => return 0.0,
        1 => return sorted[0],
        _ => {}
    }

    let last = sorted.len() - 1;
    let rank = (last as f64 * p.clamp(0.0, 1.0)).clamp(0.0, last as f64);
    let lower = rank.floor() as usize;
    let upper = (rank.ceil() as usize).min(last);

    if lower == upper {
        sorted[lower]
    } else {
        let (a, b) = (sorted[lower], sorted[upper]);
        let w = rank - lower as f64;
        // a*(1-w) + b*w, written so rounding can't step outside [a, b].
        let value = a + (b - a) * w;
        if value < a {
            a
        } else if value > b {
            b
        } else {
            value
        }
    }
}

/// Mean and population standard deviation (divides by N).
pub(crate) fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    (mean, variance.max(0.0).sqrt())
}

/// Reduces trajectories to the per-year percentile ladder and terminal summaries.
/// Every trajectory must hold `year_count` entries.
pub(crate) fn summarize(paths: &[Trajectory], year_count: usize) -> Statistics {
    let mut percentile5 = Vec::with_capacity(year_count);
    let mut percentile25 = Vec::with_capacity(year_count);
    let mut percentile50 = Vec::with_capacity(year_count);
    let mut percentile75 = Vec::with_capacity(year_count);
    let mut percentile95 = Vec::with_capacity(year_count);
    let mut standard_deviation = Vec::with_capacity(year_count);

    let mut column = Vec::with_capacity(paths.len());
    for year in 0..year_count {
        column.clear();
        column.extend(paths.iter().map(|path| path[year]));
        column.sort_by(|a, b| a.total_cmp(b));

        percentile5.push(percentile(&column, P5));
        percentile25.push(percentile(&column, P25));
        percentile50.push(percentile(&column, P50));
        percentile75.push(percentile(&column, P75));
        percentile95.push(percentile(&column, P95));
        standard_deviation.push(mean_and_std(&column).1);
    }

    let terminal: Vec<f64> = paths
        .iter()
        .map(|path| path.last().copied().unwrap_or(0.0))
        .collect();
    let survivors = terminal.iter().filter(|v| **v > 0.0).count();
    let success_probability = if paths.is_empty() {
        0.0
    } else {
        survivors as f64 / paths.len() as f64
    };

    let (average_return, terminal_std) = mean_and_std(&terminal);
    let volatility_realized = if average_return > 0.0 {
        terminal_std / average_return
    } else {
        0.0
    };

    Statistics {
        percentile5,
        percentile25,
        percentile50,
        percentile75,
        percentile95,
        success_probability,
        standard_deviation,
        average_return,
        volatility_realized,
    }
}

/// First year holding a NaN or infinity anywhere in the reduced output.
pub(crate) fn first_non_finite_year(statistics: &Statistics) -> Option<usize> {
    let ladders = [
        &statistics.percentile5,
        &statistics.percentile25,
        &statistics.percentile50,
        &statistics.percentile75,
        &statistics.percentile95,
        &statistics.standard_deviation,
    ];
    let year = ladders
        .iter()
        .filter_map(|ladder| ladder.iter().position(|v| !v.is_finite()))
        .min();
    if year.is_some() {
        return year;
    }
    if !statistics.average_return.is_finite() || !statistics.volatility_realized.is_finite() {
        return Some(statistics.percentile50.len().saturating_sub(1));
    }
    None
}
