//! CSV metrics verification
//!
//! Metrics files are `;`-delimited with a header row naming the columns and
//! one row per sampling interval per component carrier; the `cc` column
//! carries the carrier index. Rate metrics recorded per carrier are folded
//! into one value per sampling instant before aggregation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::errors::{HarnessError, Result};

pub const DELIMITER: char = ';';

/// Column identifying the component carrier of a row.
const CARRIER_COLUMN: &str = "cc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Avg,
    Sum,
    MaxRollingAvg,
    MinRollingAvg,
}

impl FromStr for Operation {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "avg" => Ok(Operation::Avg),
            "sum" => Ok(Operation::Sum),
            "max_rolling_avg" => Ok(Operation::MaxRollingAvg),
            "min_rolling_avg" => Ok(Operation::MinRollingAvg),
            other => Err(HarnessError::Config(format!(
                "unknown operation {} not in [avg, sum, max_rolling_avg, min_rolling_avg]",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criterion {
    Eq,
    Gt,
    Lt,
}

impl Criterion {
    pub fn sym(self) -> &'static str {
        match self {
            Criterion::Eq => "==",
            Criterion::Gt => ">",
            Criterion::Lt => "<",
        }
    }

    /// Symbol of the comparison that held instead, used in failure messages.
    pub fn opposite_sym(self) -> &'static str {
        match self {
            Criterion::Eq => "!=",
            Criterion::Gt => "<=",
            Criterion::Lt => ">=",
        }
    }

    pub fn holds(self, result: f64, value: f64) -> bool {
        match self {
            Criterion::Eq => result == value,
            Criterion::Gt => result > value,
            Criterion::Lt => result < value,
        }
    }
}

impl FromStr for Criterion {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq" => Ok(Criterion::Eq),
            "gt" => Ok(Criterion::Gt),
            "lt" => Ok(Criterion::Lt),
            other => Err(HarnessError::Config(format!(
                "unknown criterion {} not in [eq, gt, lt]",
                other
            ))),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sym())
    }
}

/// Parsed metrics table.
#[derive(Debug, Clone)]
pub struct MetricsFile {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl MetricsFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Parse(format!(
                "error reading metrics CSV file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| HarnessError::Parse("metrics CSV is empty".to_string()))?;
        let columns: Vec<String> = header
            .split(DELIMITER)
            .map(|c| c.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let fields: Vec<&str> = line.split(DELIMITER).collect();
            if fields.len() != columns.len() {
                return Err(HarnessError::Parse(format!(
                    "metrics CSV row {} has {} fields, header has {}",
                    lineno + 2,
                    fields.len(),
                    columns.len()
                )));
            }
            let row = fields
                .iter()
                .map(|f| {
                    f.trim().parse::<f64>().map_err(|_| {
                        HarnessError::Parse(format!(
                            "metrics CSV row {}: not a number: {:?}",
                            lineno + 2,
                            f
                        ))
                    })
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push(row);
        }
        Ok(MetricsFile { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| HarnessError::Parse(format!("metric {} not available", name)))?;
        Ok(self.rows.iter().map(|r| r[idx]).collect())
    }

    /// Number of component carriers: 1 + the highest index seen in the
    /// carrier column, or 1 when the table has no carrier column.
    pub fn carrier_count(&self) -> usize {
        match self.column(CARRIER_COLUMN) {
            Ok(cc) => cc.iter().fold(0.0f64, |a, &b| a.max(b)) as usize + 1,
            Err(_) => 1,
        }
    }

    /// Flat per-row series for a metric, folded per sampling instant across
    /// component carriers. A metric name may be a `+`-joined sum of several
    /// raw columns.
    pub fn series(&self, metric: &str) -> Result<Vec<f64>> {
        let mut selected: Vec<f64> = Vec::new();
        for name in metric.split('+') {
            let column = self.column(name.trim())?;
            if selected.is_empty() {
                selected = column;
            } else {
                for (acc, val) in selected.iter_mut().zip(column) {
                    *acc += val;
                }
            }
        }

        let num_cc = self.carrier_count();
        if num_cc <= 1 {
            return Ok(selected);
        }
        // Rows interleave carriers: fold every num_cc-th row starting at
        // offset c, for each carrier c, into one value per instant.
        let instants = selected.len() / num_cc;
        let mut folded = vec![0.0; instants];
        for (i, item) in folded.iter_mut().enumerate() {
            for c in 0..num_cc {
                *item += selected[i * num_cc + c];
            }
        }
        Ok(folded)
    }
}

fn moving_average(series: &[f64], window: usize) -> Result<Vec<f64>> {
    if window == 0 {
        return Err(HarnessError::Config(
            "rolling average window must be >= 1".to_string(),
        ));
    }
    if series.len() < window {
        return Err(HarnessError::Config(format!(
            "rolling average window {} larger than series of {} samples",
            window,
            series.len()
        )));
    }
    Ok(series
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect())
}

/// Aggregate `metric` over the table with `operation`, compare against
/// `value` with `criterion` and return the human-readable comparison. On
/// failure the error message carries the opposite comparison operator with
/// both values; rates (metric names containing "brate") are normalized to
/// Mbit/s.
pub fn verify(
    metrics: &MetricsFile,
    value: f64,
    operation: Operation,
    metric: &str,
    criterion: Criterion,
    window: usize,
) -> Result<String> {
    let series = metrics.series(metric)?;
    if series.is_empty() {
        return Err(HarnessError::Parse(format!(
            "no samples for metric {}",
            metric
        )));
    }

    let result = match operation {
        Operation::Avg => series.iter().sum::<f64>() / series.len() as f64,
        Operation::Sum => series.iter().sum(),
        Operation::MaxRollingAvg => moving_average(&series, window)?
            .into_iter()
            .fold(f64::MIN, f64::max),
        Operation::MinRollingAvg => {
            // Trim leading zeros so a slow attach does not fake a minimum.
            let first_nonzero = series.iter().position(|&v| v != 0.0).ok_or_else(|| {
                HarnessError::Parse(format!("metric {} has only zero samples", metric))
            })?;
            moving_average(&series[first_nonzero..], window)?
                .into_iter()
                .fold(f64::MAX, f64::min)
        }
    };

    let success = criterion.holds(result, value);

    // Convert bitrates to Mbit/s for the report.
    let (shown_result, shown_value, unit) = if metric.contains("brate") {
        (result / 1e6, value / 1e6, " Mbit/s")
    } else {
        (result, value, "")
    };

    if !success {
        let msg = format!(
            "{:.2}{} {} {:.2}{}",
            shown_result,
            unit,
            criterion.opposite_sym(),
            shown_value,
            unit
        );
        return Err(HarnessError::MetricThreshold {
            actual: result,
            expected: value,
            msg,
        });
    }
    Ok(format!(
        "{:.2}{} {} {:.2}{}",
        shown_result,
        unit,
        criterion.sym(),
        shown_value,
        unit
    ))
}
