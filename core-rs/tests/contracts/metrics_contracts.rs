//! Metrics Verification Contract Tests
//!
//! The CSV aggregation pipeline: component-carrier de-interleaving, the
//! rolling-average operations, and the comparison message format reports
//! rely on.

use lte_harness::metrics::{verify, Criterion, MetricsFile, Operation};
use lte_harness::HarnessError;

fn two_carriers(flat: &[f64]) -> MetricsFile {
    // Rows interleave carriers 0 and 1.
    let mut text = String::from("time;cc;dl_brate\n");
    for (i, v) in flat.iter().enumerate() {
        text.push_str(&format!("{};{};{}\n", i / 2, i % 2, v));
    }
    MetricsFile::parse(&text).unwrap()
}

fn one_carrier(values: &[f64]) -> MetricsFile {
    let mut text = String::from("time;cc;dl_brate\n");
    for (i, v) in values.iter().enumerate() {
        text.push_str(&format!("{};0;{}\n", i, v));
    }
    MetricsFile::parse(&text).unwrap()
}

/// Flat series [a0,b0,a1,b1] with carrier count 2 folds to
/// [a0+b0, a1+b1] per sampling instant.
#[test]
fn carrier_deinterleaving_concrete() {
    let m = two_carriers(&[10.0, 20.0, 30.0, 40.0]);
    assert_eq!(m.carrier_count(), 2);
    assert_eq!(m.series("dl_brate").unwrap(), vec![30.0, 70.0]);

    // avg of [30, 70] = 50 -> eq criterion against 50 holds.
    assert!(verify(&m, 50.0, Operation::Avg, "dl_brate", Criterion::Eq, 1).is_ok());
}

/// verify(value=50, avg, gt) succeeds over data averaging 60 and fails over
/// data averaging 40; the failure message carries the opposite operator.
#[test]
fn comparison_direction_and_failure_message() {
    let passing = one_carrier(&[60.0, 60.0]);
    assert!(verify(&passing, 50.0, Operation::Avg, "dl_brate", Criterion::Gt, 1).is_ok());

    let failing = one_carrier(&[40.0, 40.0]);
    let err = verify(&failing, 50.0, Operation::Avg, "dl_brate", Criterion::Gt, 1).unwrap_err();
    match err {
        HarnessError::MetricThreshold {
            actual,
            expected,
            msg,
        } => {
            assert_eq!(actual, 40.0);
            assert_eq!(expected, 50.0);
            assert!(msg.contains("<="), "expected opposite operator in {:?}", msg);
        }
        other => panic!("expected MetricThreshold, got {:?}", other),
    }
}

/// min_rolling_avg over [0,0,0,5,5,5] with window 3 trims the zero prefix
/// before windowing: no window containing only the trimmed zeros counts.
#[test]
fn min_rolling_avg_ignores_leading_zero_prefix() {
    let m = one_carrier(&[0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);
    let err = verify(&m, 6.0, Operation::MinRollingAvg, "dl_brate", Criterion::Gt, 3).unwrap_err();
    match err {
        HarnessError::MetricThreshold { actual, .. } => {
            // Without trimming this would be 0.0 from the startup gap.
            assert_eq!(actual, 5.0);
        }
        other => panic!("expected MetricThreshold, got {:?}", other),
    }
}

/// max_rolling_avg takes the maximum of the sliding-window moving average.
#[test]
fn max_rolling_avg_over_window() {
    let m = one_carrier(&[0.0, 10.0, 20.0, 30.0, 0.0]);
    // windows of 2: [5, 15, 25, 15] -> max 25
    let err = verify(&m, 25.0, Operation::MaxRollingAvg, "dl_brate", Criterion::Gt, 2).unwrap_err();
    match err {
        HarnessError::MetricThreshold { actual, .. } => assert_eq!(actual, 25.0),
        other => panic!("expected MetricThreshold, got {:?}", other),
    }
}

/// A metric name may be a +-joined sum of raw columns.
#[test]
fn plus_joined_metric_columns() {
    let m = MetricsFile::parse("cc;dl_brate;ul_brate\n0;30;10\n0;50;10\n").unwrap();
    // (30+10 + 50+10) / 2 = 50
    assert!(verify(&m, 50.0, Operation::Avg, "dl_brate+ul_brate", Criterion::Eq, 1).is_ok());
}

/// Bitrates are reported in Mbit/s, other metrics untouched.
#[test]
fn brate_normalization_in_messages() {
    let m = one_carrier(&[20e6, 20e6]);
    let msg = verify(&m, 10e6, Operation::Avg, "dl_brate", Criterion::Gt, 1).unwrap();
    assert_eq!(msg, "20.00 Mbit/s > 10.00 Mbit/s");

    let m = MetricsFile::parse("cc;nof_ko\n0;3\n0;5\n").unwrap();
    let msg = verify(&m, 10.0, Operation::Sum, "nof_ko", Criterion::Lt, 1).unwrap();
    assert_eq!(msg, "8.00 < 10.00");
}

/// Malformed CSV surfaces a Parse error, not a panic.
#[test]
fn malformed_csv_is_parse_error() {
    assert!(matches!(
        MetricsFile::parse(""),
        Err(HarnessError::Parse(_))
    ));
    assert!(matches!(
        MetricsFile::parse("a;b\n1\n"),
        Err(HarnessError::Parse(_))
    ));
    assert!(matches!(
        MetricsFile::parse("a;b\n1;x\n"),
        Err(HarnessError::Parse(_))
    ));
}

/// Unknown columns are reported by name.
#[test]
fn unknown_metric_reported_by_name() {
    let m = one_carrier(&[1.0]);
    match m.series("ul_phr") {
        Err(HarnessError::Parse(msg)) => assert!(msg.contains("ul_phr")),
        other => panic!("expected Parse error, got {:?}", other),
    }
}
