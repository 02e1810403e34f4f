//! Configuration Overlay Contract Tests
//!
//! Invariants of the layered configuration merge that scenario correctness
//! depends on: later patches always win on scalar conflicts, keys are never
//! deleted, lists replace wholesale, and the derived-parameter tables stay
//! total over their documented domain.

use lte_harness::config::tables;
use lte_harness::config::{get_str, overlay, overlay_at};
use lte_harness::HarnessError;
use serde_yaml::Value;

fn yaml(s: &str) -> Value {
    serde_yaml::from_str(s).unwrap()
}

/// Applying two patches sequentially equals applying their merge, for
/// non-overlapping keys.
#[test]
fn overlay_composes_for_disjoint_patches() {
    let base = yaml("{enb: {id: 0x19B}}");
    let p1 = yaml("{enb: {n_prb: 50}}");
    let p2 = yaml("{enb: {enable_pcap: true}}");

    let mut sequential = base.clone();
    overlay(&mut sequential, &p1);
    overlay(&mut sequential, &p2);

    let mut merged_patch = p1.clone();
    overlay(&mut merged_patch, &p2);
    let mut at_once = base;
    overlay(&mut at_once, &merged_patch);

    assert_eq!(sequential, at_once);
}

/// For overlapping scalar keys the later patch always wins, regardless of
/// the earlier one's value.
#[test]
fn later_patch_wins_on_scalar_conflict() {
    for earlier in ["warning", "debug", "none"] {
        let mut tree = yaml("{enb: {log_all_level: error}}");
        overlay(
            &mut tree,
            &yaml(&format!("{{enb: {{log_all_level: {}}}}}", earlier)),
        );
        overlay(&mut tree, &yaml("{enb: {log_all_level: info}}"));
        assert_eq!(get_str(&tree, &["enb", "log_all_level"]), Some("info"));
    }
}

/// Keys absent from the patch survive arbitrarily deep overlays.
#[test]
fn overlay_never_deletes_keys() {
    let mut tree = yaml("{epc: {mme: {mcc: 901, mnc: 70}, hss: {db: x}}}");
    overlay(&mut tree, &yaml("{epc: {mme: {mcc: 902}}}"));

    assert_eq!(
        tree,
        yaml("{epc: {mme: {mcc: 902, mnc: 70}, hss: {db: x}}}")
    );
}

/// Lists are values: a patched list replaces the base list wholesale, it is
/// never concatenated.
#[test]
fn lists_replace_wholesale() {
    let mut tree = yaml("{ue: {additional_args: [a, b, c]}}");
    overlay(&mut tree, &yaml("{ue: {additional_args: [d]}}"));
    assert_eq!(tree, yaml("{ue: {additional_args: [d]}}"));
}

/// overlay_at grafts computed values as the last layer, so they win over
/// every earlier source.
#[test]
fn computed_values_overlay_last_and_win() {
    let mut tree = yaml("{epc: {log_filename: /statically/configured.log}}");
    overlay_at(
        &mut tree,
        &["epc", "log_filename"],
        Value::String("/run/srsepc/srsepc.log".to_string()),
    );
    assert_eq!(
        get_str(&tree, &["epc", "log_filename"]),
        Some("/run/srsepc/srsepc.log")
    );
}

/// Derived-parameter lookups are total on their documented breakpoints and
/// monotonic between them.
#[test]
fn symbol_size_table_total_and_monotonic() {
    let mut last = 0u32;
    for prb in 1..=110u16 {
        let size = tables::num_prb_to_symbol_size(prb)
            .unwrap_or_else(|_| panic!("table not total at {} PRB", prb));
        assert!(size >= last);
        last = size;
    }
}

/// Inputs above the documented range fail, never silently clamp.
#[test]
fn out_of_range_prb_is_config_error_not_clamp() {
    for prb in [111u16, 150, 65535] {
        match tables::num_prb_to_symbol_size(prb) {
            Err(HarnessError::Config(_)) => {}
            Ok(size) => panic!("{} PRB silently clamped to symbol size {}", prb, size),
            Err(other) => panic!("unexpected error type {:?}", other),
        }
        assert!(tables::num_prb_to_bandwidth_mhz(prb).is_err());
        assert!(tables::num_prb_to_base_srate(prb).is_err());
    }
}

/// The documented breakpoint outputs themselves.
#[test]
fn documented_breakpoints() {
    assert_eq!(tables::num_prb_to_symbol_size(6).unwrap(), 128);
    assert_eq!(tables::num_prb_to_symbol_size(15).unwrap(), 256);
    assert_eq!(tables::num_prb_to_symbol_size(50).unwrap(), 768);
    assert_eq!(tables::num_prb_to_symbol_size(75).unwrap(), 1024);
    assert_eq!(tables::num_prb_to_symbol_size(110).unwrap(), 1536);

    assert_eq!(tables::num_prb_to_base_srate(6).unwrap(), 1_920_000);
    assert_eq!(tables::num_prb_to_base_srate(110).unwrap(), 23_040_000);
}

/// DRB mode to QoS class mapping, case-insensitive, closed domain.
#[test]
fn drb_mode_qci_mapping() {
    assert_eq!(tables::rlc_drb_mode_to_qci("UM").unwrap(), 7);
    assert_eq!(tables::rlc_drb_mode_to_qci("am").unwrap(), 9);
    assert!(matches!(
        tables::rlc_drb_mode_to_qci("TM"),
        Err(HarnessError::Config(_))
    ));
}
