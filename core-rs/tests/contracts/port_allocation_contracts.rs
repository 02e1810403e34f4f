//! Port Allocation Contract Tests
//!
//! The resource pool hands out RF port ranges to concurrently-configured
//! node instances. These invariants keep simulated radios from colliding:
//! ranges are exclusive, allocation is append-only for the lifetime of a
//! suite run, and exhaustion is an explicit error.

use lte_harness::resource::{PortLease, ResourcePool, DEFAULT_PORT_BASE, PORTS_PER_RADIO};
use lte_harness::HarnessError;

/// No two instances ever receive overlapping ranges.
#[test]
fn port_ranges_never_overlap() {
    let mut pool = ResourcePool::new();
    for i in 0..32 {
        pool.next_port_range(&format!("ue{}", i), PORTS_PER_RADIO)
            .unwrap();
    }

    let leases: &[PortLease] = pool.leases();
    for (i, a) in leases.iter().enumerate() {
        for b in &leases[i + 1..] {
            let a_end = a.base + a.count - 1;
            let b_end = b.base + b.count - 1;
            assert!(
                a_end < b.base || b_end < a.base,
                "{}..{} overlaps {}..{}",
                a.base,
                a_end,
                b.base,
                b_end
            );
        }
    }
}

/// Allocation is deterministic: the n-th request always lands on the same
/// base, so regenerated configs keep pointing at the same ports.
#[test]
fn allocation_is_deterministic() {
    let run = || {
        let mut pool = ResourcePool::new();
        (0..4)
            .map(|i| pool.next_port_range(&format!("ue{}", i), 4).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
    assert_eq!(run()[0], DEFAULT_PORT_BASE);
}

/// Append-only within one suite run: there is no release, and later
/// requests continue upward past every earlier lease.
#[test]
fn allocation_is_append_only() {
    let mut pool = ResourcePool::new();
    let first = pool.next_port_range("ue0", 4).unwrap();
    pool.next_port_range("ue1", 4).unwrap();
    let third = pool.next_port_range("ue2", 4).unwrap();

    assert_eq!(third, first + 8);
    assert_eq!(pool.leases().len(), 3);

    // Even an identically-named owner gets a fresh range, not a reuse.
    let again = pool.next_port_range("ue0", 4).unwrap();
    assert_eq!(again, first + 12);
    assert_eq!(pool.leases().len(), 4);
}

/// Exhaustion of the port space is an explicit error, never a wrap-around.
#[test]
fn exhaustion_is_explicit() {
    let mut pool = ResourcePool::with_base_port(u16::MAX - 7);
    pool.next_port_range("ue0", 8).unwrap();
    match pool.next_port_range("ue1", 1) {
        Err(HarnessError::PortUnavailable(_)) => {}
        other => panic!("expected PortUnavailable, got {:?}", other),
    }
}

/// Four contiguous ports per simulated radio: 2x carrier aggregation with
/// 2x2 MIMO.
#[test]
fn radio_instances_get_four_ports() {
    assert_eq!(PORTS_PER_RADIO, 4);
    let mut pool = ResourcePool::new();
    let base = pool.next_port_range("ue0", PORTS_PER_RADIO).unwrap();
    let lease = &pool.leases()[0];
    for port in base..base + PORTS_PER_RADIO {
        assert!(lease.contains(port));
    }
    assert!(!lease.contains(base + PORTS_PER_RADIO));
}
