//! Integration test: growing and draining a ring over many passes.
//!
//! Capacity changes never resolve in one pass: each partition moves at
//! most one replica per rebalance and then dwells. These tests drive the
//! cron-style loop and check that the ring converges instead of churning.

use torus_integration_tests::{T0, assert_replicas_distinct, add_devices, builder_with, converge};
use torus_ring::{BALANCE_TOLERANCE, RebalanceStatus, SearchCriteria};

const MACHINE_A: torus_integration_tests::Topology = &[
    (1, 1, "10.1.1.1", "sda", 100.0),
    (1, 1, "10.1.1.1", "sdb", 100.0),
    (1, 1, "10.1.1.1", "sdc", 100.0),
    (1, 1, "10.1.1.1", "sdd", 100.0),
];

const MACHINE_B: torus_integration_tests::Topology = &[
    (1, 2, "10.1.1.2", "sda", 100.0),
    (1, 2, "10.1.1.2", "sdb", 100.0),
    (1, 2, "10.1.1.2", "sdc", 100.0),
    (1, 2, "10.1.1.2", "sdd", 100.0),
];

#[test]
fn test_doubling_capacity_converges_gradually() {
    let mut builder = builder_with(8, 3.0, MACHINE_A);
    let first = converge(&mut builder, 21, 2);
    assert_eq!(first.status, RebalanceStatus::Balanced);

    add_devices(&mut builder, MACHINE_B);
    builder.pretend_min_part_hours_passed();

    // The first pass after doubling cannot finish the job: partitions it
    // moves are stamped, so roughly half the drain remains.
    let partial = builder.rebalance_at(Some(21), T0 + 3600).unwrap();
    assert_eq!(partial.status, RebalanceStatus::Partial);
    assert!(partial.parts_moved > 0);
    assert!(partial.balance > BALANCE_TOLERANCE);

    let done = converge(&mut builder, 21, 10);
    assert_eq!(done.status, RebalanceStatus::Balanced);
    assert!(done.balance < BALANCE_TOLERANCE);
    assert_replicas_distinct(&builder);
    builder.validate(true).unwrap();

    // Weight-proportional: the new machine carries about half the load.
    let new_load: u64 = (4..8)
        .map(|id| builder.devices().get(id).unwrap().parts)
        .sum();
    let total = builder.table().total_slots();
    assert!(
        (new_load as f64 - total as f64 / 2.0).abs() < total as f64 * 0.05,
        "new machine holds {new_load} of {total}"
    );
}

#[test]
fn test_drain_is_gated_by_dwell_time() {
    let mut builder = builder_with(8, 3.0, MACHINE_A);
    converge(&mut builder, 5, 2);
    add_devices(&mut builder, MACHINE_B);

    // The dwell time has not passed since the first rebalance stamped
    // every partition, so nothing voluntary may move.
    let gated = builder.rebalance_at(Some(5), T0 + 60).unwrap();
    assert_eq!(gated.status, RebalanceStatus::NoOp);
    assert_eq!(gated.parts_moved, 0);
    assert!(gated.deferred > 0);
}

#[test]
fn test_removed_device_drains_while_balance_recovers() {
    let mut builder = builder_with(8, 3.0, MACHINE_A);
    converge(&mut builder, 13, 2);
    add_devices(&mut builder, MACHINE_B);
    let settled = converge(&mut builder, 13, 10);
    assert_eq!(settled.status, RebalanceStatus::Balanced);
    let version_before = builder.version();

    builder
        .remove_device(&SearchCriteria {
            ip: Some("10.1.1.1".to_string()),
            name: Some("sda".to_string()),
            ..Default::default()
        })
        .unwrap();

    // Evacuation is mandatory and proceeds immediately even though the
    // dwell time has not passed since the last rebalance.
    builder.pretend_min_part_hours_passed();
    let report = converge(&mut builder, 13, 10);
    assert_eq!(report.status, RebalanceStatus::Balanced);
    assert!(builder.version() > version_before);
    assert!(
        builder
            .search(&SearchCriteria {
                name: Some("sda".to_string()),
                ..Default::default()
            })
            .iter()
            .all(|d| d.ip != "10.1.1.1"),
        "removed device must be finalized out of the registry"
    );
    assert_eq!(builder.table().assigned_count(), builder.table().total_slots());
    assert_replicas_distinct(&builder);
    builder.validate(true).unwrap();
}
