//! Integration test: the full operator lifecycle through on-disk files.
//!
//! create → add → rebalance → write ring → mutate → freshness →
//! recover a lost builder from the ring.

use torus_integration_tests::{T0, assert_replicas_distinct, builder_with, converge};
use torus_ring::{RebalanceStatus, SearchCriteria};
use torus_store::{
    RingFreshness, builder_from_ring, load_builder, load_ring, ring_freshness, save_builder,
    write_ring,
};

const FOUR_ZONES: torus_integration_tests::Topology = &[
    (1, 1, "10.0.0.1", "sda1", 100.0),
    (1, 2, "10.0.0.2", "sda1", 100.0),
    (1, 3, "10.0.0.3", "sda1", 100.0),
    (1, 4, "10.0.0.4", "sda1", 100.0),
];

#[test]
fn test_builder_and_ring_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let builder_path = dir.path().join("object.builder");
    let ring_path = dir.path().join("object.ring");

    let mut builder = builder_with(6, 3.0, FOUR_ZONES);
    save_builder(&builder, &builder_path).unwrap();

    // Reload and rebalance as a separate "invocation".
    let mut builder2 = load_builder(&builder_path).unwrap();
    let report = builder2.rebalance_at(Some(7), T0).unwrap();
    assert_eq!(report.status, RebalanceStatus::Balanced);
    assert_replicas_distinct(&builder2);
    save_builder(&builder2, &builder_path).unwrap();
    write_ring(&builder2, &ring_path).unwrap();

    assert_eq!(
        ring_freshness(&builder2, &ring_path),
        RingFreshness::UpToDate
    );

    // A weight change makes the on-disk ring obsolete without any
    // rebalance having happened.
    builder = load_builder(&builder_path).unwrap();
    builder
        .set_weight(
            &SearchCriteria {
                id: Some(1),
                ..Default::default()
            },
            200.0,
        )
        .unwrap();
    assert_eq!(ring_freshness(&builder, &ring_path), RingFreshness::Obsolete);

    // Rebalancing to the new weights and rewriting catches the ring up.
    converge(&mut builder, 7, 8);
    write_ring(&builder, &ring_path).unwrap();
    assert_eq!(ring_freshness(&builder, &ring_path), RingFreshness::UpToDate);

    let heavy = builder.devices().get(1).unwrap();
    let light = builder.devices().get(0).unwrap();
    assert!(
        heavy.parts > light.parts,
        "double weight must attract more partitions ({} vs {})",
        heavy.parts,
        light.parts
    );
}

#[test]
fn test_lost_builder_recovered_from_ring() {
    let dir = tempfile::tempdir().unwrap();
    let ring_path = dir.path().join("object.ring");

    let mut builder = builder_with(6, 3.0, FOUR_ZONES);
    builder.rebalance_at(Some(3), T0).unwrap();
    write_ring(&builder, &ring_path).unwrap();

    // The builder file is gone; reconstruct from the ring.
    let artifact = load_ring(&ring_path).unwrap();
    let recovered = builder_from_ring(&artifact, 1).unwrap();
    assert_eq!(recovered.parts(), builder.parts());
    assert_eq!(recovered.replicas(), builder.replicas());
    assert_eq!(recovered.version(), builder.version());
    assert_eq!(recovered.table().rows(), builder.table().rows());
    recovered.validate(true).unwrap();

    // The recovery loses move history, so the recovered builder can keep
    // operating immediately.
    let mut recovered = recovered;
    recovered
        .remove_device(&SearchCriteria {
            id: Some(2),
            ..Default::default()
        })
        .unwrap();
    let report = converge(&mut recovered, 3, 8);
    assert_eq!(report.status, RebalanceStatus::Balanced);
    assert!(recovered.devices().get(2).is_none());
    assert_eq!(recovered.table().assigned_count(), 192);
    assert_replicas_distinct(&recovered);
}
