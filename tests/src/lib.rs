//! Shared fixtures for Torus integration tests.
//!
//! Builds small rings from a terse topology description and drives
//! multi-pass rebalance convergence the way an operator cron job would:
//! rebalance, wait out the dwell time, rebalance again.

use torus_ring::{DeviceSpec, RebalanceReport, RebalanceStatus, RingBuilder};

/// Fixed starting point for test clocks, one hour past the epoch.
pub const T0: u64 = 3600;

/// One device per entry: `(region, zone, ip, name, weight)`.
pub type Topology = &'static [(u32, u32, &'static str, &'static str, f64)];

/// A builder populated from `topology`, not yet rebalanced.
pub fn builder_with(part_power: u32, replicas: f64, topology: Topology) -> RingBuilder {
    let mut builder = RingBuilder::new(part_power, replicas, 1).expect("valid builder params");
    add_devices(&mut builder, topology);
    builder
}

/// Add every device in `topology` to an existing builder.
pub fn add_devices(builder: &mut RingBuilder, topology: Topology) {
    for &(region, zone, ip, name, weight) in topology {
        builder
            .add_device(DeviceSpec {
                region,
                zone,
                ip: ip.to_string(),
                port: 6200,
                name: name.to_string(),
                weight,
                ..Default::default()
            })
            .expect("valid device");
    }
}

/// Rebalance repeatedly, pretending the dwell time passes between
/// passes, until the ring settles or `max_passes` runs out. Returns the
/// final pass's report.
pub fn converge(builder: &mut RingBuilder, seed: u64, max_passes: u32) -> RebalanceReport {
    let mut report = builder
        .rebalance_at(Some(seed), T0)
        .expect("rebalance must succeed");
    for pass in 1..max_passes {
        if report.status == RebalanceStatus::Balanced {
            break;
        }
        builder.pretend_min_part_hours_passed();
        report = builder
            .rebalance_at(Some(seed), T0 + u64::from(pass) * 3600)
            .expect("rebalance must succeed");
    }
    report
}

/// Panic if any partition has two replicas on one device.
pub fn assert_replicas_distinct(builder: &RingBuilder) {
    for part in 0..builder.parts() {
        let mut devs: Vec<u32> = builder
            .table()
            .devices_for_part(part)
            .map(|(_, id)| id)
            .collect();
        let total = devs.len();
        devs.sort_unstable();
        devs.dedup();
        assert_eq!(devs.len(), total, "partition {part} has duplicate devices");
    }
}
