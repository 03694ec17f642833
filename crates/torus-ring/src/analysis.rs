//! Balance and dispersion scoring.

use std::collections::{BTreeMap, BTreeSet};

use crate::builder::RingBuilder;
use crate::device::DeviceRegistry;
use crate::table::AssignmentTable;

/// Balance above this is reported as incomplete ("rebalance again later").
pub const BALANCE_TOLERANCE: f64 = 5.0;

/// Sentinel balance for a device holding replicas it has no weight for.
pub const MAX_BALANCE: f64 = 999.99;

/// Dispersion summary produced by [`RingBuilder::dispersion_report`].
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionReport {
    /// Percentage of assigned replicas that share a failure domain beyond
    /// the minimum unavoidable.
    pub score: f64,
    /// Replica slots currently assigned.
    pub assigned: u64,
    /// Partitions with at least one violating replica, with the violation
    /// count, worst first.
    pub violations: Vec<(u64, usize)>,
}

/// Failure-domain counts over devices that can actually hold data.
pub(crate) struct DomainCounts {
    pub regions: usize,
    pub zones: usize,
}

impl DomainCounts {
    pub(crate) fn new(devices: &DeviceRegistry) -> Self {
        let mut regions = BTreeSet::new();
        let mut zones = BTreeSet::new();
        for dev in devices.active().filter(|d| d.weight > 0.0) {
            regions.insert(dev.region);
            zones.insert((dev.region, dev.zone));
        }
        Self {
            regions: regions.len(),
            zones: zones.len(),
        }
    }
}

/// Replica indices of `part` that share a failure domain beyond the
/// minimum unavoidable, region tier first.
///
/// At each tier a domain may hold at most `ceil(n / domains)` of the
/// partition's `n` replicas; the excess (highest replica indices) are the
/// violators. Zone-tier checks skip replicas already flagged at the
/// region tier so each violator is counted once.
pub(crate) fn violations_for_part(
    table: &AssignmentTable,
    devices: &DeviceRegistry,
    part: u64,
    domains: &DomainCounts,
) -> Vec<usize> {
    let assigned: Vec<(usize, u32, u32)> = table
        .devices_for_part(part)
        .filter_map(|(replica, id)| devices.get(id).map(|d| (replica, d.region, d.zone)))
        .collect();
    let n = assigned.len();
    if n < 2 {
        return Vec::new();
    }

    let mut violating = Vec::new();

    let allowed_regions = n.div_ceil(domains.regions.max(1));
    let mut by_region: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for &(replica, region, _) in &assigned {
        by_region.entry(region).or_default().push(replica);
    }
    for group in by_region.values() {
        violating.extend(&group[group.len().min(allowed_regions)..]);
    }

    let allowed_zones = n.div_ceil(domains.zones.max(1));
    let mut by_zone: BTreeMap<(u32, u32), Vec<usize>> = BTreeMap::new();
    for &(replica, region, zone) in &assigned {
        if !violating.contains(&replica) {
            by_zone.entry((region, zone)).or_default().push(replica);
        }
    }
    for group in by_zone.values() {
        violating.extend(&group[group.len().min(allowed_zones)..]);
    }

    violating.sort_unstable();
    violating
}

impl RingBuilder {
    /// Signed balance percentage of one device: how far its assigned
    /// replica count is from its ideal share.
    pub fn device_balance(&self, id: u32) -> f64 {
        let Some(dev) = self.devices.get(id) else {
            return 0.0;
        };
        let total_weight = self.devices.total_weight();
        let ideal = if total_weight > 0.0 && !dev.pending_removal {
            dev.weight * self.table.total_slots() as f64 / total_weight
        } else {
            0.0
        };
        if ideal > 0.0 {
            100.0 * (dev.parts as f64 - ideal) / ideal
        } else if dev.parts > 0 {
            MAX_BALANCE
        } else {
            0.0
        }
    }

    /// Ring balance: the maximum absolute device balance across active
    /// devices. 0 for a ring with no devices.
    pub fn balance(&self) -> f64 {
        self.devices
            .active()
            .map(|d| self.device_balance(d.id).abs())
            .fold(0.0, f64::max)
    }

    /// True when total weight exceeds the total replica slots, i.e. one
    /// unit of weight corresponds to less than one partition replica and
    /// exact proportional placement is structurally impossible. Advisory.
    pub fn at_risk(&self) -> bool {
        self.devices.total_weight() > self.table.total_slots() as f64
    }

    /// Compute the dispersion score and the per-partition violation list.
    ///
    /// This is a full scan; rebalance caches the score on the builder and
    /// registry mutations invalidate it.
    pub fn dispersion_report(&self) -> DispersionReport {
        let domains = DomainCounts::new(&self.devices);
        let assigned = self.table.assigned_count();
        let mut violations = Vec::new();
        let mut violating_replicas = 0u64;
        for part in 0..self.parts() {
            let bad = violations_for_part(&self.table, &self.devices, part, &domains);
            if !bad.is_empty() {
                violating_replicas += bad.len() as u64;
                violations.push((part, bad.len()));
            }
        }
        violations.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let score = if assigned > 0 {
            100.0 * violating_replicas as f64 / assigned as f64
        } else {
            0.0
        };
        DispersionReport {
            score,
            assigned,
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;

    fn dev(region: u32, zone: u32, ip: &str, weight: f64) -> DeviceSpec {
        DeviceSpec {
            region,
            zone,
            ip: ip.to_string(),
            port: 6200,
            name: "sda".to_string(),
            weight,
            ..Default::default()
        }
    }

    #[test]
    fn test_balance_before_any_rebalance_is_pegged() {
        let mut builder = RingBuilder::new(4, 3.0, 1).unwrap();
        builder.add_device(dev(0, 0, "10.0.0.1", 100.0)).unwrap();
        builder.add_device(dev(0, 1, "10.0.0.2", 100.0)).unwrap();
        // Every device is at -100% of its ideal share.
        assert_eq!(builder.balance(), 100.0);
    }

    #[test]
    fn test_balance_near_zero_when_even() {
        let mut builder = RingBuilder::new(6, 3.0, 1).unwrap();
        for i in 0..4u32 {
            builder
                .add_device(dev(0, i, &format!("10.0.0.{}", i + 1), 100.0))
                .unwrap();
        }
        builder.rebalance_at(Some(7), 10_000).unwrap();
        assert!(builder.balance() < 1.0, "balance {}", builder.balance());
    }

    #[test]
    fn test_device_with_no_weight_but_parts_reports_max_balance() {
        let mut builder = RingBuilder::new(4, 2.0, 1).unwrap();
        builder.add_device(dev(0, 0, "10.0.0.1", 100.0)).unwrap();
        builder.add_device(dev(0, 1, "10.0.0.2", 100.0)).unwrap();
        builder.rebalance_at(Some(1), 10_000).unwrap();
        builder
            .set_weight(
                &crate::SearchCriteria {
                    id: Some(0),
                    ..Default::default()
                },
                0.0,
            )
            .unwrap();
        assert_eq!(builder.device_balance(0), MAX_BALANCE);
    }

    #[test]
    fn test_at_risk_when_weight_exceeds_slots() {
        // 2^4 parts * 3 replicas = 48 slots, 310 units of weight.
        let mut builder = RingBuilder::new(4, 3.0, 1).unwrap();
        builder.add_device(dev(0, 0, "10.0.0.1", 100.0)).unwrap();
        builder.add_device(dev(0, 1, "10.0.0.2", 100.0)).unwrap();
        builder.add_device(dev(0, 2, "10.0.0.3", 100.0)).unwrap();
        builder.add_device(dev(0, 3, "10.0.0.4", 10.0)).unwrap();
        assert!(builder.at_risk());

        // With 2^10 parts there is plenty of granularity.
        let mut ok = RingBuilder::new(10, 3.0, 1).unwrap();
        ok.add_device(dev(0, 0, "10.0.0.1", 100.0)).unwrap();
        ok.add_device(dev(0, 1, "10.0.0.2", 100.0)).unwrap();
        ok.add_device(dev(0, 2, "10.0.0.3", 110.0)).unwrap();
        assert!(!ok.at_risk());
    }

    #[test]
    fn test_dispersion_zero_when_domains_suffice() {
        let mut builder = RingBuilder::new(4, 2.0, 1).unwrap();
        builder.add_device(dev(0, 0, "10.0.0.1", 100.0)).unwrap();
        builder.add_device(dev(0, 0, "10.0.0.2", 100.0)).unwrap();
        builder.add_device(dev(0, 1, "10.0.0.3", 100.0)).unwrap();
        builder.add_device(dev(0, 1, "10.0.0.4", 100.0)).unwrap();
        builder.rebalance_at(Some(3), 10_000).unwrap();

        let report = builder.dispersion_report();
        assert_eq!(report.score, 0.0);
        assert!(report.violations.is_empty());
        // And no partition has both replicas in one zone.
        for part in 0..builder.parts() {
            let zones: Vec<u32> = builder
                .table()
                .devices_for_part(part)
                .map(|(_, id)| builder.devices().get(id).unwrap().zone)
                .collect();
            assert_eq!(zones.len(), 2);
            assert_ne!(zones[0], zones[1], "partition {part} undispersed");
        }
    }

    #[test]
    fn test_single_zone_sharing_is_unavoidable_not_violating() {
        let mut builder = RingBuilder::new(4, 3.0, 1).unwrap();
        for i in 0..4u32 {
            builder
                .add_device(dev(0, 0, &format!("10.0.0.{}", i + 1), 100.0))
                .unwrap();
        }
        builder.rebalance_at(Some(1), 10_000).unwrap();
        assert_eq!(builder.dispersion_report().score, 0.0);
    }
}
