//! Structural consistency checks over a builder.

use std::collections::HashMap;

use crate::analysis::BALANCE_TOLERANCE;
use crate::builder::RingBuilder;
use crate::error::RingError;
use crate::table::row_lengths;

impl RingBuilder {
    /// Check the builder's internal consistency.
    ///
    /// Verifies that every assignment references a known device, that no
    /// partition has two replicas on one device, that the table's row
    /// shape matches the replica count, and that each device's cached
    /// replica count agrees with the table. With `strict`, additionally
    /// fails if any weighted device's balance exceeds the tolerance that
    /// its overload factor does not excuse.
    ///
    /// A freshly created builder with no assignments passes: empty slots
    /// are legal until the first rebalance.
    pub fn validate(&self, strict: bool) -> Result<(), RingError> {
        let expected_rows = row_lengths(self.replicas(), self.parts());
        let rows = self.table().rows();
        if rows.len() != expected_rows.len() {
            return Err(RingError::PartsCountMismatch {
                device: None,
                expected: expected_rows.len() as u64,
                found: rows.len() as u64,
            });
        }
        for (row, &len) in rows.iter().zip(&expected_rows) {
            if row.len() as u64 != len {
                return Err(RingError::PartsCountMismatch {
                    device: None,
                    expected: len,
                    found: row.len() as u64,
                });
            }
        }

        let mut counted: HashMap<u32, u64> = HashMap::new();
        for part in 0..self.parts() {
            let mut seen: Vec<u32> = Vec::new();
            for (replica, id) in self.table().devices_for_part(part) {
                if self.devices().get(id).is_none() {
                    return Err(RingError::StructuralCorruption {
                        replica,
                        partition: part,
                        device: id,
                    });
                }
                if seen.contains(&id) {
                    return Err(RingError::DuplicateReplicaPlacement {
                        partition: part,
                        device: id,
                    });
                }
                seen.push(id);
                *counted.entry(id).or_default() += 1;
            }
        }

        for dev in self.devices().iter() {
            let found = counted.get(&dev.id).copied().unwrap_or(0);
            if dev.parts != found {
                return Err(RingError::PartsCountMismatch {
                    device: Some(dev.id),
                    expected: dev.parts,
                    found,
                });
            }
        }

        if strict && self.table().assigned_count() > 0 {
            for dev in self.devices().active().filter(|d| d.weight > 0.0) {
                let balance = self.device_balance(dev.id);
                let tolerance = BALANCE_TOLERANCE.max(self.overload() * 100.0);
                if balance.abs() > tolerance {
                    return Err(RingError::BalanceOutOfTolerance {
                        device: dev.id,
                        balance,
                        tolerance,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;

    fn populated() -> RingBuilder {
        let mut builder = RingBuilder::new(5, 3.0, 1).unwrap();
        for i in 0..4u32 {
            builder
                .add_device(DeviceSpec {
                    region: 0,
                    zone: i,
                    ip: format!("10.0.0.{}", i + 1),
                    port: 6200,
                    name: "sda1".to_string(),
                    weight: 100.0,
                    ..Default::default()
                })
                .unwrap();
        }
        builder.rebalance_at(Some(1), 3600).unwrap();
        builder
    }

    #[test]
    fn test_valid_builder_passes_strict() {
        let builder = populated();
        builder.validate(true).unwrap();
    }

    #[test]
    fn test_dangling_device_reference_is_corruption() {
        let mut builder = populated();
        builder.table.set(0, 7, Some(99));
        assert!(matches!(
            builder.validate(false),
            Err(RingError::StructuralCorruption { partition: 7, device: 99, .. })
        ));
    }

    #[test]
    fn test_duplicate_replica_placement_is_detected() {
        let mut builder = populated();
        let keep = builder.table.get(0, 3).unwrap();
        builder.table.set(1, 3, Some(keep));
        assert!(matches!(
            builder.validate(false),
            Err(RingError::DuplicateReplicaPlacement { partition: 3, device } )
                if device == keep
        ));
    }

    #[test]
    fn test_stale_device_count_is_detected() {
        let mut builder = populated();
        builder.devices.get_mut(0).unwrap().parts += 1;
        assert!(matches!(
            builder.validate(false),
            Err(RingError::PartsCountMismatch { device: Some(0), .. })
        ));
    }

    #[test]
    fn test_strict_flags_lopsided_placement() {
        let mut builder = populated();
        // Swap enough replicas onto device 0 to push it past tolerance.
        let mut stolen = 0;
        for part in 0..builder.parts() {
            if stolen >= 8 {
                break;
            }
            let devs: Vec<Option<u32>> =
                (0..3).map(|r| builder.table.get(r, part)).collect();
            if devs.contains(&Some(0)) {
                continue;
            }
            let old = devs[0].unwrap();
            builder.table.set(0, part, Some(0));
            builder.devices.get_mut(old).unwrap().parts -= 1;
            builder.devices.get_mut(0).unwrap().parts += 1;
            stolen += 1;
        }
        builder.validate(false).unwrap();
        assert!(matches!(
            builder.validate(true),
            Err(RingError::BalanceOutOfTolerance { .. })
        ));
    }
}
