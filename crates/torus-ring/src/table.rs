//! The replica-to-partition-to-device assignment matrix and move history.

use serde::{Deserialize, Serialize};

/// Assignment of partition replicas to device ids.
///
/// Row `r` maps partition `p` to the device holding replica `r` of `p`,
/// or `None` while the replica is unplaced. With a fractional replica
/// count `R`, rows `0..floor(R)` cover every partition and one extra
/// partial row covers the first `round(R * parts) - floor(R) * parts`
/// partitions, so the extra-replica set is deterministic.
///
/// Move history is kept per partition as the unix time of the last move;
/// `None` means the partition has never moved (or the history was reset)
/// and is immediately eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTable {
    rows: Vec<Vec<Option<u32>>>,
    last_moved: Vec<Option<u64>>,
    last_rebalance: Option<u64>,
}

impl AssignmentTable {
    /// Create an empty (fully unassigned) table.
    pub fn new(part_power: u32, replicas: f64) -> Self {
        let parts = 1u64 << part_power;
        let rows = row_lengths(replicas, parts)
            .into_iter()
            .map(|len| vec![None; len as usize])
            .collect();
        Self {
            rows,
            last_moved: vec![None; parts as usize],
            last_rebalance: None,
        }
    }

    /// Rebuild a table from raw rows, e.g. when recovering a builder from
    /// a ring artifact. Move history starts out empty.
    pub fn from_rows(rows: Vec<Vec<Option<u32>>>, parts: u64) -> Self {
        Self {
            rows,
            last_moved: vec![None; parts as usize],
            last_rebalance: None,
        }
    }

    /// Number of partitions.
    pub fn parts(&self) -> u64 {
        self.last_moved.len() as u64
    }

    /// The raw replica-major rows.
    pub fn rows(&self) -> &[Vec<Option<u32>>] {
        &self.rows
    }

    /// Total replica slots (the sum of row lengths).
    pub fn total_slots(&self) -> u64 {
        self.rows.iter().map(|r| r.len() as u64).sum()
    }

    /// Number of slots currently holding a device.
    pub fn assigned_count(&self) -> u64 {
        self.rows
            .iter()
            .map(|r| r.iter().filter(|s| s.is_some()).count() as u64)
            .sum()
    }

    /// Number of replicas (assigned or not) a partition carries.
    pub fn replicas_at(&self, part: u64) -> usize {
        self.rows
            .iter()
            .filter(|r| (part as usize) < r.len())
            .count()
    }

    /// The device holding a replica slot, if any.
    pub fn get(&self, replica: usize, part: u64) -> Option<u32> {
        *self.rows.get(replica)?.get(part as usize)?
    }

    pub(crate) fn set(&mut self, replica: usize, part: u64, dev: Option<u32>) {
        self.rows[replica][part as usize] = dev;
    }

    /// Every `(replica, partition, device)` slot, row-major.
    pub fn slots(&self) -> impl Iterator<Item = (usize, u64, Option<u32>)> {
        self.rows.iter().enumerate().flat_map(|(replica, row)| {
            row.iter()
                .enumerate()
                .map(move |(part, dev)| (replica, part as u64, *dev))
        })
    }

    /// Devices assigned to a partition, with their replica index.
    pub fn devices_for_part(&self, part: u64) -> impl Iterator<Item = (usize, u32)> {
        self.rows.iter().enumerate().filter_map(move |(replica, row)| {
            row.get(part as usize).copied().flatten().map(|d| (replica, d))
        })
    }

    /// May this partition be voluntarily moved at time `now`?
    pub fn movable(&self, part: u64, min_part_hours: u32, now: u64) -> bool {
        match self.last_moved[part as usize] {
            None => true,
            Some(at) => now.saturating_sub(at) >= u64::from(min_part_hours) * 3600,
        }
    }

    pub(crate) fn mark_moved(&mut self, part: u64, now: u64) {
        self.last_moved[part as usize] = Some(now);
    }

    pub(crate) fn record_rebalance(&mut self, now: u64) {
        self.last_rebalance = Some(now);
    }

    /// Unix time of the last rebalance that moved something.
    pub fn last_rebalance(&self) -> Option<u64> {
        self.last_rebalance
    }

    /// Forget all move history, making every partition immediately movable.
    pub fn reset_move_history(&mut self) {
        self.last_moved.fill(None);
        self.last_rebalance = None;
    }

    /// Resize the table for a new replica count.
    ///
    /// Shrinking drops the highest replica rows (and trims the partial
    /// row); the device ids dropped are returned so the caller can adjust
    /// per-device counts. Growing appends unassigned slots to be filled by
    /// the next rebalance.
    pub(crate) fn resize_replicas(&mut self, replicas: f64) -> Vec<u32> {
        let parts = self.parts();
        let lengths = row_lengths(replicas, parts);
        let mut dropped = Vec::new();

        while self.rows.len() > lengths.len() {
            if let Some(row) = self.rows.pop() {
                dropped.extend(row.into_iter().flatten());
            }
        }
        for (i, row) in self.rows.iter_mut().enumerate() {
            let target = lengths[i] as usize;
            if row.len() > target {
                dropped.extend(row.drain(target..).flatten());
            } else {
                row.resize(target, None);
            }
        }
        while self.rows.len() < lengths.len() {
            let len = lengths[self.rows.len()] as usize;
            self.rows.push(vec![None; len]);
        }
        dropped
    }
}

/// Row lengths for a (possibly fractional) replica count.
pub(crate) fn row_lengths(replicas: f64, parts: u64) -> Vec<u64> {
    let total = (replicas * parts as f64).round() as u64;
    let base = replicas.floor() as u64;
    let extra = total - base * parts;
    let mut lengths = vec![parts; base as usize];
    if extra > 0 {
        lengths.push(extra);
    }
    lengths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_lengths_whole_and_fractional() {
        assert_eq!(row_lengths(3.0, 64), vec![64, 64, 64]);
        // round(3.14159265359 * 64) = 201 -> 9 partitions get a 4th replica.
        assert_eq!(row_lengths(3.14159265359, 64), vec![64, 64, 64, 9]);
        // Sub-one replica counts are a single partial row.
        assert_eq!(row_lengths(0.5, 64), vec![32]);
    }

    #[test]
    fn test_new_table_is_unassigned() {
        let table = AssignmentTable::new(6, 3.0);
        assert_eq!(table.parts(), 64);
        assert_eq!(table.total_slots(), 192);
        assert_eq!(table.assigned_count(), 0);
        assert_eq!(table.replicas_at(0), 3);
    }

    #[test]
    fn test_fractional_replicas_extra_row_covers_low_partitions() {
        let table = AssignmentTable::new(6, 3.25);
        assert_eq!(table.total_slots(), 208);
        assert_eq!(table.replicas_at(0), 4);
        assert_eq!(table.replicas_at(15), 4);
        assert_eq!(table.replicas_at(16), 3);
    }

    #[test]
    fn test_resize_replicas_returns_dropped_devices() {
        let mut table = AssignmentTable::new(4, 2.0);
        for part in 0..16 {
            table.set(0, part, Some(0));
            table.set(1, part, Some(1));
        }
        let dropped = table.resize_replicas(1.5);
        // Row 1 shrank from 16 to 8 columns, all of them on device 1.
        assert_eq!(dropped.len(), 8);
        assert!(dropped.iter().all(|&d| d == 1));
        assert_eq!(table.total_slots(), 24);

        let dropped = table.resize_replicas(3.0);
        assert!(dropped.is_empty());
        assert_eq!(table.total_slots(), 48);
        // Re-grown slots are unassigned.
        assert_eq!(table.get(2, 0), None);
        assert_eq!(table.get(1, 8), None);
    }

    #[test]
    fn test_move_history_gating() {
        let mut table = AssignmentTable::new(4, 2.0);
        // Never moved: eligible immediately.
        assert!(table.movable(3, 24, 0));
        table.mark_moved(3, 1_000);
        assert!(!table.movable(3, 1, 1_000 + 3599));
        assert!(table.movable(3, 1, 1_000 + 3600));
        table.reset_move_history();
        assert!(table.movable(3, 24, 1_000));
    }
}
