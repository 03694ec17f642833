//! The rebalance engine: gathering replicas that must move and finding
//! them new homes.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::analysis::{BALANCE_TOLERANCE, DomainCounts, violations_for_part};
use crate::builder::{RingBuilder, unix_now};
use crate::error::RingError;

/// How a rebalance pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceStatus {
    /// Every gathered replica found a home and balance is within tolerance.
    Balanced,
    /// Moves were deferred or left unplaced, or balance is still above
    /// tolerance; the caller should rebalance again once the dwell time
    /// has passed.
    Partial,
    /// Nothing changed: no replica needed to move, or every voluntary
    /// candidate was deferred or kept its seat.
    NoOp,
}

/// Result of one rebalance pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceReport {
    /// Outcome classification.
    pub status: RebalanceStatus,
    /// Replica slots whose device changed this pass.
    pub parts_moved: u64,
    /// Voluntary moves skipped because of the dwell time, the
    /// one-move-per-partition rule, or the lack of an eligible home this
    /// pass; the replica keeps its current seat.
    pub deferred: u64,
    /// Evacuated or unassigned replicas that found no eligible device and
    /// were left unassigned.
    pub unplaced: u64,
    /// Forced placements onto devices already past their overload cap.
    pub overloaded: u64,
    /// Ring balance after the pass.
    pub balance: f64,
}

/// A replica slot gathered for reassignment.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    replica: usize,
    part: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveClass {
    /// Evacuations and unassigned slots; never deferred, may overload.
    Mandatory,
    /// Failure-domain violations; only moved if the new home is strictly
    /// better dispersed.
    Dispersion,
    /// Sheds from overweighted devices.
    Weight,
}

impl RingBuilder {
    /// Rebalance using the wall clock. See [`RingBuilder::rebalance_at`].
    pub fn rebalance(&mut self, seed: Option<u64>) -> Result<RebalanceReport, RingError> {
        self.rebalance_at(seed, unix_now())
    }

    /// Recompute partition placement at time `now` (unix seconds).
    ///
    /// Given identical builder state, the same `seed` and the same `now`,
    /// the resulting assignment table is bit-identical. A `None` seed
    /// draws one at random.
    pub fn rebalance_at(
        &mut self,
        seed: Option<u64>,
        now: u64,
    ) -> Result<RebalanceReport, RingError> {
        let total_slots = self.table.total_slots();
        let total_weight = self.devices.total_weight();
        let usable = self.devices.active().filter(|d| d.weight > 0.0).count();
        if usable == 0 || (total_weight <= 0.0 && total_slots > 0) {
            return Err(RingError::NoDevices);
        }
        let needed = self.replicas.ceil() as usize;
        if usable < needed {
            return Err(RingError::TooFewDevicesForReplicas {
                needed,
                available: usable,
                replicas: self.replicas,
            });
        }

        let seed = seed.unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);
        debug!(seed, now, total_slots, total_weight, "rebalance pass start");

        let weight_of_one_part = total_slots as f64 / total_weight;
        self.update_parts_wanted(weight_of_one_part);

        let (mut mandatory, mut dispersion, mut weight, mut deferred) =
            self.gather(now, weight_of_one_part, &mut rng);
        mandatory.shuffle(&mut rng);
        dispersion.shuffle(&mut rng);
        weight.shuffle(&mut rng);

        let mut parts_moved = 0u64;
        let mut unplaced = 0u64;
        let mut overloaded = 0u64;
        let mut moved_this_pass: HashSet<u64> = HashSet::new();

        let classes = [
            (MoveClass::Mandatory, mandatory),
            (MoveClass::Dispersion, dispersion),
            (MoveClass::Weight, weight),
        ];
        for (class, candidates) in classes {
            for cand in candidates {
                // One voluntary move per partition per pass: once a replica
                // of this partition has moved, the partition is stamped.
                if class != MoveClass::Mandatory && moved_this_pass.contains(&cand.part) {
                    deferred += 1;
                    continue;
                }
                match self.place(cand, class, weight_of_one_part, &mut rng) {
                    Placement::Moved { overload } => {
                        parts_moved += 1;
                        if overload {
                            overloaded += 1;
                        }
                        self.table.mark_moved(cand.part, now);
                        moved_this_pass.insert(cand.part);
                    }
                    // Only class-1 replicas can end up homeless; a
                    // voluntary candidate without an eligible target keeps
                    // its seat and is retried on a later pass.
                    Placement::NoHome if class == MoveClass::Mandatory => unplaced += 1,
                    Placement::NoHome => deferred += 1,
                    Placement::Kept => {}
                }
            }
        }

        let finalized = self.finalize_removed();
        let changed = parts_moved > 0 || !finalized.is_empty();
        if changed {
            self.version += 1;
            self.table.record_rebalance(now);
        }

        let balance = self.balance();
        let report_dispersion = self.dispersion_report().score;
        self.dispersion = Some(report_dispersion);

        // Unassigned replicas trump everything else: a pass that left
        // replicas homeless is never "nothing to do".
        let status = if unplaced > 0 {
            RebalanceStatus::Partial
        } else if !changed {
            RebalanceStatus::NoOp
        } else if balance > BALANCE_TOLERANCE && balance / 100.0 > self.overload {
            RebalanceStatus::Partial
        } else {
            RebalanceStatus::Balanced
        };
        info!(
            ?status,
            parts_moved,
            deferred,
            unplaced,
            overloaded,
            balance,
            dispersion = report_dispersion,
            version = self.version,
            "rebalance pass complete"
        );
        Ok(RebalanceReport {
            status,
            parts_moved,
            deferred,
            unplaced,
            overloaded,
            balance,
        })
    }

    /// Recompute every device's signed deficit toward its ideal share.
    fn update_parts_wanted(&mut self, weight_of_one_part: f64) {
        for dev in self.devices.iter_mut() {
            if dev.pending_removal {
                dev.parts_wanted = -(dev.parts as i64);
            } else {
                let ideal = dev.weight * weight_of_one_part;
                dev.parts_wanted = ideal.round() as i64 - dev.parts as i64;
            }
        }
    }

    /// Collect the replica slots that should move, split by class.
    ///
    /// Returns (mandatory, dispersion, weight, deferred): evacuations and
    /// unassigned slots are always gathered; dispersion violations and
    /// weight sheds respect the per-partition dwell time and are limited
    /// to one replica per partition.
    fn gather(
        &self,
        now: u64,
        weight_of_one_part: f64,
        rng: &mut StdRng,
    ) -> (Vec<Candidate>, Vec<Candidate>, Vec<Candidate>, u64) {
        let mut mandatory = Vec::new();
        let mut dispersion = Vec::new();
        let mut weight = Vec::new();
        let mut deferred = 0u64;
        let mut claimed: HashSet<u64> = HashSet::new();

        for (replica, part, slot) in self.table.slots() {
            let gone = match slot {
                None => true,
                Some(id) => self.devices.get(id).is_none_or(|d| d.pending_removal),
            };
            if gone {
                mandatory.push(Candidate { replica, part });
            }
        }

        let domains = DomainCounts::new(&self.devices);
        for part in 0..self.parts() {
            for replica in violations_for_part(&self.table, &self.devices, part, &domains) {
                // Evacuating replicas are already gathered.
                let holder = self.table.get(replica, part).and_then(|id| self.devices.get(id));
                if holder.is_none_or(|d| d.pending_removal) {
                    continue;
                }
                if !self.table.movable(part, self.min_part_hours, now) {
                    deferred += 1;
                    continue;
                }
                if claimed.insert(part) {
                    dispersion.push(Candidate { replica, part });
                } else {
                    deferred += 1;
                }
            }
        }

        // Every replica on a device above its fractional ideal is a shed
        // candidate; placement decides which moves actually reduce the
        // imbalance. Gathering only a rounded surplus would retry the same
        // few partitions forever when their targets hold peer replicas.
        let overweight: HashSet<u32> = self
            .devices
            .active()
            .filter(|d| d.parts as f64 > d.weight * weight_of_one_part)
            .map(|d| d.id)
            .collect();
        let mut order: Vec<u64> = (0..self.parts()).collect();
        order.shuffle(rng);
        for &part in &order {
            for replica in 0..self.table.rows().len() {
                let Some(id) = self.table.get(replica, part) else {
                    continue;
                };
                if !overweight.contains(&id) {
                    continue;
                }
                if claimed.contains(&part) {
                    deferred += 1;
                    continue;
                }
                if !self.table.movable(part, self.min_part_hours, now) {
                    deferred += 1;
                    continue;
                }
                claimed.insert(part);
                weight.push(Candidate { replica, part });
            }
        }

        (mandatory, dispersion, weight, deferred)
    }

    /// Find a new home for one gathered replica and commit the move.
    fn place(
        &mut self,
        cand: Candidate,
        class: MoveClass,
        weight_of_one_part: f64,
        rng: &mut StdRng,
    ) -> Placement {
        let from = self.table.get(cand.replica, cand.part);

        // The partition's other replicas constrain both uniqueness and
        // failure-domain ranking.
        let peers: Vec<(u32, u32, u32)> = self
            .table
            .devices_for_part(cand.part)
            .filter(|&(replica, _)| replica != cand.replica)
            .filter_map(|(_, id)| self.devices.get(id).map(|d| (d.id, d.region, d.zone)))
            .collect();

        let current_tier = from
            .and_then(|id| self.devices.get(id))
            .map(|d| domain_tier(d.region, d.zone, &peers));

        let from_want = from
            .and_then(|id| self.devices.get(id))
            .map(|d| d.weight * weight_of_one_part - d.parts as f64);

        // Rank eligible devices by dispersion tier, then largest fractional
        // deficit, then a seeded tiebreak. The overload cap is a hard
        // filter for voluntary moves; mandatory placements fall back to
        // over-cap devices rather than leaving a replica homeless.
        let mut best_under_cap: Option<TargetRank> = None;
        let mut best_any: Option<TargetRank> = None;
        for dev in self.devices.active() {
            if dev.weight <= 0.0 {
                continue;
            }
            if Some(dev.id) == from || peers.iter().any(|&(id, _, _)| id == dev.id) {
                continue;
            }
            let ideal = dev.weight * weight_of_one_part;
            let rank = TargetRank {
                tier: domain_tier(dev.region, dev.zone, &peers),
                want: ideal - dev.parts as f64,
                tie: rng.random(),
                id: dev.id,
            };
            let cap = ideal * (1.0 + self.overload);
            if (dev.parts as f64) < cap && best_under_cap.is_none_or(|b| rank.beats(&b)) {
                best_under_cap = Some(rank);
            }
            if best_any.is_none_or(|b| rank.beats(&b)) {
                best_any = Some(rank);
            }
        }

        let (chosen, over_cap) = match best_under_cap {
            Some(rank) => (Some(rank), false),
            None if class == MoveClass::Mandatory => (best_any, true),
            None => (None, false),
        };
        let Some(target) = chosen else {
            return Placement::NoHome;
        };
        // A dispersion move must actually improve dispersion.
        if class == MoveClass::Dispersion && current_tier.is_some_and(|cur| target.tier >= cur) {
            return Placement::Kept;
        }
        // A shed must strictly reduce the imbalance: when the deficits
        // differ by exactly one part, moving only swaps which device is
        // off by a fraction.
        if class == MoveClass::Weight
            && let Some(fw) = from_want
            && target.want - fw <= 1.0 + 1e-9
        {
            return Placement::Kept;
        }
        let to = target.id;

        self.table.set(cand.replica, cand.part, Some(to));
        if let Some(from_id) = from
            && let Some(dev) = self.devices.get_mut(from_id)
        {
            dev.parts = dev.parts.saturating_sub(1);
            dev.parts_wanted += 1;
        }
        if let Some(dev) = self.devices.get_mut(to) {
            dev.parts += 1;
            dev.parts_wanted -= 1;
        }
        Placement::Moved { overload: over_cap }
    }

    /// Drop pending-removal devices that no longer hold any replica.
    fn finalize_removed(&mut self) -> Vec<u32> {
        let done: Vec<u32> = self
            .devices
            .iter()
            .filter(|d| d.pending_removal && d.parts == 0)
            .map(|d| d.id)
            .collect();
        for &id in &done {
            self.devices.finalize(id);
        }
        done
    }
}

enum Placement {
    Moved { overload: bool },
    NoHome,
    Kept,
}

/// Ranking key for a placement target.
#[derive(Clone, Copy)]
struct TargetRank {
    tier: u8,
    want: f64,
    tie: u64,
    id: u32,
}

impl TargetRank {
    fn beats(&self, other: &Self) -> bool {
        self.tier
            .cmp(&other.tier)
            .then(other.want.total_cmp(&self.want))
            .then(self.tie.cmp(&other.tie))
            .then(self.id.cmp(&other.id))
            .is_lt()
    }
}

/// 0 when the device shares no region with any peer, 1 when it shares a
/// region but no zone, 2 when it shares a zone.
fn domain_tier(region: u32, zone: u32, peers: &[(u32, u32, u32)]) -> u8 {
    if !peers.iter().any(|&(_, r, _)| r == region) {
        0
    } else if !peers.iter().any(|&(_, r, z)| r == region && z == zone) {
        1
    } else {
        2
    }
}
