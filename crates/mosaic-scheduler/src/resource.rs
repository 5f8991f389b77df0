//! The scratchpad resource model: a disjoint-interval set inside
//! [0, capacity) plus a consumer ref-count per producing op. An interval is
//! freed only when its producer's outstanding-consumer count reaches zero,
//! or when the scheduler forcibly evicts it.

use std::collections::{BTreeMap, HashMap};

use mosaic_core::id::OpId;

/// Inclusive byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub begin: u64,
    pub end: u64,
}

impl Interval {
    pub fn length(&self) -> u64 {
        self.end - self.begin + 1
    }
}

#[derive(Debug, Default)]
pub struct ProducerConsumerResource {
    capacity: u64,
    /// begin -> (end, owner); intervals are disjoint.
    intervals: BTreeMap<u64, (u64, OpId)>,
    owners: HashMap<OpId, Interval>,
    /// Outstanding consumers per producing op. Survives eviction so a
    /// spill-read can restore the interval without recounting.
    consumers: HashMap<OpId, usize>,
}

impl ProducerConsumerResource {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn assigned_bytes(&self) -> u64 {
        self.owners.values().map(Interval::length).sum()
    }

    pub fn interval_of(&self, op: OpId) -> Option<Interval> {
        self.owners.get(&op).copied()
    }

    pub fn holds_interval(&self, op: OpId) -> bool {
        self.owners.contains_key(&op)
    }

    pub fn active_owners(&self) -> impl Iterator<Item = OpId> + '_ {
        self.owners.keys().copied()
    }

    pub fn outstanding_consumers(&self, op: OpId) -> Option<usize> {
        self.consumers.get(&op).copied()
    }

    /// Free gaps between the assigned intervals, in address order.
    fn free_intervals(&self) -> Vec<Interval> {
        let mut free = Vec::new();
        let mut cursor = 0u64;
        for (&begin, &(end, _)) in &self.intervals {
            if begin > cursor {
                free.push(Interval {
                    begin: cursor,
                    end: begin - 1,
                });
            }
            cursor = end + 1;
        }
        if cursor < self.capacity {
            free.push(Interval {
                begin: cursor,
                end: self.capacity - 1,
            });
        }
        free
    }

    /// Is a single contiguous gap of `demand` bytes available?
    pub fn is_available(&self, demand: u64) -> bool {
        if demand == 0 {
            return true;
        }
        self.free_intervals().iter().any(|i| i.length() >= demand)
    }

    /// Greedy decreasing-size packing of a demand multiset into the free
    /// gaps. Demands must come sorted in decreasing order; the returned
    /// intervals are parallel to the input. `None` when the multiset does
    /// not fit simultaneously.
    pub fn pack_demands_into_free_bins(&self, demands_desc: &[u64]) -> Option<Vec<Interval>> {
        let mut bins = self.free_intervals();
        // Largest gaps first so the big demands land before fragmentation.
        bins.sort_by(|a, b| b.length().cmp(&a.length()).then(a.begin.cmp(&b.begin)));

        let mut cursors: Vec<u64> = bins.iter().map(|b| b.begin).collect();
        let mut out = Vec::with_capacity(demands_desc.len());

        for &demand in demands_desc {
            if demand == 0 {
                // Zero demands still occupy a slot in the result so the
                // caller can zip demands and intervals.
                out.push(Interval { begin: 0, end: 0 });
                continue;
            }
            let mut placed = false;
            for (bin, cursor) in bins.iter().zip(cursors.iter_mut()) {
                let remaining = bin.end + 1 - *cursor;
                if remaining >= demand {
                    out.push(Interval {
                        begin: *cursor,
                        end: *cursor + demand - 1,
                    });
                    *cursor += demand;
                    placed = true;
                    break;
                }
            }
            if !placed {
                return None;
            }
        }
        Some(out)
    }

    pub fn are_available_simultaneously(&self, demands_desc: &[u64]) -> bool {
        self.pack_demands_into_free_bins(demands_desc).is_some()
    }

    /// Claim `interval` for `op`. The consumer count is installed only on
    /// the first assignment; a spill-read restoring an evicted interval
    /// keeps the surviving count.
    pub fn assign(&mut self, op: OpId, interval: Interval, consumer_count: usize) -> bool {
        if self.owners.contains_key(&op) {
            return false;
        }
        // Reject overlap with any existing interval.
        for (&begin, &(end, _)) in &self.intervals {
            if begin <= interval.end && interval.begin <= end {
                return false;
            }
        }
        self.intervals.insert(interval.begin, (interval.end, op));
        self.owners.insert(op, interval);
        self.consumers.entry(op).or_insert(consumer_count);
        true
    }

    /// Drop the interval but keep the consumer count: the data now lives in
    /// DRAM and will be re-read.
    pub fn evict(&mut self, op: OpId) -> bool {
        match self.owners.remove(&op) {
            Some(interval) => {
                self.intervals.remove(&interval.begin);
                true
            }
            None => false,
        }
    }

    /// One consumer of `op` completed. Returns true when the count hit
    /// zero and the producer's interval (if still resident) was released.
    pub fn decrement_consumers(&mut self, op: OpId) -> bool {
        let count = match self.consumers.get_mut(&op) {
            Some(c) => c,
            None => return false,
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.consumers.remove(&op);
            if let Some(interval) = self.owners.remove(&op) {
                self.intervals.remove(&interval.begin);
            }
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
        self.owners.clear();
        self.consumers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn packing_respects_capacity() {
        let state = ProducerConsumerResource::new(4 * MB);
        assert!(state.are_available_simultaneously(&[2 * MB, 2 * MB]));
        assert!(!state.are_available_simultaneously(&[2 * MB, 2 * MB, 2 * MB]));
    }

    #[test]
    fn interval_freed_only_at_zero_consumers() {
        let mut state = ProducerConsumerResource::new(4 * MB);
        let a = OpId::new(0);
        assert!(state.assign(
            a,
            Interval {
                begin: 0,
                end: 2 * MB - 1
            },
            2
        ));
        assert!(!state.decrement_consumers(a));
        assert!(state.holds_interval(a));
        assert!(state.decrement_consumers(a));
        assert!(!state.holds_interval(a));
        assert_eq!(state.assigned_bytes(), 0);
    }

    #[test]
    fn eviction_keeps_the_consumer_count() {
        let mut state = ProducerConsumerResource::new(4 * MB);
        let a = OpId::new(0);
        state.assign(
            a,
            Interval {
                begin: 0,
                end: MB - 1,
            },
            3,
        );
        assert!(state.evict(a));
        assert_eq!(state.outstanding_consumers(a), Some(3));
        // Spill-read restores without resetting the count.
        state.assign(
            a,
            Interval {
                begin: MB,
                end: 2 * MB - 1,
            },
            999,
        );
        assert_eq!(state.outstanding_consumers(a), Some(3));
    }
}
