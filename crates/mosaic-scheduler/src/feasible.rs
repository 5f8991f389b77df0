//! The feasible memory scheduler.
//!
//! A list scheduler driven by two min-heaps (start times, completion
//! times) over a contiguous scratchpad model. Ready compute ops are
//! admitted when their full demand list packs into the free gaps;
//! stalls force-evict the active op with the fewest active inputs and
//! re-read it later through a spill.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use mosaic_core::prelude::*;

use crate::dag::DagAdapter;
use crate::resource::ProducerConsumerResource;

const PASS: &str = "feasible-scheduler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledKind {
    Original,
    SpillRead,
    SpillWrite,
}

/// One emitted schedule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOp {
    pub op: OpId,
    pub time: u64,
    pub kind: ScheduledKind,
    pub interval: Option<(u64, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputState {
    Active,
    Spilled,
    Consumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapElem {
    time: u64,
    name: String,
    op: OpId,
    kind: ScheduledKind,
}

impl Ord for HeapElem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| kind_rank(self.kind).cmp(&kind_rank(other.kind)))
    }
}

impl PartialOrd for HeapElem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn kind_rank(kind: ScheduledKind) -> u8 {
    match kind {
        ScheduledKind::Original => 0,
        ScheduledKind::SpillRead => 1,
        ScheduledKind::SpillWrite => 2,
    }
}

pub struct FeasibleMemoryScheduler<'a> {
    dag: &'a DagAdapter<'a>,
    resource: ProducerConsumerResource,
    current_time: u64,
    start_heap: BinaryHeap<Reverse<HeapElem>>,
    completion_heap: BinaryHeap<Reverse<HeapElem>>,
    in_degree: HashMap<OpId, usize>,
    ready_compute: BTreeSet<OpId>,
    ready_active: BTreeSet<OpId>,
    ready_data: BTreeSet<OpId>,
    output_table: HashMap<OpId, OutputState>,
    bandwidth: f64,
}

impl<'a> FeasibleMemoryScheduler<'a> {
    pub fn new(dag: &'a DagAdapter<'a>, capacity: u64, bandwidth: f64) -> Result<Self> {
        let mut scheduler = Self {
            dag,
            resource: ProducerConsumerResource::new(capacity),
            current_time: 1,
            start_heap: BinaryHeap::new(),
            completion_heap: BinaryHeap::new(),
            in_degree: HashMap::new(),
            ready_compute: BTreeSet::new(),
            ready_active: BTreeSet::new(),
            ready_data: BTreeSet::new(),
            output_table: HashMap::new(),
            bandwidth,
        };
        scheduler.init()?;
        Ok(scheduler)
    }

    /// Produce the full schedule. Fails if the DAG has a cycle, a single op
    /// exceeds the scratchpad, or the ready lists drain with residual
    /// in-degree.
    pub fn run(mut self) -> Result<Vec<ScheduledOp>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next_schedulable_op()? {
            out.push(entry);
        }
        if !self.in_degree.is_empty() {
            let stuck = self.lowest_name(self.in_degree.keys().copied());
            return Err(Error::runtime(
                PASS,
                format!("non-empty in-degree at the end of scheduling, stuck on '{stuck}'"),
            ));
        }
        Ok(out)
    }

    fn init(&mut self) -> Result<()> {
        self.check_input_is_dag()?;

        for &op in self.dag.ops() {
            let demand = self.dag.resource_utility(op);
            if demand > self.resource.capacity() {
                return Err(Error::runtime(
                    PASS,
                    format!(
                        "op '{}' demands {} bytes, exceeding the scratchpad capacity {}",
                        self.dag.op_name(op),
                        demand,
                        self.resource.capacity()
                    ),
                ));
            }
        }

        // In-degrees; the invariant is that ops missing from the map have
        // in-degree zero.
        for &op in self.dag.ops() {
            let degree = self.dag.incoming(op).len();
            if degree > 0 {
                self.in_degree.insert(op, degree);
            }
        }

        // Zero-in-degree data ops never gate readiness; their consumers'
        // in-degree drops right away and the data op is scheduled lazily
        // when a compute op claims its bytes.
        let mut unblocked = Vec::new();
        for &op in self.dag.ops() {
            if self.dag.is_data_op(op) && !self.in_degree.contains_key(&op) {
                self.ready_data.insert(op);
                self.collect_newly_ready_children(op, &mut unblocked);
            }
        }
        // Anything unblocked here is a compute op; the scan below picks it
        // up through the emptied in-degree map.
        unblocked.clear();
        for &op in self.dag.ops() {
            if self.dag.is_compute_op(op) && !self.in_degree.contains_key(&op) {
                self.ready_compute.insert(op);
            }
        }

        self.schedule_all_possible_ready_ops()?;
        Ok(())
    }

    /// Kahn pass purely for the cycle diagnostic.
    fn check_input_is_dag(&self) -> Result<()> {
        let mut degree: HashMap<OpId, usize> = HashMap::new();
        for &op in self.dag.ops() {
            degree.insert(op, self.dag.incoming(op).len());
        }
        let mut queue: Vec<OpId> = degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&op, _)| op)
            .collect();
        while let Some(op) = queue.pop() {
            for &child in self.dag.outgoing(op) {
                let d = degree.get_mut(&child).ok_or_else(|| {
                    Error::logic(PASS, format!("edge to unknown op {child}"))
                })?;
                *d -= 1;
                if *d == 0 {
                    queue.push(child);
                }
            }
        }
        if degree.values().any(|&d| d > 0) {
            let name =
                self.lowest_name(degree.iter().filter(|(_, &d)| d > 0).map(|(&o, _)| o));
            return Err(Error::runtime(
                PASS,
                format!("input is not a DAG due to '{name}'"),
            ));
        }
        Ok(())
    }

    fn lowest_name(&self, ops: impl Iterator<Item = OpId>) -> String {
        ops.map(|o| self.dag.op_name(o).to_string())
            .min()
            .unwrap_or_default()
    }

    fn reached_end(&self) -> bool {
        self.ready_compute.is_empty()
            && self.ready_active.is_empty()
            && self.start_heap.is_empty()
            && self.completion_heap.is_empty()
    }

    /// Emit exactly one scheduled op, advancing time and spilling as
    /// needed. `None` once the schedule is complete.
    fn next_schedulable_op(&mut self) -> Result<Option<ScheduledOp>> {
        loop {
            if self.reached_end() {
                return Ok(None);
            }

            let pop_start = {
                let start_top = self.start_heap.peek().map(|Reverse(e)| e);
                let completion_top = self.completion_heap.peek().map(|Reverse(e)| e);
                match (start_top, completion_top) {
                    (Some(s), Some(c)) => s.time < c.time,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => {
                        let stuck = self.lowest_name(
                            self.ready_compute
                                .iter()
                                .chain(self.ready_active.iter())
                                .copied(),
                        );
                        return Err(Error::runtime(
                            PASS,
                            format!(
                                "scheduling stalled with empty heaps; '{stuck}' cannot be \
                                 placed in the scratchpad"
                            ),
                        ));
                    }
                }
            };

            if pop_start {
                let Reverse(elem) = match self.start_heap.pop() {
                    Some(e) => e,
                    None => continue,
                };
                self.current_time = elem.time;

                let interval = if elem.kind != ScheduledKind::SpillWrite
                    && self.dag.resource_utility(elem.op) > 0
                {
                    self.resource
                        .interval_of(elem.op)
                        .map(|i| (i.begin, i.end))
                } else {
                    None
                };
                let emitted = ScheduledOp {
                    op: elem.op,
                    time: elem.time,
                    kind: elem.kind,
                    interval,
                };

                #[cfg(feature = "tracing")]
                tracing::trace!(
                    op = self.dag.op_name(elem.op),
                    time = elem.time,
                    kind = ?elem.kind,
                    "emit"
                );

                let mut completion = elem;
                completion.time += self.delay_of(completion.op, completion.kind);
                self.completion_heap.push(Reverse(completion));
                return Ok(Some(emitted));
            }

            // Advance to the next completion frontier, then retry admitting
            // ready ops; if nothing starts, evict.
            loop {
                self.unschedule_all_completing_at_next_time()?;
                self.schedule_all_possible_ready_ops()?;
                if self.completion_heap.is_empty() || !self.start_heap.is_empty() {
                    break;
                }
            }
            if self.start_heap.is_empty() && !self.force_schedule_active_op_eviction() {
                let stuck = self.lowest_name(
                    self.ready_compute
                        .iter()
                        .chain(self.ready_active.iter())
                        .copied(),
                );
                return Err(Error::runtime(
                    PASS,
                    format!("unable to schedule '{stuck}': nothing left to evict"),
                ));
            }
        }
    }

    fn delay_of(&self, op: OpId, kind: ScheduledKind) -> u64 {
        match kind {
            ScheduledKind::Original => self.dag.delay(op),
            // Spills move the op's output over the DMA engines.
            ScheduledKind::SpillRead | ScheduledKind::SpillWrite => {
                let bytes = self.dag.resource_utility(op);
                ((bytes as f64 / self.bandwidth).ceil() as u64).max(1)
            }
        }
    }

    fn schedule_all_possible_ready_ops(&mut self) -> Result<()> {
        for list in [true, false] {
            let candidates: Vec<OpId> = {
                let set = if list {
                    &self.ready_active
                } else {
                    &self.ready_compute
                };
                let mut v: Vec<OpId> = set.iter().copied().collect();
                v.sort_by(|&a, &b| self.dag.op_name(a).cmp(self.dag.op_name(b)));
                v
            };
            for op in candidates {
                if self.is_ready_compute_op_schedulable(op) {
                    self.schedule_compute_op(op)?;
                    self.ready_active.remove(&op);
                    self.ready_compute.remove(&op);
                }
            }
        }
        Ok(())
    }

    /// Demands this op needs assigned simultaneously: its own output plus
    /// every input that is not currently active.
    fn demand_list(&self, op: OpId) -> Vec<(OpId, u64)> {
        let mut demands = Vec::new();
        let own = self.dag.resource_utility(op);
        if !self.dag.is_inplace_op(op) && own > 0 {
            demands.push((op, own));
        }
        for &parent in self.dag.incoming(op) {
            if self.dag.is_pseudo_edge(parent, op) {
                continue;
            }
            let missing = match self.output_table.get(&parent) {
                None => true,
                Some(OutputState::Spilled) => true,
                _ => false,
            };
            if missing {
                let bytes = self.dag.resource_utility(parent);
                if bytes > 0 {
                    demands.push((parent, bytes));
                }
            }
        }
        demands
    }

    fn is_ready_compute_op_schedulable(&self, op: OpId) -> bool {
        if !self.resource.is_available(self.dag.resource_utility(op)) {
            return false;
        }
        let mut demands = self.demand_list(op);
        sort_demands(&mut demands, self.dag);
        let sizes: Vec<u64> = demands.iter().map(|d| d.1).collect();
        self.resource.are_available_simultaneously(&sizes)
    }

    /// Admit one compute op: assign intervals for it and its missing
    /// inputs, schedule those inputs (original data ops or spill-reads),
    /// and queue the op itself behind the slowest input.
    fn schedule_compute_op(&mut self, op: OpId) -> Result<()> {
        let mut demands = self.demand_list(op);
        sort_demands(&mut demands, self.dag);
        let sizes: Vec<u64> = demands.iter().map(|d| d.1).collect();
        let intervals = self
            .resource
            .pack_demands_into_free_bins(&sizes)
            .ok_or_else(|| {
                Error::logic(
                    PASS,
                    format!(
                        "demand packing failed for schedulable op '{}'",
                        self.dag.op_name(op)
                    ),
                )
            })?;

        self.output_table.insert(op, OutputState::Active);

        let mut max_input_delay = 0u64;
        for ((demand_op, _bytes), interval) in demands.iter().zip(intervals) {
            let consumers = self.outgoing_non_pseudo_count(*demand_op);
            if !self.resource.assign(*demand_op, interval, consumers) {
                return Err(Error::logic(
                    PASS,
                    format!(
                        "interval assignment failed for '{}'",
                        self.dag.op_name(*demand_op)
                    ),
                ));
            }
            if *demand_op == op {
                continue;
            }
            let kind = self.schedule_input_op_for_compute_op(*demand_op);
            max_input_delay = max_input_delay.max(self.delay_of(*demand_op, kind));
        }

        self.push_start(HeapElem {
            time: self.current_time + max_input_delay,
            name: self.dag.op_name(op).to_string(),
            op,
            kind: ScheduledKind::Original,
        });
        Ok(())
    }

    /// A missing input is either a data op scheduled here for the first
    /// time, or a previously spilled output coming back as a spill-read.
    fn schedule_input_op_for_compute_op(&mut self, input_op: OpId) -> ScheduledKind {
        let kind = match self.output_table.get(&input_op) {
            None => {
                debug_assert!(self.dag.is_data_op(input_op));
                self.output_table.insert(input_op, OutputState::Active);
                self.ready_data.remove(&input_op);
                ScheduledKind::Original
            }
            Some(OutputState::Spilled) => {
                self.output_table.insert(input_op, OutputState::Active);
                ScheduledKind::SpillRead
            }
            Some(_) => ScheduledKind::Original,
        };
        self.push_start(HeapElem {
            time: self.current_time,
            name: self.dag.op_name(input_op).to_string(),
            op: input_op,
            kind,
        });
        kind
    }

    fn outgoing_non_pseudo_count(&self, op: OpId) -> usize {
        self.dag
            .outgoing(op)
            .iter()
            .filter(|&&c| !self.dag.is_pseudo_edge(op, c))
            .count()
    }

    /// Pop every op completing at the next earliest time, free consumed
    /// producers, and refill the ready lists.
    fn unschedule_all_completing_at_next_time(&mut self) -> Result<()> {
        let frontier = match self.completion_heap.peek() {
            Some(Reverse(e)) => e.time,
            None => return Ok(()),
        };
        self.current_time = frontier;

        let mut completed = Vec::new();
        while let Some(Reverse(top)) = self.completion_heap.peek() {
            if top.time != frontier {
                break;
            }
            let Reverse(elem) = self.completion_heap.pop().ok_or_else(|| {
                Error::logic(PASS, "completion heap drained under peek")
            })?;
            completed.push(elem);
        }

        let mut newly_ready = Vec::new();
        for elem in completed {
            self.unschedule_op(&elem);
            if elem.kind == ScheduledKind::Original && self.dag.is_compute_op(elem.op) {
                self.collect_newly_ready_children(elem.op, &mut newly_ready);
            }
        }
        self.distribute_ready_ops(newly_ready);
        Ok(())
    }

    fn unschedule_op(&mut self, elem: &HeapElem) {
        if elem.kind == ScheduledKind::Original {
            for &parent in self.dag.incoming(elem.op) {
                if self.dag.is_pseudo_edge(parent, elem.op) {
                    continue;
                }
                if self.resource.decrement_consumers(parent) {
                    if let Some(state) = self.output_table.get_mut(&parent) {
                        if *state == OutputState::Active {
                            *state = OutputState::Consumed;
                        }
                    }
                }
            }
        }
        // Terminal ops hold no consumers; release them on completion.
        if self.resource.outstanding_consumers(elem.op) == Some(0) {
            self.resource.decrement_consumers(elem.op);
            if let Some(state) = self.output_table.get_mut(&elem.op) {
                if *state == OutputState::Active {
                    *state = OutputState::Consumed;
                }
            }
        }
    }

    fn collect_newly_ready_children(&mut self, op: OpId, out: &mut Vec<OpId>) {
        for &child in self.dag.outgoing(op) {
            if let Some(d) = self.in_degree.get_mut(&child) {
                if *d == 1 {
                    self.in_degree.remove(&child);
                    out.push(child);
                } else {
                    *d -= 1;
                }
            }
        }
    }

    fn distribute_ready_ops(&mut self, ops: Vec<OpId>) {
        for op in ops {
            if self.dag.is_data_op(op) {
                self.ready_data.insert(op);
                let mut chained = Vec::new();
                self.collect_newly_ready_children(op, &mut chained);
                self.distribute_ready_ops(chained);
            } else if self.has_some_active_input(op) {
                self.ready_active.insert(op);
            } else {
                self.ready_compute.insert(op);
            }
        }
    }

    fn has_some_active_input(&self, op: OpId) -> bool {
        self.dag
            .incoming(op)
            .iter()
            .any(|&p| self.resource.holds_interval(p))
    }

    fn active_input_count(&self, op: OpId) -> usize {
        self.dag
            .incoming(op)
            .iter()
            .filter(|&&p| {
                !self.dag.is_pseudo_edge(p, op) && self.resource.holds_interval(p)
            })
            .count()
    }

    /// Candidate with the fewest active inputs, ties broken by eviction
    /// priority, then name.
    fn choose_active_op_for_eviction(&self) -> Option<OpId> {
        self.resource
            .active_owners()
            .filter(|&op| {
                matches!(self.output_table.get(&op), Some(OutputState::Active))
            })
            .min_by(|&a, &b| {
                self.active_input_count(a)
                    .cmp(&self.active_input_count(b))
                    .then_with(|| {
                        self.dag
                            .eviction_priority(a)
                            .cmp(&self.dag.eviction_priority(b))
                    })
                    .then_with(|| self.dag.op_name(a).cmp(self.dag.op_name(b)))
            })
    }

    fn force_schedule_active_op_eviction(&mut self) -> bool {
        let candidate = match self.choose_active_op_for_eviction() {
            Some(c) => c,
            None => return false,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(op = self.dag.op_name(candidate), "forced eviction");

        self.output_table.insert(candidate, OutputState::Spilled);
        self.resource.evict(candidate);
        self.push_start(HeapElem {
            time: self.current_time,
            name: self.dag.op_name(candidate).to_string(),
            op: candidate,
            kind: ScheduledKind::SpillWrite,
        });
        true
    }

    fn push_start(&mut self, elem: HeapElem) {
        self.start_heap.push(Reverse(elem));
    }
}

fn sort_demands(demands: &mut [(OpId, u64)], dag: &DagAdapter<'_>) {
    demands.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| dag.op_name(a.0).cmp(dag.op_name(b.0)))
    });
}
