//! The layered meta-graph and its shortest-path solver.
//!
//! Level i holds every candidate strategy of op i; an edge between adjacent
//! levels carries the transition cost. Branching sections fuse into the
//! same structure by summing per-branch costs between the shared pivot
//! levels.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use mosaic_core::prelude::*;

use crate::candidates::OpStrategy;

/// One level of the meta-graph: an op and its candidate set.
#[derive(Debug, Clone)]
pub struct Level {
    pub op: OpId,
    pub strategies: Vec<OpStrategy>,
}

/// A solved section: the minimum path cost between every (entry strategy,
/// exit strategy) pair, plus the interior assignment realising each pair.
#[derive(Debug, Clone)]
pub struct SectionSolution {
    pub entry_op: OpId,
    pub exit_op: OpId,
    /// cost[i][j]: entry strategy i to exit strategy j.
    pub cost: Vec<Vec<f64>>,
    /// Interior (op, strategy index) choices for each (i, j), excluding the
    /// endpoints themselves.
    pub interior: Vec<Vec<Vec<(OpId, usize)>>>,
}

impl SectionSolution {
    /// Fuse parallel branches sharing the same endpoints: costs add, and
    /// the interior assignments union.
    pub fn fuse(mut branches: Vec<SectionSolution>) -> Option<SectionSolution> {
        let first = branches.pop()?;
        let mut fused = first;
        for branch in branches {
            debug_assert_eq!(fused.entry_op, branch.entry_op);
            debug_assert_eq!(fused.exit_op, branch.exit_op);
            for i in 0..fused.cost.len() {
                for j in 0..fused.cost[i].len() {
                    fused.cost[i][j] += branch.cost[i][j];
                    fused.interior[i][j].extend(branch.interior[i][j].iter().copied());
                }
            }
        }
        Some(fused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    dist: f64,
    node: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap over f64 distances; ties broken by node index so the
        // solve is deterministic.
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Solve one linear chain of levels with Dijkstra. `edge_cost(level,
/// parent_strategy_idx, child_strategy_idx)` prices the transition between
/// level `level` and `level + 1`.
pub fn solve_linear<F>(levels: &[Level], mut edge_cost: F) -> Result<SectionSolution>
where
    F: FnMut(usize, usize, usize) -> f64,
{
    if levels.len() < 2 {
        return Err(Error::logic(
            "strategy-metagraph",
            "linear section needs at least two levels",
        ));
    }

    // Flatten (level, strategy) into node indices.
    let mut level_base = Vec::with_capacity(levels.len());
    let mut node_count = 0usize;
    for level in levels {
        level_base.push(node_count);
        node_count += level.strategies.len();
    }

    let entry_count = levels[0].strategies.len();
    let exit_count = levels[levels.len() - 1].strategies.len();
    let mut cost = vec![vec![f64::INFINITY; exit_count]; entry_count];
    let mut interior = vec![vec![Vec::new(); exit_count]; entry_count];

    for entry in 0..entry_count {
        let mut dist = vec![f64::INFINITY; node_count];
        let mut prev = vec![usize::MAX; node_count];
        let start = level_base[0] + entry;
        dist[start] = 0.0;

        let mut heap = BinaryHeap::new();
        heap.push(HeapEntry {
            dist: 0.0,
            node: start,
        });

        while let Some(HeapEntry { dist: d, node }) = heap.pop() {
            if d > dist[node] {
                continue;
            }
            let level = match level_base.binary_search(&node) {
                Ok(l) => l,
                Err(l) => l - 1,
            };
            if level + 1 >= levels.len() {
                continue;
            }
            let from_strategy = node - level_base[level];
            for to_strategy in 0..levels[level + 1].strategies.len() {
                let w = edge_cost(level, from_strategy, to_strategy);
                if !w.is_finite() {
                    continue;
                }
                let next = level_base[level + 1] + to_strategy;
                let nd = d + w;
                if nd < dist[next] {
                    dist[next] = nd;
                    prev[next] = node;
                    heap.push(HeapEntry {
                        dist: nd,
                        node: next,
                    });
                }
            }
        }

        for exit in 0..exit_count {
            let end = level_base[levels.len() - 1] + exit;
            cost[entry][exit] = dist[end];
            if dist[end].is_finite() {
                // Recover the interior path, endpoints excluded.
                let mut path = Vec::new();
                let mut node = end;
                while prev[node] != usize::MAX {
                    node = prev[node];
                    if node != start {
                        let level = match level_base.binary_search(&node) {
                            Ok(l) => l,
                            Err(l) => l - 1,
                        };
                        path.push((levels[level].op, node - level_base[level]));
                    }
                }
                path.reverse();
                interior[entry][exit] = path;
            }
        }
    }

    Ok(SectionSolution {
        entry_op: levels[0].op,
        exit_op: levels[levels.len() - 1].op,
        cost,
        interior,
    })
}

impl SectionSolution {
    /// (min,+) composition of two sections sharing a boundary op: the
    /// boundary's chosen strategy becomes part of the interior.
    pub fn compose(self, next: SectionSolution) -> Result<SectionSolution> {
        if self.exit_op != next.entry_op {
            return Err(Error::logic(
                "strategy-metagraph",
                format!(
                    "cannot compose sections: {} != {}",
                    self.exit_op, next.entry_op
                ),
            ));
        }
        let entry_count = self.cost.len();
        let mid_count = next.cost.len();
        if self.cost.first().map(|r| r.len()).unwrap_or(0) != mid_count {
            return Err(Error::logic(
                "strategy-metagraph",
                "boundary candidate sets diverged between sections",
            ));
        }
        let exit_count = next.cost.first().map(|r| r.len()).unwrap_or(0);

        let mut cost = vec![vec![f64::INFINITY; exit_count]; entry_count];
        let mut interior = vec![vec![Vec::new(); exit_count]; entry_count];

        for i in 0..entry_count {
            for k in 0..exit_count {
                let mut best_j = usize::MAX;
                let mut best = f64::INFINITY;
                for j in 0..mid_count {
                    let total = self.cost[i][j] + next.cost[j][k];
                    if total < best {
                        best = total;
                        best_j = j;
                    }
                }
                cost[i][k] = best;
                if best.is_finite() {
                    let mut path = self.interior[i][best_j].clone();
                    path.push((self.exit_op, best_j));
                    path.extend(next.interior[best_j][k].iter().copied());
                    interior[i][k] = path;
                }
            }
        }

        Ok(SectionSolution {
            entry_op: self.entry_op,
            exit_op: next.exit_op,
            cost,
            interior,
        })
    }

    /// The minimum-cost assignment over every op this section covers,
    /// endpoints included.
    pub fn best_assignment(&self) -> Result<Vec<(OpId, usize)>> {
        let mut best = (usize::MAX, usize::MAX, f64::INFINITY);
        for (i, row) in self.cost.iter().enumerate() {
            for (j, &c) in row.iter().enumerate() {
                if c < best.2 {
                    best = (i, j, c);
                }
            }
        }
        if !best.2.is_finite() {
            return Err(Error::runtime(
                "strategy-metagraph",
                "no finite-cost strategy assignment exists for the graph",
            ));
        }
        let mut assignment = vec![(self.entry_op, best.0)];
        assignment.extend(self.interior[best.0][best.1].iter().copied());
        assignment.push((self.exit_op, best.1));
        Ok(assignment)
    }
}
