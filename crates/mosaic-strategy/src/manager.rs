//! The strategy manager: recursive parallel-branch solver plus the final
//! annotation emit.

use std::collections::HashMap;

use mosaic_core::prelude::*;

use crate::candidates::{strategies_for_op, OpStrategy, StreamAxis};
use crate::cost::CostModel;
use crate::metagraph::{solve_linear, Level, SectionSolution};
use crate::subgraphs::{
    data_children, lcsa, non_exclusive_nodes, repair_non_exclusive, revert_repair, RepairLog,
};

const PASS: &str = "strategy-manager";

pub struct StrategyManager<'a> {
    model: &'a mut ComputationModel,
    config: &'a GlobalConfig,
    candidates: HashMap<OpId, Vec<OpStrategy>>,
}

impl<'a> StrategyManager<'a> {
    pub fn new(model: &'a mut ComputationModel, config: &'a GlobalConfig) -> Self {
        Self {
            model,
            config,
            candidates: HashMap::new(),
        }
    }

    /// Solve the whole graph and write the chosen strategies back onto ops
    /// and tensors.
    pub fn optimize(mut self) -> Result<()> {
        self.config.validate()?;

        let inputs = self.model.input_ops();
        let outputs = self.model.output_ops();
        let (begin, end) = match (inputs.as_slice(), outputs.as_slice()) {
            ([i], [o]) => (*i, *o),
            _ => {
                return Err(Error::argument(
                    PASS,
                    format!(
                        "expected exactly one Input and one Output op, got {} and {}",
                        inputs.len(),
                        outputs.len()
                    ),
                ))
            }
        };

        let mut repairs = RepairLog::default();
        let solved = self.solve_region(begin, None, end, &mut repairs);

        // Edge edits from non-exclusive repair are undone before emitting,
        // whatever the solve outcome.
        let revert = revert_repair(self.model, repairs);
        let solution = solved?;
        revert?;

        let assignment = solution.best_assignment()?;
        self.apply_assignment(&assignment)?;
        self.derive_pipelining(&assignment);
        Ok(())
    }

    fn candidates_for(&mut self, op: OpId) -> Vec<OpStrategy> {
        if let Some(c) = self.candidates.get(&op) {
            return c.clone();
        }
        let c = strategies_for_op(self.model, self.config, op);
        self.candidates.insert(op, c.clone());
        c
    }

    /// Walk from `begin` to `end`, composing one solved section per linear
    /// run or branching region. `via` pins the first hop when solving one
    /// branch of a pivot.
    fn solve_region(
        &mut self,
        begin: OpId,
        via: Option<OpId>,
        end: OpId,
        repairs: &mut RepairLog,
    ) -> Result<SectionSolution> {
        let mut solution: Option<SectionSolution> = None;
        let mut traveling = begin;
        let mut first_hop = via;

        while traveling != end {
            let children = match first_hop.take() {
                Some(c) => vec![c],
                None => data_children(self.model, traveling),
            };

            let (section, next) = match children.len() {
                0 => {
                    return Err(Error::logic(
                        PASS,
                        format!(
                            "dead end at '{}' before reaching '{}'",
                            self.model.op(traveling).name,
                            self.model.op(end).name
                        ),
                    ))
                }
                1 => self.solve_linear_run(traveling, children[0], end)?,
                _ => {
                    let topo = self.model.topological_order()?;
                    let join = lcsa(self.model, &topo, traveling, end)?;

                    let shared = non_exclusive_nodes(self.model, traveling, join);
                    if !shared.is_empty() {
                        repair_non_exclusive(self.model, &shared, join, repairs)?;
                        // Touched ops got force_clustering; regenerate.
                        self.candidates.clear();
                    }

                    let branch_children = data_children(self.model, traveling);
                    let mut branches = Vec::with_capacity(branch_children.len());
                    for child in branch_children {
                        branches.push(self.solve_region(
                            traveling,
                            Some(child),
                            join,
                            repairs,
                        )?);
                    }
                    let fused = SectionSolution::fuse(branches).ok_or_else(|| {
                        Error::logic(PASS, "branching section with no branches")
                    })?;
                    (fused, join)
                }
            };

            solution = Some(match solution {
                Some(acc) => acc.compose(section)?,
                None => section,
            });
            traveling = next;
        }

        solution.ok_or_else(|| {
            Error::logic(
                PASS,
                format!("empty region at '{}'", self.model.op(begin).name),
            )
        })
    }

    /// Collect the run [begin, via, ...] while nodes stay single-child, and
    /// solve it as one layered graph.
    fn solve_linear_run(
        &mut self,
        begin: OpId,
        via: OpId,
        end: OpId,
    ) -> Result<(SectionSolution, OpId)> {
        let mut ops = vec![begin, via];
        let mut cur = via;
        while cur != end {
            let children = data_children(self.model, cur);
            if children.len() != 1 {
                break;
            }
            cur = children[0];
            ops.push(cur);
        }

        let levels: Vec<Level> = ops
            .iter()
            .map(|&op| Level {
                op,
                strategies: self.candidates_for(op),
            })
            .collect();

        let cost_model = CostModel::new(self.model, self.config);
        let section = solve_linear(&levels, |level, from, to| {
            cost_model.transition_cost(
                levels[level].op,
                levels[level + 1].op,
                &levels[level].strategies[from],
                &levels[level + 1].strategies[to],
            )
        })?;
        Ok((section, cur))
    }

    fn apply_assignment(&mut self, assignment: &[(OpId, usize)]) -> Result<()> {
        for &(op, idx) in assignment {
            let strategies = self.candidates_for(op);
            let chosen = strategies.get(idx).ok_or_else(|| {
                Error::index(
                    PASS,
                    format!(
                        "strategy index {idx} out of range for '{}'",
                        self.model.op(op).name
                    ),
                )
            })?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                op = %self.model.op(op).name,
                clustering = ?chosen.clustering,
                streaming = ?chosen.streaming,
                spilling = chosen.spilling,
                "chosen strategy"
            );

            let spill_to_ddr = chosen.spilling || chosen.total_streams() > 1;
            let clustering = chosen.clustering;

            {
                let desc = self.model.op_mut(op);
                desc.split_strategy = Some(clustering);
                desc.streaming = Some(chosen.streaming);
                desc.spilling = chosen.spilling;
                desc.input_sparsity = chosen.input_sparsity;
                desc.output_sparsity = chosen.output_sparsity;
                desc.weights_sparsity = chosen.weights_sparsity;
            }

            let is_compute = self.model.op(op).is_optimisable();
            for out in self.model.op(op).outputs.clone() {
                let tensor = self.model.tensor_mut(out);
                if is_compute {
                    tensor.strategy = Some(clustering);
                    // Network-facing locations are fixed by the interface.
                    let pinned = matches!(
                        tensor.location,
                        MemoryLocation::ProgrammableInput
                            | MemoryLocation::ProgrammableOutput
                            | MemoryLocation::ProfilingOutput
                    );
                    if !pinned {
                        tensor.location = if spill_to_ddr {
                            MemoryLocation::DdrHeap
                        } else {
                            MemoryLocation::NnCmx
                        };
                    }
                }
            }
        }

        // Input activations follow their first consumer's split so the load
        // DMA can scatter directly.
        for input_op in self.model.input_ops() {
            for out in self.model.op(input_op).outputs.clone() {
                let consumer = self.model.sink_ops(out).first().copied();
                let consumer_strategy =
                    consumer.and_then(|c| self.model.op(c).split_strategy);
                if let Some(s) = consumer_strategy {
                    if s.splits_height() {
                        self.model.tensor_mut(out).strategy =
                            Some(SplitStrategy::SplitOverH);
                    } else {
                        self.model.tensor_mut(out).strategy =
                            Some(SplitStrategy::Clustering);
                    }
                }
            }
        }
        Ok(())
    }

    /// K-streaming with a resident parent pipelines weights; H-streaming
    /// pipelines activations.
    fn derive_pipelining(&mut self, assignment: &[(OpId, usize)]) {
        for &(op, _) in assignment {
            if !self.model.op(op).is_hardwarisable() {
                continue;
            }
            let parent_spilling = self
                .model
                .data_parents(op)
                .first()
                .map(|&p| self.model.op(p).spilling)
                .unwrap_or(false);
            let streaming = self.model.op(op).streaming.unwrap_or([1; 5]);

            let pipelining = if parent_spilling {
                Pipelining::None
            } else if streaming[StreamAxis::K as usize] > 1 {
                Pipelining::PipelineWeights
            } else if streaming[StreamAxis::H as usize] > 1 {
                Pipelining::PipelineActivations
            } else {
                Pipelining::None
            };
            self.model.op_mut(op).pipelining = pipelining;
        }
    }
}
