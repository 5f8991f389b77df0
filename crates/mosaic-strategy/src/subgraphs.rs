//! Sub-graph extraction: linear runs, branching sections, the LCSA walk,
//! and non-exclusive branch repair.

use mosaic_core::op::AttrValue;
use mosaic_core::prelude::*;

const PASS: &str = "strategy-subgraphs";

/// Ops the solver walks: everything except constants and barriers.
pub fn is_solver_op(model: &ComputationModel, op: OpId) -> bool {
    !matches!(
        model.op(op).kind,
        OpKind::Constant | OpKind::BarrierTask
    )
}

pub fn data_children(model: &ComputationModel, op: OpId) -> Vec<OpId> {
    model
        .children(op)
        .into_iter()
        .filter(|&c| is_solver_op(model, c))
        .collect()
}

pub fn data_parent_count(model: &ComputationModel, op: OpId) -> usize {
    model
        .parents(op)
        .into_iter()
        .filter(|&p| is_solver_op(model, p))
        .count()
}

/// Lowest common single ancestor of the parallel branches leaving `begin`.
///
/// A parenthesis-matching walk over the topological order: branch count
/// accumulates (outputs - inputs) per node, and the first node where the
/// preceding count minus its own input count goes negative is the pivot
/// closing the parallel section.
pub fn lcsa(
    model: &ComputationModel,
    topo: &[OpId],
    begin: OpId,
    end: OpId,
) -> Result<OpId> {
    let mut following: i64 = 0;
    let mut at_start = false;

    for &node in topo {
        if node == begin {
            at_start = true;
            following = data_children(model, node).len() as i64 - 1;
            continue;
        }
        if !at_start {
            continue;
        }
        if node == end {
            return Ok(end);
        }
        if !is_solver_op(model, node)
            || matches!(model.op(node).kind, OpKind::Input | OpKind::Output)
        {
            continue;
        }

        let inputs = data_parent_count(model, node) as i64;
        let outputs = data_children(model, node).len() as i64;
        if inputs == 1 && outputs == 1 {
            continue;
        }

        let preceding = following;
        following += outputs - inputs;

        if preceding - inputs < 0 {
            return Ok(node);
        }
    }
    Err(Error::logic(
        PASS,
        format!(
            "pivot walk from '{}' reached the end of the graph unexpectedly",
            model.op(begin).name
        ),
    ))
}

/// Nodes reachable on more than one parallel path from `begin` to `end`
/// that are not `end` itself. These carry dependencies the layered solver
/// cannot represent.
pub fn non_exclusive_nodes(model: &ComputationModel, begin: OpId, end: OpId) -> Vec<OpId> {
    let mut seen = std::collections::HashSet::new();
    let mut flagged = Vec::new();

    for start in data_children(model, begin) {
        // DFS one branch up to `end`.
        let mut stack = vec![start];
        let mut branch_visited = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == end || !branch_visited.insert(node) {
                continue;
            }
            if !seen.insert(node) && data_parent_count(model, node) != 1 {
                if !flagged.contains(&node) {
                    flagged.push(node);
                }
            }
            for child in data_children(model, node) {
                if child != end {
                    stack.push(child);
                }
            }
        }
    }
    flagged
}

/// Book-keeping so the repair can be undone after solving.
#[derive(Debug, Default)]
pub struct RepairLog {
    pub added: Vec<(TensorId, OpId)>,
    pub removed: Vec<mosaic_core::model::FlowRecord>,
}

/// Cut all but one input edge of each non-exclusive node, reconnect the cut
/// producers directly to the LCSA, and force every touched node to
/// clustering for the solve.
pub fn repair_non_exclusive(
    model: &mut ComputationModel,
    nodes: &[OpId],
    lcsa: OpId,
    log: &mut RepairLog,
) -> Result<()> {
    for &node in nodes {
        let inputs: Vec<TensorId> = model.op(node).inputs.clone();
        let mut data_inputs_found = 0;
        for tensor in inputs {
            let source = match model.source_op(tensor) {
                Some(s) if is_solver_op(model, s) => s,
                _ => continue,
            };
            data_inputs_found += 1;
            if data_inputs_found <= 1 {
                continue;
            }

            force_clustering(model, source);
            let record = model.undefine_flow(tensor, node)?;
            log.removed.push(record);
            model.define_flow(tensor, lcsa);
            log.added.push((tensor, lcsa));
        }
        force_clustering(model, node);
    }
    force_clustering(model, lcsa);
    Ok(())
}

/// Undo the edge edits from `repair_non_exclusive` in reverse order.
pub fn revert_repair(model: &mut ComputationModel, log: RepairLog) -> Result<()> {
    for (tensor, sink) in log.added.into_iter().rev() {
        model.undefine_flow(tensor, sink)?;
    }
    for record in log.removed.into_iter().rev() {
        model.restore_flow(record);
    }
    Ok(())
}

fn force_clustering(model: &mut ComputationModel, op: OpId) {
    model
        .op_mut(op)
        .attrs
        .set("force_clustering", AttrValue::Bool(true));
}
