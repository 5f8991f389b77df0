//! The compile entry point and its deterministic run summary.

use serde::{Deserialize, Serialize};

use mosaic_clustering::{consecutive_dma_workaround, ensure_split_strategies, generate_subtensors};
use mosaic_core::prelude::*;
use mosaic_scheduler::{
    insert_barriers, BarrierSchedule, DagAdapter, FeasibleMemoryScheduler, ScheduledKind,
    ScheduledOp,
};
use mosaic_serial::{assign_graphfile_indices, compress_populated_tensors, serialize};
use mosaic_strategy::StrategyManager;

use crate::passes::{
    generate_dpu_workloads, insert_dma_tasks, materialize_spills, pad_network_output,
};
use crate::session::Session;

/// Deterministic record of one compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub op_count: usize,
    pub tensor_count: usize,
    pub scheduled_tasks: usize,
    pub spill_writes: usize,
    pub spill_reads: usize,
    pub barrier_count: usize,
    pub blob_bytes: usize,
    /// blake3 over the serialised strategy choices.
    pub strategy_fingerprint: String,
    /// blake3 over the schedule emission order.
    pub schedule_fingerprint: String,
    /// blake3 over the emitted container payload.
    pub blob_fingerprint: String,
}

#[derive(Debug)]
pub struct CompileOutput {
    pub blob: Vec<u8>,
    pub schedule: Vec<ScheduledOp>,
    pub barriers: BarrierSchedule,
    pub summary: RunSummary,
}

/// Run the whole pipeline. A failing pass aborts the compilation; no
/// partial output is produced.
pub fn compile(model: &mut ComputationModel, session: &Session) -> Result<CompileOutput> {
    let config = &session.config;
    let target = &session.target;
    config.validate()?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        ops = model.op_count(),
        tensors = model.tensor_count(),
        clusters = config.number_of_clusters,
        "compilation start"
    );

    StrategyManager::new(model, config).optimize()?;
    insert_dma_tasks(model, session)?;
    generate_subtensors(model, config)?;
    ensure_split_strategies(model, config, target)?;
    consecutive_dma_workaround(model, config, target)?;
    generate_dpu_workloads(model, config)?;
    pad_network_output(model, config);
    compress_populated_tensors(model, config)?;
    assign_graphfile_indices(model);

    let strategy_fingerprint = fingerprint_strategies(model)?;

    let schedule = {
        let dag = DagAdapter::new(model, config);
        FeasibleMemoryScheduler::new(&dag, config.cmx_bytes, config.memory_bandwidth)?.run()?
    };
    let order = materialize_spills(model, session, &schedule)?;
    let barriers = insert_barriers(model, &order, config.enable_static_barriers)?;

    let blob = serialize(model, &order, &barriers, config, target)?;

    let schedule_fingerprint = {
        let names: Vec<&str> = order.iter().map(|&op| model.op(op).name.as_str()).collect();
        hex(blake3::hash(serde_json::to_string(&names)?.as_bytes()))
    };

    let summary = RunSummary {
        op_count: model.op_count(),
        tensor_count: model.tensor_count(),
        scheduled_tasks: order.len(),
        spill_writes: schedule
            .iter()
            .filter(|s| s.kind == ScheduledKind::SpillWrite)
            .count(),
        spill_reads: schedule
            .iter()
            .filter(|s| s.kind == ScheduledKind::SpillRead)
            .count(),
        barrier_count: barriers.len(),
        blob_bytes: blob.len(),
        strategy_fingerprint,
        schedule_fingerprint,
        blob_fingerprint: hex(blake3::hash(&blob)),
    };

    #[cfg(feature = "tracing")]
    tracing::info!(
        tasks = summary.scheduled_tasks,
        spills = summary.spill_writes,
        bytes = summary.blob_bytes,
        "compilation done"
    );

    Ok(CompileOutput {
        blob,
        schedule,
        barriers,
        summary,
    })
}

fn fingerprint_strategies(model: &ComputationModel) -> Result<String> {
    #[derive(Serialize)]
    struct Choice<'a> {
        name: &'a str,
        strategy: Option<SplitStrategy>,
        streaming: Option<[u64; 5]>,
        spilling: bool,
        pipelining: Pipelining,
    }
    let choices: Vec<Choice<'_>> = model
        .op_ids()
        .map(|id| {
            let op = model.op(id);
            Choice {
                name: &op.name,
                strategy: op.split_strategy,
                streaming: op.streaming,
                spilling: op.spilling,
                pipelining: op.pipelining,
            }
        })
        .collect();
    Ok(hex(blake3::hash(serde_json::to_string(&choices)?.as_bytes())))
}

fn hex(hash: blake3::Hash) -> String {
    hash.to_hex().to_string()
}
