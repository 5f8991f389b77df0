//! Tensor descriptors and cluster-local subtensor views.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::dtype::DType;
use crate::id::TensorId;
use crate::quant::QuantParams;
use crate::shape::{Order, Shape};

/// Where a tensor lives at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
    ProgrammableInput,
    ProgrammableOutput,
    ProfilingOutput,
    DdrHeap,
    DdrBss,
    /// Read-only blob packed into the executable.
    GraphFile,
    /// Per-cluster scratchpad used by DPU tasks.
    NnCmx,
    /// Scratchpad slice owned by the software (UPA) shaves.
    UpaCmx,
    Csram,
}

impl MemoryLocation {
    pub fn is_scratchpad(&self) -> bool {
        matches!(self, MemoryLocation::NnCmx | MemoryLocation::UpaCmx)
    }
}

/// Policy mapping one tensor onto N clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitStrategy {
    Clustering,
    SplitOverH,
    SplitOverHOverlapped,
    SplitOverK,
    HkSwitch,
    ClusteringAndSoh,
}

impl SplitStrategy {
    /// Broadcast strategies replicate the parent shape on every cluster.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, SplitStrategy::Clustering)
    }

    pub fn splits_height(&self) -> bool {
        matches!(
            self,
            SplitStrategy::SplitOverH
                | SplitStrategy::SplitOverHOverlapped
                | SplitStrategy::HkSwitch
                | SplitStrategy::ClusteringAndSoh
        )
    }
}

/// Set on a DMA-adjacent tensor when a producer/consumer strategy mismatch
/// was patched up after spilling; the serialiser reads it to decide whether
/// the source side behaves as broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverwriteStrategy {
    ClusteringToSoH,
    SoHToClustering,
}

/// Sparsity companions of a sparse tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sparsity {
    pub sparsity_map: TensorId,
    /// Activations carry a storage-element table; weights do not.
    pub storage_elements: Option<TensorId>,
}

/// A cluster-local view of a tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTensor {
    /// Start corner in the parent's WHCN coordinates.
    pub offset: [u64; 4],
    pub shape: Shape,
    pub address: Option<u64>,
    pub locale_index: u32,
    /// Byte offsets of this slice inside the parent's sparsity companions.
    pub sparsity_map_offset: Option<u64>,
    pub storage_element_offset: Option<u64>,
    pub quant: Option<QuantParams>,
}

impl SubTensor {
    pub fn byte_size(&self, dtype: DType) -> u64 {
        (self.shape.total_size() * dtype.size_bits() + 7) / 8
    }
}

/// A named, typed, shaped value owned by the computation model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub shape: Shape,
    pub order: Order,
    pub dtype: DType,
    pub quant: Option<QuantParams>,
    pub location: MemoryLocation,
    /// Populated tensors (weights, constants) are baked into the blob;
    /// unpopulated tensors (activations) are allocated at schedule time.
    pub populated: bool,
    pub sparsity: Option<Sparsity>,
    pub strategy: Option<SplitStrategy>,
    /// Per-cluster views; regenerated whenever the strategy changes.
    pub subtensors: Vec<SubTensor>,
    /// Second view set used only by ClusteringAndSoh: the producer writes
    /// through `subtensors` (broadcast), the consumer reads through these
    /// (split over H).
    pub consumer_subtensors: Vec<SubTensor>,
    /// True when every cluster holds the full tensor.
    pub broadcast: bool,
    pub address: Option<u64>,
    pub allocators: BTreeSet<String>,
    /// Packed byte length after weight compression, when it applied.
    pub compressed_size: Option<u64>,
    /// Index of this tensor's payload inside the blob's binary-data section.
    pub graphfile_index: Option<u32>,
    pub overwrite_strategy: Option<OverwriteStrategy>,
    pub base_ptrs: Vec<u16>,
    /// Raw payload of populated tensors, packed into the blob at emission.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Vec<u8>>,
}

impl TensorDesc {
    pub fn new(name: impl Into<String>, shape: Shape, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape,
            order: Order::default(),
            dtype,
            quant: None,
            location: MemoryLocation::DdrHeap,
            populated: false,
            sparsity: None,
            strategy: None,
            subtensors: Vec::new(),
            consumer_subtensors: Vec::new(),
            broadcast: false,
            address: None,
            allocators: BTreeSet::new(),
            compressed_size: None,
            graphfile_index: None,
            overwrite_strategy: None,
            base_ptrs: Vec::new(),
            data: None,
        }
    }

    pub fn populated(mut self) -> Self {
        self.populated = true;
        self.location = MemoryLocation::GraphFile;
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn is_sparse(&self) -> bool {
        self.sparsity.is_some()
    }

    pub fn has_subtensors(&self) -> bool {
        !self.subtensors.is_empty()
    }

    pub fn is_broadcasted(&self) -> bool {
        self.broadcast
    }

    /// Unpacked byte size from shape and dtype width. Compressed populated
    /// tensors record their packed length separately.
    pub fn byte_size(&self) -> u64 {
        (self.shape.total_size() * self.dtype.size_bits() + 7) / 8
    }

    /// Length of the payload the DMA engine actually moves.
    pub fn packed_byte_size(&self) -> u64 {
        self.compressed_size.unwrap_or_else(|| self.byte_size())
    }

    pub fn clear_subtensors(&mut self) {
        self.subtensors.clear();
        self.consumer_subtensors.clear();
        self.broadcast = false;
    }
}
