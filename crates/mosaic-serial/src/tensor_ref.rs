//! Per-tensor reference emission.
//!
//! Dimensions go out most-significant-first (the reverse of the internal
//! WHCN order); strides likewise, led by the element size. The locale pair
//! (locale, locale_index) plus `data_index` resolve the tensor inside its
//! memory at runtime.

use serde::{Deserialize, Serialize};

use mosaic_core::prelude::*;
use mosaic_core::quant::reduce_quant_vector;

use crate::wire::{Reader, Writer};

/// Sentinel for absent sparsity companions.
pub const NO_INDEX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Locale {
    GraphFile = 0,
    ProgrammableInput = 1,
    ProgrammableOutput = 2,
    DdrHeap = 3,
    DdrBss = 4,
    NnCmx = 5,
    UpaCmx = 6,
    Csram = 7,
    AbsoluteAddr = 8,
}

impl Locale {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Locale::GraphFile,
            1 => Locale::ProgrammableInput,
            2 => Locale::ProgrammableOutput,
            3 => Locale::DdrHeap,
            4 => Locale::DdrBss,
            5 => Locale::NnCmx,
            6 => Locale::UpaCmx,
            7 => Locale::Csram,
            8 => Locale::AbsoluteAddr,
            _ => {
                return Err(Error::runtime(
                    "serialiser",
                    format!("unknown locale code {v}"),
                ))
            }
        })
    }

    pub fn from_location(location: MemoryLocation) -> Self {
        match location {
            MemoryLocation::GraphFile => Locale::GraphFile,
            MemoryLocation::ProgrammableInput => Locale::ProgrammableInput,
            MemoryLocation::ProgrammableOutput | MemoryLocation::ProfilingOutput => {
                Locale::ProgrammableOutput
            }
            MemoryLocation::DdrHeap => Locale::DdrHeap,
            MemoryLocation::DdrBss => Locale::DdrBss,
            MemoryLocation::NnCmx => Locale::NnCmx,
            MemoryLocation::UpaCmx => Locale::UpaCmx,
            MemoryLocation::Csram => Locale::Csram,
        }
    }
}

/// The flat-binary tensor reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorReference {
    pub name: String,
    /// Most-significant-first.
    pub dimensions: Vec<u32>,
    /// Element size first, then most-significant-first byte strides.
    pub strides: Vec<u64>,
    pub dtype: DType,
    pub order_code: u64,
    pub locale: Locale,
    pub locale_index: Vec<u32>,
    pub data_index: u64,
    pub sparsity_index: u64,
    pub storage_element_index: u64,
    pub quant_zero: Vec<u8>,
    pub quant_mult: Vec<u16>,
    pub quant_shift: Vec<u8>,
    pub quant_post_shift: i8,
    pub base_ptrs: Vec<u16>,
}

impl TensorReference {
    /// Reference for a whole tensor (single-cluster view).
    pub fn build(tensor: &TensorDesc) -> TensorReference {
        let dims = tensor.shape.dims();
        let strides = tensor
            .order
            .numeric_strides(&tensor.shape, tensor.dtype.size_bytes());

        let mut dimensions: Vec<u32> = dims.iter().map(|&d| d as u32).collect();
        dimensions.reverse();
        let mut stride_list: Vec<u64> = strides.to_vec();
        stride_list.push(tensor.dtype.size_bytes());
        stride_list.reverse();

        let (locale, locale_index, data_index) = locale_of(tensor, None);

        let mut reference = TensorReference {
            name: tensor.name.clone(),
            dimensions,
            strides: stride_list,
            dtype: tensor.dtype,
            order_code: tensor.order.schema_code(),
            locale,
            locale_index,
            data_index,
            sparsity_index: NO_INDEX,
            storage_element_index: NO_INDEX,
            quant_zero: Vec::new(),
            quant_mult: Vec::new(),
            quant_shift: Vec::new(),
            quant_post_shift: 0,
            base_ptrs: tensor.base_ptrs.clone(),
        };
        reference.apply_sparsity(tensor, None);
        reference.apply_quant(tensor.quant.as_ref());
        reference
    }

    /// Reference for one cluster's subtensor. Strides still come from the
    /// parent layout so the engines walk the slice inside the master
    /// buffer. Broadcast tensors keep the parent shape.
    pub fn build_for_cluster(tensor: &TensorDesc, cluster: usize) -> Result<TensorReference> {
        let sub = tensor.subtensors.get(cluster).ok_or_else(|| {
            Error::index(
                "serialiser",
                format!(
                    "tensor '{}' has no subtensor for cluster {cluster}",
                    tensor.name
                ),
            )
        })?;

        let mut reference = Self::build(tensor);
        reference.name = format!("{}_cluster{cluster}", tensor.name);
        if !tensor.is_broadcasted() {
            let mut dimensions: Vec<u32> =
                sub.shape.dims().iter().map(|&d| d as u32).collect();
            dimensions.reverse();
            reference.dimensions = dimensions;
        }

        let (locale, locale_index, data_index) = locale_of(tensor, Some(sub));
        reference.locale = locale;
        reference.locale_index = locale_index;
        reference.data_index = data_index;
        reference.apply_sparsity(tensor, Some(sub));
        if let Some(q) = &sub.quant {
            reference.apply_quant(Some(q));
        }
        Ok(reference)
    }

    /// Like `build_for_cluster`, but reading through the consumer-side view
    /// set of a ClusteringAndSoh double split.
    pub fn build_for_cluster_consumer(
        tensor: &TensorDesc,
        cluster: usize,
    ) -> Result<TensorReference> {
        let sub = tensor.consumer_subtensors.get(cluster).ok_or_else(|| {
            Error::index(
                "serialiser",
                format!(
                    "tensor '{}' has no consumer subtensor for cluster {cluster}",
                    tensor.name
                ),
            )
        })?;

        let mut reference = Self::build(tensor);
        reference.name = format!("{}_cluster{cluster}", tensor.name);
        let mut dimensions: Vec<u32> = sub.shape.dims().iter().map(|&d| d as u32).collect();
        dimensions.reverse();
        reference.dimensions = dimensions;

        let (locale, locale_index, data_index) = locale_of(tensor, Some(sub));
        reference.locale = locale;
        reference.locale_index = locale_index;
        reference.data_index = data_index;
        reference.apply_sparsity(tensor, Some(sub));
        if let Some(q) = &sub.quant {
            reference.apply_quant(Some(q));
        }
        Ok(reference)
    }

    fn apply_sparsity(&mut self, tensor: &TensorDesc, sub: Option<&SubTensor>) {
        if tensor.sparsity.is_none() {
            return;
        }
        match sub {
            Some(s) => {
                self.sparsity_index = s.sparsity_map_offset.unwrap_or(0);
                self.storage_element_index = if tensor.populated {
                    0
                } else {
                    s.storage_element_offset.unwrap_or(0)
                };
            }
            None => {
                self.sparsity_index = 0;
                self.storage_element_index = 0;
            }
        }
    }

    /// Zero-point emits one byte (element 0 only); multiplier and shift
    /// emit reduced when every channel agrees.
    fn apply_quant(&mut self, quant: Option<&QuantParams>) {
        let quant = match quant {
            Some(q) if !q.is_empty() => q,
            _ => return,
        };
        if let Some(zp) = quant.zero_point.first() {
            self.quant_zero = vec![*zp as u8];
        }
        let mult = reduce_quant_vector(&quant.mult);
        self.quant_mult = mult.iter().map(|&m| m as u16).collect();
        let shift = reduce_quant_vector(&quant.shift);
        self.quant_shift = shift.iter().map(|&s| s as u8).collect();
        self.quant_post_shift = quant.post_shift;
    }

    pub fn emit(&self, w: &mut Writer) {
        w.str(&self.name);
        w.u32(self.dimensions.len() as u32);
        for &d in &self.dimensions {
            w.u32(d);
        }
        w.u32(self.strides.len() as u32);
        for &s in &self.strides {
            w.u64(s);
        }
        w.u8(self.dtype.wire_code());
        w.u64(self.order_code);
        w.u8(self.locale as u8);
        w.u32(self.locale_index.len() as u32);
        for &i in &self.locale_index {
            w.u32(i);
        }
        w.u64(self.data_index);
        w.u64(self.sparsity_index);
        w.u64(self.storage_element_index);
        w.u32(self.quant_zero.len() as u32);
        w.bytes(&self.quant_zero);
        w.u32(self.quant_mult.len() as u32);
        for &m in &self.quant_mult {
            w.u16(m);
        }
        w.u32(self.quant_shift.len() as u32);
        w.bytes(&self.quant_shift);
        w.i8(self.quant_post_shift);
        w.u32(self.base_ptrs.len() as u32);
        for &p in &self.base_ptrs {
            w.u16(p);
        }
    }

    pub fn parse(r: &mut Reader<'_>) -> Result<TensorReference> {
        let name = r.str()?;
        let dim_count = r.u32()? as usize;
        let mut dimensions = Vec::with_capacity(dim_count);
        for _ in 0..dim_count {
            dimensions.push(r.u32()?);
        }
        let stride_count = r.u32()? as usize;
        let mut strides = Vec::with_capacity(stride_count);
        for _ in 0..stride_count {
            strides.push(r.u64()?);
        }
        let dtype = DType::from_wire_code(r.u8()?).ok_or_else(|| {
            Error::runtime("serialiser", "unknown dtype code in tensor reference")
        })?;
        let order_code = r.u64()?;
        let locale = Locale::from_u8(r.u8()?)?;
        let locale_count = r.u32()? as usize;
        let mut locale_index = Vec::with_capacity(locale_count);
        for _ in 0..locale_count {
            locale_index.push(r.u32()?);
        }
        let data_index = r.u64()?;
        let sparsity_index = r.u64()?;
        let storage_element_index = r.u64()?;
        let zero_count = r.u32()? as usize;
        let quant_zero = r.bytes(zero_count)?;
        let mult_count = r.u32()? as usize;
        let mut quant_mult = Vec::with_capacity(mult_count);
        for _ in 0..mult_count {
            quant_mult.push(r.u16()?);
        }
        let shift_count = r.u32()? as usize;
        let quant_shift = r.bytes(shift_count)?;
        let quant_post_shift = r.i8()?;
        let ptr_count = r.u32()? as usize;
        let mut base_ptrs = Vec::with_capacity(ptr_count);
        for _ in 0..ptr_count {
            base_ptrs.push(r.u16()?);
        }

        Ok(TensorReference {
            name,
            dimensions,
            strides,
            dtype,
            order_code,
            locale,
            locale_index,
            data_index,
            sparsity_index,
            storage_element_index,
            quant_zero,
            quant_mult,
            quant_shift,
            quant_post_shift,
            base_ptrs,
        })
    }
}

/// (locale, locale_index, data_index) for a tensor or one of its cluster
/// views.
fn locale_of(tensor: &TensorDesc, sub: Option<&SubTensor>) -> (Locale, Vec<u32>, u64) {
    let locale = Locale::from_location(tensor.location);
    match locale {
        Locale::GraphFile => {
            let index = tensor.graphfile_index.unwrap_or(0);
            // A cluster slice keeps its byte offset into the packed blob.
            let data_index = sub.and_then(|s| s.address).unwrap_or(0);
            (locale, vec![index], data_index)
        }
        Locale::ProgrammableInput | Locale::ProgrammableOutput => {
            // locale_index is the IO slot; a subtensor keeps its offset as
            // the data index into the slot.
            let slot = tensor.graphfile_index.unwrap_or(0);
            let data_index = sub
                .and_then(|s| s.address)
                .or(tensor.address)
                .unwrap_or(0);
            (locale, vec![slot], data_index)
        }
        _ => {
            let (index, data_index) = match sub {
                Some(s) => (s.locale_index, s.address.or(tensor.address).unwrap_or(0)),
                None => (0, tensor.address.unwrap_or(0)),
            };
            (locale, vec![index], data_index)
        }
    }
}
