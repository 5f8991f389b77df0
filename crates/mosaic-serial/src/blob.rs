//! The flat, versioned container.
//!
//! Layout: magic, version triple, device/revision, option flags, resource
//! block, blake3 hash of the payload, then the payload (net IO references,
//! the three task lists, the barrier table, and the packed binary-data
//! section). Identical inputs produce identical bytes.

use serde::{Deserialize, Serialize};

use mosaic_core::prelude::*;
use mosaic_core::target::Revision;
use mosaic_core::{Error, Result};

use crate::task::{BarrierEntry, Task};
use crate::tensor_ref::TensorReference;
use crate::wire::{Reader, Writer};

const MAGIC: &[u8; 4] = b"MOSB";

pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;
pub const VERSION_PATCH: u16 = 0;

pub const FLAG_PAD_OUTPUT: u32 = 1 << 0;
pub const FLAG_HUFFMAN: u32 = 1 << 1;
pub const FLAG_STATIC_BARRIERS: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub clusters: u32,
    pub dpus: u32,
    pub cmx_bytes: u64,
    pub ddr_scratch_bytes: u64,
    pub memory_bandwidth: f64,
    pub system_clock_mhz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub version: (u16, u16, u16),
    pub device: Device,
    pub revision: Revision,
    pub flags: u32,
    pub resources: Resources,
    pub net_inputs: Vec<TensorReference>,
    pub net_outputs: Vec<TensorReference>,
}

/// One packed populated tensor: U8 payload eight bytes per 64-bit word.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryEntry {
    pub name: String,
    pub original_len: u64,
    pub words: Vec<u64>,
}

impl BinaryEntry {
    pub fn from_bytes(name: impl Into<String>, data: &[u8]) -> Self {
        let mut padded = data.to_vec();
        while padded.len() % 8 != 0 {
            padded.push(0);
        }
        let words = padded
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect();
        Self {
            name: name.into(),
            original_len: data.len() as u64,
            words,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out: Vec<u8> = self
            .words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        out.truncate(self.original_len as usize);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub header: Header,
    /// DPU and software tasks in schedule order.
    pub compute_tasks: Vec<Task>,
    pub dma_tasks: Vec<Task>,
    pub barrier_tasks: Vec<Task>,
    pub barrier_table: Vec<BarrierEntry>,
    pub binary_data: Vec<BinaryEntry>,
    /// Populated-data offsets align to this inside the section.
    pub weight_alignment: u64,
}

impl Blob {
    pub fn emit(&self) -> Vec<u8> {
        let mut payload = Writer::new();
        emit_ref_list(&mut payload, &self.header.net_inputs);
        emit_ref_list(&mut payload, &self.header.net_outputs);

        for list in [&self.compute_tasks, &self.dma_tasks, &self.barrier_tasks] {
            payload.u32(list.len() as u32);
            for task in list.iter() {
                task.emit(&mut payload);
            }
        }

        payload.u32(self.barrier_table.len() as u32);
        for entry in &self.barrier_table {
            entry.emit(&mut payload);
        }

        payload.u64(self.weight_alignment);
        payload.u32(self.binary_data.len() as u32);
        for entry in &self.binary_data {
            payload.str(&entry.name);
            payload.u64(entry.original_len);
            payload.align(self.weight_alignment as usize);
            payload.u32(entry.words.len() as u32);
            for &w in &entry.words {
                payload.u64(w);
            }
        }

        let payload = payload.into_bytes();
        let hash = blake3::hash(&payload);

        let mut out = Writer::new();
        out.bytes(MAGIC);
        out.u16(self.header.version.0);
        out.u16(self.header.version.1);
        out.u16(self.header.version.2);
        out.u8(self.header.device.wire_code());
        out.u8(self.header.revision.wire_code());
        out.u32(self.header.flags);
        out.u32(self.header.resources.clusters);
        out.u32(self.header.resources.dpus);
        out.u64(self.header.resources.cmx_bytes);
        out.u64(self.header.resources.ddr_scratch_bytes);
        out.f64(self.header.resources.memory_bandwidth);
        out.f64(self.header.resources.system_clock_mhz);
        out.bytes(hash.as_bytes());
        out.bytes(&payload);
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Blob> {
        let mut r = Reader::new(bytes);
        let magic = r.bytes(4)?;
        if magic != MAGIC {
            return Err(Error::runtime("serialiser", "bad container magic"));
        }
        let version = (r.u16()?, r.u16()?, r.u16()?);
        let device = Device::from_wire_code(r.u8()?)
            .ok_or_else(|| Error::runtime("serialiser", "unknown device code"))?;
        let revision = match r.u8()? {
            0 => Revision::A0,
            1 => Revision::B0,
            2 => Revision::None,
            other => {
                return Err(Error::runtime(
                    "serialiser",
                    format!("unknown revision code {other}"),
                ))
            }
        };
        let flags = r.u32()?;
        let resources = Resources {
            clusters: r.u32()?,
            dpus: r.u32()?,
            cmx_bytes: r.u64()?,
            ddr_scratch_bytes: r.u64()?,
            memory_bandwidth: r.f64()?,
            system_clock_mhz: r.f64()?,
        };
        let stored_hash = r.bytes(32)?;

        let payload_start = r.pos();
        let payload = &bytes[payload_start..];
        let hash = blake3::hash(payload);
        if hash.as_bytes() != stored_hash.as_slice() {
            return Err(Error::runtime("serialiser", "container hash mismatch"));
        }

        let mut r = Reader::new(payload);
        let net_inputs = parse_ref_list(&mut r)?;
        let net_outputs = parse_ref_list(&mut r)?;

        let mut lists: Vec<Vec<Task>> = Vec::with_capacity(3);
        for _ in 0..3 {
            let count = r.u32()? as usize;
            let mut tasks = Vec::with_capacity(count);
            for _ in 0..count {
                tasks.push(Task::parse(&mut r)?);
            }
            lists.push(tasks);
        }
        let barrier_tasks = lists.pop().unwrap_or_default();
        let dma_tasks = lists.pop().unwrap_or_default();
        let compute_tasks = lists.pop().unwrap_or_default();

        let table_count = r.u32()? as usize;
        let mut barrier_table = Vec::with_capacity(table_count);
        for _ in 0..table_count {
            barrier_table.push(BarrierEntry::parse(&mut r)?);
        }

        let weight_alignment = r.u64()?;
        let entry_count = r.u32()? as usize;
        let mut binary_data = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let name = r.str()?;
            let original_len = r.u64()?;
            r.align(weight_alignment as usize)?;
            let word_count = r.u32()? as usize;
            let mut words = Vec::with_capacity(word_count);
            for _ in 0..word_count {
                words.push(r.u64()?);
            }
            binary_data.push(BinaryEntry {
                name,
                original_len,
                words,
            });
        }

        Ok(Blob {
            header: Header {
                version,
                device,
                revision,
                flags,
                resources,
                net_inputs,
                net_outputs,
            },
            compute_tasks,
            dma_tasks,
            barrier_tasks,
            barrier_table,
            binary_data,
            weight_alignment,
        })
    }
}

fn emit_ref_list(w: &mut Writer, refs: &[TensorReference]) {
    w.u32(refs.len() as u32);
    for r in refs {
        r.emit(w);
    }
}

fn parse_ref_list(r: &mut Reader<'_>) -> Result<Vec<TensorReference>> {
    let count = r.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(TensorReference::parse(r)?);
    }
    Ok(out)
}
