//! Target device descriptor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    Ma2490,
    Ma3100,
    Ma3720,
}

impl Device {
    pub fn wire_code(&self) -> u8 {
        match self {
            Device::Ma2490 => 0,
            Device::Ma3100 => 1,
            Device::Ma3720 => 2,
        }
    }

    pub fn from_wire_code(v: u8) -> Option<Self> {
        Some(match v {
            0 => Device::Ma2490,
            1 => Device::Ma3100,
            2 => Device::Ma3720,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Revision {
    A0,
    B0,
    None,
}

impl Revision {
    pub fn wire_code(&self) -> u8 {
        match self {
            Revision::A0 => 0,
            Revision::B0 => 1,
            Revision::None => 2,
        }
    }
}

/// Parameters of the weight-compression engine on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecDescriptor {
    pub block_size: u32,
    pub bits_per_symbol: u32,
}

impl Default for CodecDescriptor {
    fn default() -> Self {
        Self {
            block_size: 4096,
            bits_per_symbol: 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub device: Device,
    pub revision: Revision,
    pub codec: CodecDescriptor,
    /// Alignment of populated-data offsets inside the blob.
    pub weight_alignment: u64,
}

impl Default for TargetDescriptor {
    fn default() -> Self {
        Self {
            device: Device::Ma2490,
            revision: Revision::A0,
            codec: CodecDescriptor::default(),
            weight_alignment: 64,
        }
    }
}

impl TargetDescriptor {
    /// Channel-major convolution exists as a distinct hardware path only on
    /// the older devices.
    pub fn supports_channel_major(&self) -> bool {
        !matches!(self.device, Device::Ma3720)
    }
}
