//! Fixed-width numeric element types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    U8,
    I8,
    I4,
    I2,
    Fp16,
    Bf16,
    Fp32,
    I32,
}

impl DType {
    pub fn size_bits(&self) -> u64 {
        match self {
            DType::I2 => 2,
            DType::I4 => 4,
            DType::U8 | DType::I8 => 8,
            DType::Fp16 | DType::Bf16 => 16,
            DType::Fp32 | DType::I32 => 32,
        }
    }

    /// Element size in whole bytes; sub-byte types round up.
    pub fn size_bytes(&self) -> u64 {
        (self.size_bits() + 7) / 8
    }

    /// Stable wire code used by the blob format.
    pub fn wire_code(&self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::I8 => 1,
            DType::I4 => 2,
            DType::I2 => 3,
            DType::Fp16 => 4,
            DType::Bf16 => 5,
            DType::Fp32 => 6,
            DType::I32 => 7,
        }
    }

    pub fn from_wire_code(v: u8) -> Option<Self> {
        Some(match v {
            0 => DType::U8,
            1 => DType::I8,
            2 => DType::I4,
            3 => DType::I2,
            4 => DType::Fp16,
            5 => DType::Bf16,
            6 => DType::Fp32,
            7 => DType::I32,
            _ => return None,
        })
    }
}
