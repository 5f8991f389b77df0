//! Workload boxes and MPE micro-tile geometries.
//!
//! A workload is an axis-aligned integer box inside a DPU output (bounds are
//! inclusive), tagged with the MPE mode it executes under and its own
//! padding. Subtensor views reuse the same box type.

use serde::{Deserialize, Serialize};

/// The micro-tile geometry a DPU executes in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MpeMode {
    /// 4x4 spatial grid.
    Matrix,
    /// 1x16 vector.
    Vector,
    /// 16x1 vector.
    Vector16x1,
    Cuboid4x16,
    Cuboid8x16,
    Cuboid16x16,
}

impl MpeMode {
    /// (height, width) of the grid in cells.
    pub fn grid(&self) -> (u64, u64) {
        match self {
            MpeMode::Matrix => (4, 4),
            MpeMode::Vector => (1, 16),
            MpeMode::Vector16x1 => (16, 1),
            MpeMode::Cuboid4x16 => (4, 16),
            MpeMode::Cuboid8x16 => (8, 16),
            MpeMode::Cuboid16x16 => (16, 16),
        }
    }

    pub fn wire_code(&self) -> u8 {
        match self {
            MpeMode::Matrix => 0,
            MpeMode::Vector => 1,
            MpeMode::Vector16x1 => 2,
            MpeMode::Cuboid4x16 => 3,
            MpeMode::Cuboid8x16 => 4,
            MpeMode::Cuboid16x16 => 5,
        }
    }
}

/// Per-workload padding: left, right, top, bottom.
pub type Padding = [u16; 4];

/// An axis-aligned box with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub min_x: i64,
    pub max_x: i64,
    pub min_y: i64,
    pub max_y: i64,
    pub min_z: i64,
    pub max_z: i64,
    pub mpe_mode: MpeMode,
    pub padding: Padding,
}

impl Workload {
    pub fn new(mpe_mode: MpeMode) -> Self {
        Self {
            min_x: 0,
            max_x: 0,
            min_y: 0,
            max_y: 0,
            min_z: 0,
            max_z: 0,
            mpe_mode,
            padding: [0; 4],
        }
    }

    pub fn width(&self) -> u64 {
        (self.max_x - self.min_x + 1).max(0) as u64
    }

    pub fn height(&self) -> u64 {
        (self.max_y - self.min_y + 1).max(0) as u64
    }

    pub fn depth(&self) -> u64 {
        (self.max_z - self.min_z + 1).max(0) as u64
    }

    pub fn volume(&self) -> u64 {
        self.width() * self.height() * self.depth()
    }

    pub fn is_degenerate(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y || self.max_z < self.min_z
    }

    pub fn overlaps(&self, other: &Workload) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
            && self.min_z <= other.max_z
            && other.min_z <= self.max_z
    }
}
