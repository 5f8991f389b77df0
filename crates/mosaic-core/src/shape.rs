//! Tensor shapes and layout orders.
//!
//! Shapes are stored W,H,C,N internally (index 0 is the innermost spatial
//! dimension). The serialiser reverses into most-significant-first order at
//! emission time; nothing else in the compiler should.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Dimension slots of the internal WHCN layout.
pub const IO_WIDTH: usize = 0;
pub const IO_HEIGHT: usize = 1;
pub const IO_CHANNEL: usize = 2;
pub const IO_BATCH: usize = 3;

/// Weight tensors reuse the same four slots.
pub const KERNEL_WIDTH: usize = 0;
pub const KERNEL_HEIGHT: usize = 1;
pub const KERNEL_INPUT_CHANNELS: usize = 2;
pub const KERNEL_OUTPUT_CHANNELS: usize = 3;

/// A four-dimensional shape in WHCN slot order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: [u64; 4],
}

impl Shape {
    pub const fn new(w: u64, h: u64, c: u64, n: u64) -> Self {
        Self { dims: [w, h, c, n] }
    }

    pub fn dims(&self) -> [u64; 4] {
        self.dims
    }

    pub fn width(&self) -> u64 {
        self.dims[IO_WIDTH]
    }

    pub fn height(&self) -> u64 {
        self.dims[IO_HEIGHT]
    }

    pub fn channels(&self) -> u64 {
        self.dims[IO_CHANNEL]
    }

    pub fn batch(&self) -> u64 {
        self.dims[IO_BATCH]
    }

    pub fn total_size(&self) -> u64 {
        self.dims.iter().product()
    }

    /// Volume without the batch dimension; workload validation compares
    /// against this because workloads never tile over N.
    pub fn total_size_no_batch(&self) -> u64 {
        self.dims[..3].iter().product()
    }

    pub fn set(&mut self, dim: usize, v: u64) {
        self.dims[dim] = v;
    }

    pub fn get(&self, dim: usize) -> u64 {
        self.dims[dim]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.dims[0], self.dims[1], self.dims[2], self.dims[3]
        )
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = u64;
    fn index(&self, i: usize) -> &u64 {
        &self.dims[i]
    }
}

/// A memory layout order: a permutation of the WHCN slots from outermost to
/// innermost stride. "NCHW" means N is the slowest-varying dimension and W
/// the fastest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    /// Slot indices, outermost first.
    perm: [usize; 4],
}

impl Order {
    pub fn nchw() -> Self {
        Self {
            perm: [IO_BATCH, IO_CHANNEL, IO_HEIGHT, IO_WIDTH],
        }
    }

    pub fn nhwc() -> Self {
        Self {
            perm: [IO_BATCH, IO_HEIGHT, IO_WIDTH, IO_CHANNEL],
        }
    }

    /// Column-major layout used for channel-major convolution inputs.
    pub fn col_major() -> Self {
        Self {
            perm: [IO_WIDTH, IO_HEIGHT, IO_CHANNEL, IO_BATCH],
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        if s.len() != 4 {
            return Err(Error::argument("order", format!("bad order string '{s}'")));
        }
        let mut perm = [0usize; 4];
        let mut seen = [false; 4];
        for (i, ch) in s.chars().enumerate() {
            let slot = match ch {
                'W' => IO_WIDTH,
                'H' => IO_HEIGHT,
                'C' => IO_CHANNEL,
                'N' => IO_BATCH,
                _ => {
                    return Err(Error::argument(
                        "order",
                        format!("bad axis '{ch}' in order '{s}'"),
                    ))
                }
            };
            if seen[slot] {
                return Err(Error::argument(
                    "order",
                    format!("repeated axis '{ch}' in order '{s}'"),
                ));
            }
            seen[slot] = true;
            perm[i] = slot;
        }
        Ok(Self { perm })
    }

    pub fn to_string(&self) -> String {
        self.perm
            .iter()
            .map(|&slot| match slot {
                IO_WIDTH => 'W',
                IO_HEIGHT => 'H',
                IO_CHANNEL => 'C',
                _ => 'N',
            })
            .collect()
    }

    /// Permutation slots, outermost first.
    pub fn perm(&self) -> [usize; 4] {
        self.perm
    }

    /// Per-slot strides in bytes for a contiguous tensor of `shape` with
    /// `elem_bytes`-wide elements. Returned in WHCN slot order.
    pub fn numeric_strides(&self, shape: &Shape, elem_bytes: u64) -> [u64; 4] {
        let mut strides = [0u64; 4];
        let mut running = elem_bytes;
        for &slot in self.perm.iter().rev() {
            strides[slot] = running;
            running *= shape.get(slot).max(1);
        }
        strides
    }

    /// Byte offset of a point inside a contiguous tensor of `shape`.
    pub fn linear_offset(&self, offset: &[u64; 4], shape: &Shape, elem_bytes: u64) -> u64 {
        let strides = self.numeric_strides(shape, elem_bytes);
        (0..4).map(|d| offset[d] * strides[d]).sum()
    }

    /// Packed decimal encoding of the permutation used by the blob format:
    /// each axis contributes its slot index + 1, outermost first, so
    /// leading zeros stay unambiguous.
    pub fn schema_code(&self) -> u64 {
        self.perm
            .iter()
            .fold(0u64, |acc, &slot| acc * 10 + slot as u64 + 1)
    }
}

impl Default for Order {
    fn default() -> Self {
        Self::nchw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_follow_permutation() {
        let shape = Shape::new(224, 224, 3, 1);
        let order = Order::nchw();
        let s = order.numeric_strides(&shape, 1);
        // NCHW: W innermost, then H, then C, then N.
        assert_eq!(s[IO_WIDTH], 1);
        assert_eq!(s[IO_HEIGHT], 224);
        assert_eq!(s[IO_CHANNEL], 224 * 224);
        assert_eq!(s[IO_BATCH], 224 * 224 * 3);
    }

    #[test]
    fn order_round_trips_through_string() {
        for s in ["NCHW", "NHWC", "WHCN"] {
            assert_eq!(Order::from_str(s).unwrap().to_string(), s);
        }
        assert!(Order::from_str("NCHQ").is_err());
        assert!(Order::from_str("NNHW").is_err());
    }
}
