//! Per-tensor / per-channel quantisation parameters.
//!
//! Carries both the frontend form (zero-point, scale, min, max) and the
//! lowered hardware form (multiplier, shift, post-shift). Per-channel
//! vectors are sliced in lock-step when a populated tensor is split over K.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub zero_point: Vec<i64>,
    pub scale: Vec<f64>,
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub mult: Vec<u32>,
    pub shift: Vec<u32>,
    pub post_shift: i8,
}

impl QuantParams {
    pub fn new(zero_point: Vec<i64>, scale: Vec<f64>, min: Vec<f64>, max: Vec<f64>) -> Self {
        let n = scale.len();
        Self {
            zero_point,
            scale,
            min,
            max,
            mult: vec![1; n],
            shift: vec![0; n],
            post_shift: 0,
        }
    }

    pub fn empty() -> Self {
        Self::new(vec![], vec![], vec![], vec![])
    }

    pub fn initial() -> Self {
        Self::new(
            vec![0],
            vec![1.0],
            vec![f64::NEG_INFINITY],
            vec![f64::INFINITY],
        )
    }

    /// Install lowered multiplier/shift values.
    pub fn quantize(&mut self, mult: Vec<u32>, shift: Vec<u32>) {
        self.mult = mult;
        self.shift = shift;
    }

    pub fn is_empty(&self) -> bool {
        self.zero_point.is_empty()
            && self.scale.is_empty()
            && self.min.is_empty()
            && self.max.is_empty()
    }

    /// Scale 1, zero-point 0 (within tolerance): quantisation is a no-op.
    pub fn is_neutral(&self) -> bool {
        let scale_neutral = self.scale.iter().all(|&s| (1.0 - s).abs() <= 0.001);
        let zp_neutral = self.zero_point.iter().sum::<i64>() == 0;
        scale_neutral && zp_neutral
    }

    /// The untouched frontend default: zp 0, scale 1, open range.
    pub fn is_initial(&self) -> bool {
        self.zero_point == [0]
            && self.scale == [1.0]
            && self.min.len() == 1
            && self.max.len() == 1
            && self.min[0] == f64::NEG_INFINITY
            && self.max[0] == f64::INFINITY
    }

    pub fn has_infinite_limits(&self) -> bool {
        if self.min.is_empty() || self.max.is_empty() {
            return true;
        }
        self.min
            .iter()
            .chain(self.max.iter())
            .any(|v| v.is_infinite())
    }

    pub fn is_per_tensor(&self) -> bool {
        self.scale.len() == 1
    }

    pub fn zero_point_for(&self, channel: usize) -> Option<i64> {
        if self.zero_point.len() == 1 {
            return self.zero_point.first().copied();
        }
        self.zero_point.get(channel).copied()
    }

    pub fn scale_for(&self, channel: usize) -> Option<f64> {
        if self.scale.len() == 1 {
            return self.scale.first().copied();
        }
        self.scale.get(channel).copied()
    }

    /// Per-channel slice for a SplitOverK subtensor. Per-tensor vectors
    /// (length 1) pass through unchanged.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        fn part<T: Clone>(v: &[T], start: usize, len: usize) -> Vec<T> {
            if v.len() > 1 {
                v.iter().skip(start).take(len).cloned().collect()
            } else {
                v.to_vec()
            }
        }
        Self {
            zero_point: part(&self.zero_point, start, len),
            scale: part(&self.scale, start, len),
            min: part(&self.min, start, len),
            max: part(&self.max, start, len),
            mult: part(&self.mult, start, len),
            shift: part(&self.shift, start, len),
            post_shift: self.post_shift,
        }
    }
}

/// Collapse an all-equal vector to a single element; the serialiser emits
/// the reduced form when every channel shares one value.
pub fn reduce_quant_vector<T: PartialEq + Copy>(v: &[T]) -> Vec<T> {
    if v.len() > 1 && v.iter().all(|x| *x == v[0]) {
        vec![v[0]]
    } else {
        v.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_keeps_per_tensor_vectors() {
        let mut q = QuantParams::new(vec![5], vec![0.5, 0.25, 0.125, 0.0625], vec![], vec![]);
        q.quantize(vec![100, 200, 300, 400], vec![8, 8, 8, 8]);
        let s = q.slice(2, 2);
        assert_eq!(s.zero_point, vec![5]);
        assert_eq!(s.scale, vec![0.125, 0.0625]);
        assert_eq!(s.mult, vec![300, 400]);
    }

    #[test]
    fn reduction_collapses_uniform_vectors() {
        assert_eq!(reduce_quant_vector(&[7u32, 7, 7]), vec![7]);
        assert_eq!(reduce_quant_vector(&[7u32, 8]), vec![7, 8]);
    }
}
