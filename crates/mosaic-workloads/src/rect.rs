//! The rectangle heuristic.
//!
//! Stages: pick the best-scoring MPE padding, search symmetric factor
//! splits, optionally search L-shaped (non-symmetric) splits, then scale
//! the winning slicing back to tensor coordinates and clip to the unpadded
//! extents.

use serde::{Deserialize, Serialize};

use mosaic_core::shape::{IO_BATCH, IO_CHANNEL, IO_HEIGHT, IO_WIDTH, KERNEL_OUTPUT_CHANNELS};
use mosaic_core::workload::{MpeMode, Workload};
use mosaic_core::shape::Shape;

/// An MPE grid candidate: H cells by W cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpuMode {
    pub h: u64,
    pub w: u64,
}

impl DpuMode {
    pub const fn new(h: u64, w: u64) -> Self {
        Self { h, w }
    }

    fn mpe_mode(&self) -> MpeMode {
        match (self.h, self.w) {
            (4, 4) => MpeMode::Matrix,
            (16, 1) => MpeMode::Vector16x1,
            (4, 16) => MpeMode::Cuboid4x16,
            (8, 16) => MpeMode::Cuboid8x16,
            (16, 16) => MpeMode::Cuboid16x16,
            _ => MpeMode::Vector,
        }
    }
}

/// Which axes the 2-D slicer works over. The C-substituting modes put the
/// channel dimension onto one planar axis and keep the displaced axis as the
/// workload's third extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitMode {
    H,
    Hw,
    Hc,
    Wc,
    Nc,
}

#[derive(Debug, Clone, Copy)]
struct Shape2d {
    h: u64,
    w: u64,
}

#[derive(Debug, Clone, Copy)]
struct PaddingVariant {
    original: Shape2d,
    padded: Shape2d,
    reduced: Shape2d,
    mode: DpuMode,
}

fn div_round_up(x: u64, m: u64) -> u64 {
    (x + m - 1) / m
}

fn pad_round_up(x: u64, m: u64) -> u64 {
    div_round_up(x, m) * m
}

fn estimate_efficiency(original: Shape2d, padded: Shape2d) -> f64 {
    let o = (original.h * original.w) as f64;
    let p = (padded.h * padded.w) as f64;
    o / p
}

/// Round the shape up to each candidate mode and keep the least wasteful.
fn select_padding(original: Shape2d, mode_list: &[DpuMode]) -> Option<PaddingVariant> {
    let mut best_efficiency = 0.0;
    let mut best = None;

    for &mode in mode_list {
        let padded = Shape2d {
            h: pad_round_up(original.h, mode.h),
            w: pad_round_up(original.w, mode.w),
        };
        let efficiency = estimate_efficiency(original, padded);
        if best_efficiency < efficiency {
            best_efficiency = efficiency;
            let reduced = Shape2d {
                h: padded.h / mode.h,
                w: padded.w / mode.w,
            };
            best = Some(PaddingVariant {
                original,
                padded,
                reduced,
                mode,
            });
        }
    }
    best
}

/// Factor pairs (i, n/i) with i <= sqrt(n).
fn split_factors(n: u64) -> Vec<(u64, u64)> {
    let mut factors = Vec::new();
    let i_max = (n as f64).sqrt().ceil() as u64;
    for i in 1..=i_max.max(1) {
        if n % i == 0 {
            factors.push((i, n / i));
        }
    }
    factors
}

/// Lower is better; infinity marks a forbidden or impossible split.
fn estimate_split_balance(
    w: u64,
    h: u64,
    x: u64,
    y: u64,
    split_over_h: bool,
    split_over_w: bool,
) -> f64 {
    if !split_over_h && y > 1 {
        return f64::INFINITY;
    }
    if !split_over_w && x > 1 {
        return f64::INFINITY;
    }
    if h < y || w < x {
        return f64::INFINITY;
    }
    ((w % x) * h + (h % y) * w) as f64
}

#[derive(Debug, Clone, Copy)]
struct Slice {
    x0: u64,
    x1: u64,
    y0: u64,
    y1: u64,
}

#[derive(Debug, Clone)]
struct SliceVariant {
    slices: Vec<Slice>,
    cost: f64,
}

fn split_slice_symmetric(
    w: u64,
    h: u64,
    n: u64,
    split_over_h: bool,
    split_over_w: bool,
) -> SliceVariant {
    let mut best_cost = f64::INFINITY;
    let mut best_factors = (1, n);

    for (a, b) in split_factors(n) {
        for (x, y) in [(a, b), (b, a)] {
            let cost = estimate_split_balance(w, h, x, y, split_over_h, split_over_w);
            if best_cost > cost {
                best_cost = cost;
                best_factors = (x, y);
            }
        }
    }

    if best_cost.is_infinite() {
        return SliceVariant {
            slices: Vec::new(),
            cost: best_cost,
        };
    }

    let (x_factor, y_factor) = best_factors;
    let dx = div_round_up(w, x_factor);
    let dy = div_round_up(h, y_factor);

    let mut slices = Vec::new();
    let mut x = 0;
    while x * dx < w {
        let mut y = 0;
        while y * dy < h {
            slices.push(Slice {
                x0: x * dx,
                x1: ((x + 1) * dx).min(w),
                y0: y * dy,
                y1: ((y + 1) * dy).min(h),
            });
            y += 1;
        }
        x += 1;
    }

    SliceVariant {
        slices,
        cost: best_cost,
    }
}

#[derive(Debug, Clone, Copy)]
struct NonSymmetricVariant {
    factors: (u64, u64),
    xss: u64,
    yss: u64,
    cut_along_h: bool,
    cost: f64,
}

/// L-shaped splits: one slab of K+1 strips cut along the longer axis, the
/// remainder tiled symmetrically.
fn best_split_non_symmetric(
    w: u64,
    h: u64,
    n: u64,
    split_over_h: bool,
    split_over_w: bool,
) -> Option<NonSymmetricVariant> {
    let mut best: Option<NonSymmetricVariant> = None;
    if n < 2 {
        return None;
    }

    for (mut k, mut p) in split_factors(n - 1) {
        if k > p {
            std::mem::swap(&mut k, &mut p);
        }
        if k == 1 {
            continue;
        }

        let long = h.max(w) as f64;
        let short = h.min(w) as f64;
        let a1 = (long * (k + 1) as f64 / n as f64).ceil() as u64;
        let a2 = (short / (k + 1) as f64).ceil() as u64;
        let a3 = (short * (k + 1) as f64 / n as f64).floor() as u64;
        let a4 = (long / (k + 1) as f64).ceil() as u64;

        let mut consider = |cost: f64, factors: (u64, u64), xss: u64, yss: u64, cut_along_h| {
            if best.map(|b| b.cost).unwrap_or(f64::INFINITY) > cost {
                best = Some(NonSymmetricVariant {
                    factors,
                    xss,
                    yss,
                    cut_along_h,
                    cost,
                });
            }
        };

        if h >= w {
            let cost0 = estimate_split_balance(a3, h, 1, k + 1, split_over_h, split_over_w)
                + estimate_split_balance(w.saturating_sub(a3), h, p - 1, k, split_over_h, split_over_w);
            consider(cost0, (p, k), a3, a4, true);

            let cost1 = estimate_split_balance(w, a1, k + 1, 1, split_over_h, split_over_w)
                + estimate_split_balance(w, h.saturating_sub(a1), k, p - 1, split_over_h, split_over_w);
            consider(cost1, (k, p), a2, a1, false);
        } else {
            let cost2 = estimate_split_balance(a1, h, 1, k + 1, split_over_h, split_over_w)
                + estimate_split_balance(w.saturating_sub(a1), h, p - 1, k, split_over_h, split_over_w);
            consider(cost2, (p, k), a1, a2, true);

            let cost3 = estimate_split_balance(w, a3, k + 1, 1, split_over_h, split_over_w)
                + estimate_split_balance(w, h.saturating_sub(a3), k, p - 1, split_over_h, split_over_w);
            consider(cost3, (k, p), a4, a3, false);
        }
    }

    best
}

fn split_slice_non_symmetric(
    w: u64,
    h: u64,
    n: u64,
    split_over_h: bool,
    split_over_w: bool,
) -> SliceVariant {
    let best = match best_split_non_symmetric(w, h, n, split_over_h, split_over_w) {
        Some(v) if v.cost.is_finite() && v.xss > 0 && v.yss > 0 => v,
        _ => {
            return SliceVariant {
                slices: Vec::new(),
                cost: f64::INFINITY,
            }
        }
    };

    let (mut x_factor, mut y_factor) = best.factors;
    let (xss, yss) = (best.xss, best.yss);
    let mut slices = Vec::new();
    let mut x_start = 0;
    let mut y_start = 0;

    if best.cut_along_h {
        let mut y = 0;
        while y * yss < h {
            slices.push(Slice {
                x0: 0,
                x1: xss,
                y0: y * yss,
                y1: ((y + 1) * yss).min(h),
            });
            y += 1;
        }
        x_start = xss;
        x_factor -= 1;
    } else {
        let mut x = 0;
        while x * xss < w {
            slices.push(Slice {
                x0: x * xss,
                x1: ((x + 1) * xss).min(w),
                y0: 0,
                y1: yss,
            });
            x += 1;
        }
        y_start = yss;
        y_factor -= 1;
    }

    if x_factor == 0 || y_factor == 0 {
        return SliceVariant {
            slices: Vec::new(),
            cost: f64::INFINITY,
        };
    }
    let x_size = div_round_up(w - x_start, x_factor);
    let y_size = div_round_up(h - y_start, y_factor);

    let mut x = 0;
    while x * x_size + x_start < w {
        let mut y = 0;
        while y * y_size + y_start < h {
            slices.push(Slice {
                x0: x * x_size + x_start,
                x1: ((x + 1) * x_size + x_start).min(w),
                y0: y * y_size + y_start,
                y1: ((y + 1) * y_size + y_start).min(h),
            });
            y += 1;
        }
        x += 1;
    }

    SliceVariant {
        slices,
        cost: best.cost,
    }
}

/// Scale the reduced-coordinate slices back to tensor coordinates, clip to
/// the unpadded extents, and tag each box with the chosen MPE mode. Slices
/// degenerating to nothing after the clip are dropped.
fn workloads_from_slices(
    slices: &[Slice],
    padding: &PaddingVariant,
    z: u64,
) -> Vec<Workload> {
    let x_coef = div_round_up(padding.padded.w, padding.reduced.w.max(1));
    let y_coef = div_round_up(padding.padded.h, padding.reduced.h.max(1));
    let mpe_mode = padding.mode.mpe_mode();

    let mut out = Vec::with_capacity(slices.len());
    for slice in slices {
        let x_min = slice.x0 * x_coef;
        let y_min = slice.y0 * y_coef;
        let x_max = slice.x1 * x_coef;
        let y_max = slice.y1 * y_coef;

        if x_min >= padding.original.w || y_min >= padding.original.h {
            continue;
        }

        let mut wl = Workload::new(mpe_mode);
        wl.min_x = x_min as i64;
        wl.min_y = y_min as i64;
        wl.max_x = (x_max.min(padding.original.w) as i64) - 1;
        wl.max_y = (y_max.min(padding.original.h) as i64) - 1;
        wl.min_z = 0;
        wl.max_z = if z > 0 { z as i64 - 1 } else { 0 };
        if wl.is_degenerate() {
            continue;
        }
        out.push(wl);
    }
    out
}

/// Run the full heuristic over `shape`. Returns the generated boxes or
/// `None` when no finite-cost slicing exists under the constraints.
pub(crate) fn partition(
    shape: &Shape,
    populated: bool,
    mode_list: &[DpuMode],
    n_workloads: u64,
    split_over_h: bool,
    split_over_w: bool,
    split_symmetric: bool,
    split_mode: SplitMode,
) -> Option<Vec<Workload>> {
    let w = shape.get(IO_WIDTH);
    let h = shape.get(IO_HEIGHT);
    let c = shape.get(IO_CHANNEL);

    let mut original = Shape2d { h, w };
    match split_mode {
        SplitMode::Hc => original.w = c,
        SplitMode::Wc => original.h = c,
        SplitMode::Nc => {
            // Channel split: the planar slicer works over the channel axis
            // alone; which slot carries it depends on populatedness.
            if populated {
                original.h = shape.get(KERNEL_OUTPUT_CHANNELS);
                original.w = 1;
            } else {
                original.w = c;
                original.h = shape.get(IO_BATCH).max(1);
            }
        }
        SplitMode::H | SplitMode::Hw => {}
    }
    if original.h == 0 || original.w == 0 {
        return None;
    }

    let padding = select_padding(original, mode_list)?;

    let mut variant = split_slice_symmetric(
        padding.reduced.w,
        padding.reduced.h,
        n_workloads,
        split_over_h,
        split_over_w,
    );
    if !split_symmetric {
        let non_symmetric = split_slice_non_symmetric(
            padding.reduced.w,
            padding.reduced.h,
            n_workloads,
            split_over_h,
            split_over_w,
        );
        if variant.cost > non_symmetric.cost {
            variant = non_symmetric;
        }
    }
    if variant.cost.is_infinite() {
        return None;
    }

    let z = match split_mode {
        SplitMode::Hc => w,
        SplitMode::Wc => h,
        SplitMode::Nc => 0,
        SplitMode::H | SplitMode::Hw => c,
    };

    Some(workloads_from_slices(&variant.slices, &padding, z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_prefers_exact_fit() {
        let original = Shape2d { h: 56, w: 56 };
        let modes = [DpuMode::new(4, 4), DpuMode::new(1, 16)];
        let best = select_padding(original, &modes).unwrap();
        // 56 divides by 4 exactly; 1x16 would pad W to 64.
        assert_eq!(best.mode.h, 4);
        assert_eq!(best.reduced.h, 14);
        assert_eq!(best.reduced.w, 14);
    }

    #[test]
    fn symmetric_split_covers_whole_grid() {
        let v = split_slice_symmetric(14, 14, 4, true, true);
        assert!(v.cost.is_finite());
        assert_eq!(v.slices.len(), 4);
        let area: u64 = v
            .slices
            .iter()
            .map(|s| (s.x1 - s.x0) * (s.y1 - s.y0))
            .sum();
        assert_eq!(area, 14 * 14);
    }

    #[test]
    fn forbidden_axis_is_infinite() {
        assert!(estimate_split_balance(8, 8, 2, 1, true, false).is_infinite());
        assert!(estimate_split_balance(8, 8, 1, 2, false, true).is_infinite());
        assert!(estimate_split_balance(2, 2, 4, 1, true, true).is_infinite());
    }
}
