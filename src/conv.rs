//! Fixed-point recomputation of quantized layers.
//!
//! Reproduces a quantized conv or fully-connected output purely from the
//! integer weights, integer bias, and the rescaled input, without touching the
//! reference path. Accumulation is in f64: the widest layer sums 3 * 25 terms
//! of magnitude up to 255 * 255, far inside f64's exact-integer range.
//!
//! Output channels share nothing, so they are distributed across rayon's
//! worker pool with each task owning its own output slab.

use rayon::prelude::*;

use crate::error::{QuantError, Result};
use crate::ops::conv_out_side;
use crate::quantize::QuantizationParams;

/// Sliding-window integer MAC convolution. `input` is the activation divided
/// by its scale (so one unit is one quantization step), laid out `[C_in, H, W]`;
/// `weight` is `[C_out, C_in, k, k]` int8, `bias` one int32 per output channel.
/// Returns the raw accumulator grid `[C_out, H-k+1, W-k+1]`.
pub struct FixedPointConvolver {
    pub kernel_size: usize,
}

impl FixedPointConvolver {
    pub fn new(kernel_size: usize) -> Self {
        FixedPointConvolver { kernel_size }
    }

    pub fn convolve(
        &self,
        input: &[f64],
        in_shape: [usize; 3],
        weight: &[i8],
        c_out: usize,
        bias: &[i32],
    ) -> Vec<f64> {
        let [c_in, h, w] = in_shape;
        let k = self.kernel_size;
        let (out_h, out_w) = (conv_out_side(h, k), conv_out_side(w, k));
        debug_assert_eq!(input.len(), c_in * h * w);
        debug_assert_eq!(weight.len(), c_out * c_in * k * k);

        let plane = out_h * out_w;
        let mut out = vec![0.0f64; c_out * plane];

        out.par_chunks_mut(plane).enumerate().for_each(|(oc, slab)| {
            for oi in 0..out_h {
                for oj in 0..out_w {
                    let mut acc = 0.0f64;
                    for ic in 0..c_in {
                        for di in 0..k {
                            for dj in 0..k {
                                let x_idx = ic * h * w + (oi + di) * w + (oj + dj);
                                let w_idx = oc * c_in * k * k + ic * k * k + di * k + dj;
                                acc += input[x_idx] * weight[w_idx] as f64;
                            }
                        }
                    }
                    slab[oi * out_w + oj] = acc + bias[oc] as f64;
                }
            }
        });

        out
    }
}

/// Integer matrix-multiply analogue for the fully-connected layer:
/// `out[o] = sum_i input[i] * weight[o][i] + bias[o]` with `[O, I]` weights.
pub fn fully_connected(input: &[f64], weight: &[i8], out_features: usize, bias: &[i32]) -> Vec<f64> {
    let in_features = input.len();
    debug_assert_eq!(weight.len(), out_features * in_features);

    (0..out_features)
        .map(|o| {
            let row = &weight[o * in_features..(o + 1) * in_features];
            let acc: f64 = input.iter().zip(row).map(|(&x, &w)| x * w as f64).sum();
            acc + bias[o] as f64
        })
        .collect()
}

/// Scale a raw integer accumulator grid back to activation units.
pub fn rescale(acc: &[f64], input: &QuantizationParams, weight: &QuantizationParams) -> Vec<f64> {
    let factor = input.scale * weight.scale;
    acc.iter().map(|&v| v * factor).collect()
}

/// Per-layer comparison of the reference output against the integer
/// recomputation. A mismatch beyond tolerance is a diagnostic finding, not a
/// failure; the export report carries it to the human auditor.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationSummary {
    pub layer: String,
    pub max_abs_error: f64,
    pub tolerance: f64,
    pub mismatches: usize,
    pub total: usize,
}

impl VerificationSummary {
    pub fn compare(layer: &str, reference: &[f32], recomputed: &[f64], tolerance: f64) -> Self {
        debug_assert_eq!(reference.len(), recomputed.len());
        let mut max_abs_error = 0.0f64;
        let mut mismatches = 0;
        for (&r, &m) in reference.iter().zip(recomputed) {
            let err = (r as f64 - m).abs();
            max_abs_error = max_abs_error.max(err);
            if err > tolerance {
                mismatches += 1;
            }
        }
        VerificationSummary {
            layer: layer.to_string(),
            max_abs_error,
            tolerance,
            mismatches,
            total: reference.len(),
        }
    }

    /// Fraction of elements inside tolerance.
    pub fn agreement(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.total - self.mismatches) as f64 / self.total as f64
    }

    /// Strict entry point: fail unless at least `min_agreement` of elements
    /// are inside tolerance. The export path records the summary instead of
    /// calling this.
    pub fn check(&self, min_agreement: f64) -> Result<()> {
        if self.agreement() < min_agreement {
            return Err(QuantError::ToleranceExceeded {
                layer: self.layer.clone(),
                max_abs_error: self.max_abs_error,
                tolerance: self.tolerance,
                mismatches: self.mismatches,
                total: self.total,
            });
        }
        Ok(())
    }
}
