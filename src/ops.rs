//! Float reference operations for the fixed topology.
//!
//! Plain nested loops over CHW slices; these produce the reference outputs
//! the integer recomputation in [`crate::conv`] is checked against. No
//! padding, stride 1, single image.

use crate::tensor::Tensor;

/// Valid (no-padding) output side length for a square input and kernel.
pub fn conv_out_side(input_side: usize, kernel_size: usize) -> usize {
    input_side - kernel_size + 1
}

/// 2D convolution over a `[C_in, H, W]` f32 tensor with `[C_out, C_in, k, k]`
/// weights and a per-output-channel bias. Output is `[C_out, H-k+1, W-k+1]`.
pub fn conv2d(input: &Tensor, weight: &Tensor, bias: &[f32], kernel_size: usize) -> Tensor {
    let (c_in, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2]);
    let c_out = weight.shape()[0];
    let k = kernel_size;
    let (out_h, out_w) = (conv_out_side(h, k), conv_out_side(w, k));

    let x = input.as_f32().expect("conv2d expects an f32 input");
    let wt = weight.as_f32().expect("conv2d expects f32 weights");
    let mut out = vec![0.0f32; c_out * out_h * out_w];

    for oc in 0..c_out {
        for oi in 0..out_h {
            for oj in 0..out_w {
                let mut acc = 0.0f64;
                for ic in 0..c_in {
                    for di in 0..k {
                        for dj in 0..k {
                            let x_idx = ic * h * w + (oi + di) * w + (oj + dj);
                            let w_idx = oc * c_in * k * k + ic * k * k + di * k + dj;
                            acc += x[x_idx] as f64 * wt[w_idx] as f64;
                        }
                    }
                }
                out[oc * out_h * out_w + oi * out_w + oj] = (acc + bias[oc] as f64) as f32;
            }
        }
    }

    Tensor::from_f32(out, &[c_out, out_h, out_w])
}

/// 2×2 max pooling followed by ReLU over a `[C, H, W]` tensor. The hardware
/// block fuses ReLU into the pooling stage, and max commutes with ReLU, so
/// this matches `relu(maxpool(x))`.
pub fn maxpool2_relu(input: &Tensor, size: usize) -> Tensor {
    let (c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2]);
    let (out_h, out_w) = (h / size, w / size);
    let x = input.as_f32().expect("maxpool2_relu expects an f32 input");
    let mut out = vec![0.0f32; c * out_h * out_w];

    for ch in 0..c {
        for oi in 0..out_h {
            for oj in 0..out_w {
                let mut best = f32::NEG_INFINITY;
                for di in 0..size {
                    for dj in 0..size {
                        let idx = ch * h * w + (oi * size + di) * w + (oj * size + dj);
                        best = best.max(x[idx]);
                    }
                }
                out[ch * out_h * out_w + oi * out_w + oj] = best.max(0.0);
            }
        }
    }

    Tensor::from_f32(out, &[c, out_h, out_w])
}

/// Row-major flatten of a `[C, H, W]` tensor into `[C*H*W]`.
pub fn flatten(input: &Tensor) -> Tensor {
    let x = input.as_f32().expect("flatten expects an f32 input");
    Tensor::from_f32(x.to_vec(), &[input.len()])
}

/// Fully connected layer: `out[o] = sum_i x[i] * w[o][i] + b[o]` with
/// `[O, I]` weights.
pub fn linear(input: &Tensor, weight: &Tensor, bias: &[f32]) -> Tensor {
    let (out_features, in_features) = (weight.shape()[0], weight.shape()[1]);
    let x = input.as_f32().expect("linear expects an f32 input");
    let wt = weight.as_f32().expect("linear expects f32 weights");

    let out = (0..out_features)
        .map(|o| {
            let row = &wt[o * in_features..(o + 1) * in_features];
            let acc: f64 = x.iter().zip(row).map(|(&xi, &wi)| xi as f64 * wi as f64).sum();
            (acc + bias[o] as f64) as f32
        })
        .collect();

    Tensor::from_f32(out, &[out_features])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv2d_shape_law() {
        let input = Tensor::from_f32(vec![0.0; 28 * 28], &[1, 28, 28]);
        let weight = Tensor::from_f32(vec![0.0; 3 * 1 * 5 * 5], &[3, 1, 5, 5]);
        let out = conv2d(&input, &weight, &[0.0; 3], 5);
        assert_eq!(out.shape(), &[3, 24, 24]);
    }

    #[test]
    fn conv2d_ones_sums_kernel_area() {
        // all-ones 1x6x6 input, all-ones 2x1x3x3 weights: every output is 9 + bias
        let input = Tensor::from_f32(vec![1.0; 36], &[1, 6, 6]);
        let weight = Tensor::from_f32(vec![1.0; 18], &[2, 1, 3, 3]);
        let out = conv2d(&input, &weight, &[0.5, -0.5], 3);
        assert_eq!(out.shape(), &[2, 4, 4]);
        for &v in &out.as_f32().unwrap()[..16] {
            assert!((v - 9.5).abs() < 1e-6);
        }
        for &v in &out.as_f32().unwrap()[16..] {
            assert!((v - 8.5).abs() < 1e-6);
        }
    }

    #[test]
    fn maxpool_takes_window_max_and_clips_negatives() {
        let input = Tensor::from_f32(
            vec![
                1.0, 2.0, -1.0, -2.0, //
                3.0, 4.0, -3.0, -4.0, //
                0.5, 0.0, 7.0, 6.0, //
                0.0, 0.25, 5.0, 8.0,
            ],
            &[1, 4, 4],
        );
        let out = maxpool2_relu(&input, 2);
        assert_eq!(out.shape(), &[1, 2, 2]);
        assert_eq!(out.as_f32().unwrap(), &[4.0, 0.0, 0.5, 8.0]);
    }

    #[test]
    fn linear_matches_hand_computation() {
        let x = Tensor::from_f32(vec![1.0, 2.0, 3.0], &[3]);
        let w = Tensor::from_f32(vec![1.0, 0.0, -1.0, 0.5, 0.5, 0.5], &[2, 3]);
        let out = linear(&x, &w, &[0.0, 1.0]);
        assert_eq!(out.as_f32().unwrap(), &[-2.0, 4.0]);
    }
}
