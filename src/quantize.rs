//! Affine quantization parameters and the calibration observer.
//!
//! Quantization here is symmetric signed 8-bit: `q = round(x / scale)` with
//! the zero point fixed at 0. Weight and activation scales are derived as
//! `max(|value|) / 127.0`; the network-input scale comes from a
//! `MinMaxObserver` run over a short calibration pass instead.

use crate::error::{QuantError, Result};
use crate::tensor::{Tensor, TensorData};

pub const QMIN: i32 = -128;
pub const QMAX: i32 = 127;

/// Scale and zero point for exactly one tensor. Derived once per calibration
/// run and immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationParams {
    pub scale: f64,
    pub zero_point: i32,
}

impl QuantizationParams {
    /// Symmetric params with a caller-supplied scale. Zero or negative scale
    /// is a construction error.
    pub fn symmetric(scale: f64, tensor: &str) -> Result<Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(QuantError::DegenerateRange { tensor: tensor.to_string() });
        }
        Ok(QuantizationParams { scale, zero_point: 0 })
    }

    /// Derive the scale from a representative tensor: `max(|v|) / 127.0`.
    /// Non-finite values are ignored; an all-zero (or empty) tensor has no
    /// usable range and fails with `DegenerateRange`.
    pub fn derive(values: &[f32], tensor: &str) -> Result<Self> {
        let max_abs = values
            .iter()
            .filter(|v| v.is_finite())
            .fold(0.0f32, |m, &v| m.max(v.abs()));
        Self::symmetric(max_abs as f64 / QMAX as f64, tensor)
    }

    /// `round(x / scale)`, failing with `OutOfRange` instead of clamping.
    pub fn quantize_value(&self, x: f32, tensor: &str) -> Result<i8> {
        let q = (x as f64 / self.scale).round() as i64;
        if q < QMIN as i64 || q > QMAX as i64 {
            return Err(QuantError::OutOfRange { tensor: tensor.to_string(), value: q as i32 });
        }
        Ok(q as i8)
    }

    pub fn dequantize_value(&self, q: i8) -> f32 {
        (q as f64 * self.scale) as f32
    }
}

/// Quantize a float tensor elementwise, preserving shape.
pub fn quantize_tensor(t: &Tensor, params: &QuantizationParams, name: &str) -> Result<Tensor> {
    let values = t.as_f32().expect("quantize_tensor expects an f32 tensor");
    let quantized = values
        .iter()
        .map(|&x| params.quantize_value(x, name))
        .collect::<Result<Vec<i8>>>()?;
    Ok(Tensor::from_i8(quantized, t.shape()))
}

/// Dequantize an int8 tensor back to float, preserving shape.
pub fn dequantize_tensor(t: &Tensor, params: &QuantizationParams) -> Tensor {
    match t.data() {
        TensorData::I8(q) => {
            let values = q.iter().map(|&v| params.dequantize_value(v)).collect();
            Tensor::from_f32(values, t.shape())
        }
        _ => t.clone(),
    }
}

/// Quantize then dequantize, simulating the precision the hardware will see.
pub fn fake_quantize(t: &Tensor, params: &QuantizationParams, name: &str) -> Result<Tensor> {
    Ok(dequantize_tensor(&quantize_tensor(t, params, name)?, params))
}

/// Bias values live on the combined grid of the input and weight scales:
/// `q_b = round(b / (input_scale * weight_scale))`, kept in 32 bits.
pub fn quantize_bias(bias: &Tensor, input: &QuantizationParams, weight: &QuantizationParams) -> Tensor {
    let values = bias.as_f32().expect("quantize_bias expects an f32 bias tensor");
    let combined = input.scale * weight.scale;
    let quantized = values
        .iter()
        .map(|&b| (b as f64 / combined).round() as i32)
        .collect();
    Tensor::from_i32(quantized, bias.shape())
}

/// Tracks the value range seen over a calibration pass. Supplies the scale
/// for the very first activation (the network input), where no layer output
/// exists to derive one from.
#[derive(Debug, Clone)]
pub struct MinMaxObserver {
    min: f32,
    max: f32,
    observations: usize,
}

impl Default for MinMaxObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl MinMaxObserver {
    pub fn new() -> Self {
        MinMaxObserver { min: f32::INFINITY, max: f32::NEG_INFINITY, observations: 0 }
    }

    pub fn observe(&mut self, tensor: &Tensor) {
        if let Some(values) = tensor.as_f32() {
            for &v in values {
                if v.is_finite() {
                    self.min = self.min.min(v);
                    self.max = self.max.max(v);
                }
            }
            self.observations += 1;
        }
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Input quantization params from the observed range: `max(|min|, |max|) / 127`.
    pub fn input_params(&self) -> Result<QuantizationParams> {
        if self.observations == 0 {
            return Err(QuantError::DegenerateRange { tensor: "input".to_string() });
        }
        let max_abs = self.min.abs().max(self.max.abs());
        QuantizationParams::symmetric(max_abs as f64 / QMAX as f64, "input")
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_uses_max_abs() {
        let params = QuantizationParams::derive(&[0.5, -2.54, 1.0], "w").unwrap();
        // the max is accumulated in f32, so widen the same way
        assert!((params.scale - 2.54f32 as f64 / 127.0).abs() < 1e-12);
        assert_eq!(params.zero_point, 0);
    }

    #[test]
    fn zero_range_is_degenerate() {
        let err = QuantizationParams::derive(&[0.0, 0.0, 0.0], "w").unwrap_err();
        assert!(matches!(err, QuantError::DegenerateRange { .. }));
        assert!(QuantizationParams::derive(&[f32::NAN], "w").is_err());
    }

    #[test]
    fn round_trip_error_below_scale() {
        let values = vec![-1.3, -0.07, 0.0, 0.42, 0.9, 1.3];
        let t = Tensor::from_f32(values.clone(), &[6]);
        let params = QuantizationParams::derive(&values, "t").unwrap();
        let back = dequantize_tensor(&quantize_tensor(&t, &params, "t").unwrap(), &params);
        for (orig, rt) in values.iter().zip(back.as_f32().unwrap()) {
            assert!((orig - rt).abs() < params.scale as f32);
        }
    }

    #[test]
    fn derived_extremes_map_to_127() {
        let values = vec![-3.0, 3.0, 1.5];
        let params = QuantizationParams::derive(&values, "t").unwrap();
        assert_eq!(params.quantize_value(3.0, "t").unwrap(), 127);
        assert_eq!(params.quantize_value(-3.0, "t").unwrap(), -127);
    }

    #[test]
    fn out_of_range_is_not_clamped() {
        let params = QuantizationParams::symmetric(1.0, "t").unwrap();
        let err = params.quantize_value(200.0, "t").unwrap_err();
        match err {
            QuantError::OutOfRange { value, .. } => assert_eq!(value, 200),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bias_uses_combined_scale() {
        let bias = Tensor::from_f32(vec![0.02, -0.01], &[2]);
        let input = QuantizationParams::symmetric(0.01, "in").unwrap();
        let weight = QuantizationParams::symmetric(0.1, "w").unwrap();
        let q = quantize_bias(&bias, &input, &weight);
        assert_eq!(q.as_i32().unwrap(), &[20, -10]);
    }

    #[test]
    fn observer_range_and_scale() {
        let mut obs = MinMaxObserver::new();
        assert!(obs.input_params().is_err());

        obs.observe(&Tensor::from_f32(vec![0.0, 0.25, 1.0], &[3]));
        obs.observe(&Tensor::from_f32(vec![0.1, 0.5], &[2]));
        assert_eq!(obs.observations(), 2);
        assert_eq!(obs.min(), 0.0);
        assert_eq!(obs.max(), 1.0);

        let params = obs.input_params().unwrap();
        assert!((params.scale - 1.0 / 127.0).abs() < 1e-12);
    }
}
