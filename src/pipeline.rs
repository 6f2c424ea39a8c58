//! The quantized inference pipeline over the fixed topology.
//!
//! Conv2d(1→3, k=5) → MaxPool2d(2) → Conv2d(3→3, k=5) → MaxPool2d(2) →
//! Flatten → FullyConnected(48→10), strictly sequential. Each layer is a pure
//! transform of its predecessor's output plus its own owned parameters; every
//! quantized layer also produces the independent integer recomputation from
//! [`crate::conv`]. Shape deviations from the fixed chain are treated as
//! topology corruption and abort the run.

use std::path::PathBuf;

use crate::conv::{fully_connected, rescale, FixedPointConvolver, VerificationSummary};
use crate::error::{QuantError, Result};
use crate::ops;
use crate::quantize::{
    fake_quantize, quantize_bias, quantize_tensor, QuantizationParams,
};
use crate::tensor::Tensor;

pub const KERNEL_SIZE: usize = 5;
pub const INPUT_SHAPE: [usize; 3] = [1, 28, 28];
pub const CONV1_OUT_SHAPE: [usize; 3] = [3, 24, 24];
pub const MP1_OUT_SHAPE: [usize; 3] = [3, 12, 12];
pub const CONV2_OUT_SHAPE: [usize; 3] = [3, 8, 8];
pub const MP2_OUT_SHAPE: [usize; 3] = [3, 4, 4];
pub const FC_IN_FEATURES: usize = 48;
pub const FC_OUT_FEATURES: usize = 10;

/// Explicit, passed configuration for calibration, inference, and export;
/// nothing lives in module-global state.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory the artifact files are written into.
    pub out_dir: PathBuf,
    /// Absolute verification tolerance in pre-quantization float units.
    pub tolerance: f64,
    /// Agreement fraction required by the strict verification entry point.
    pub min_agreement: f64,
    /// Overrides the observer-derived network input scale when set.
    pub input_scale: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            out_dir: PathBuf::from("txt_quantized"),
            tolerance: 1.0,
            min_agreement: 0.99,
            input_scale: None,
        }
    }
}

/// Trained float parameters, as handed over by the (external) training loop.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    pub conv1_weight: Tensor, // [3, 1, 5, 5]
    pub conv1_bias: Tensor,   // [3]
    pub conv2_weight: Tensor, // [3, 3, 5, 5]
    pub conv2_bias: Tensor,   // [3]
    pub fc_weight: Tensor,    // [10, 48]
    pub fc_bias: Tensor,      // [10]
}

impl ModelWeights {
    /// The topology is fixed; parameter shapes must chain consistently
    /// through it. Verified before any quantization happens.
    pub fn validate(&self) -> Result<()> {
        self.conv1_weight.expect_shape("conv1", &[CONV1_OUT_SHAPE[0], INPUT_SHAPE[0], KERNEL_SIZE, KERNEL_SIZE])?;
        self.conv1_bias.expect_shape("conv1", &[CONV1_OUT_SHAPE[0]])?;
        self.conv2_weight.expect_shape("conv2", &[CONV2_OUT_SHAPE[0], MP1_OUT_SHAPE[0], KERNEL_SIZE, KERNEL_SIZE])?;
        self.conv2_bias.expect_shape("conv2", &[CONV2_OUT_SHAPE[0]])?;
        self.fc_weight.expect_shape("fc", &[FC_OUT_FEATURES, FC_IN_FEATURES])?;
        self.fc_bias.expect_shape("fc", &[FC_OUT_FEATURES])?;
        Ok(())
    }
}

/// A quantized convolution layer: float parameters, their int8/int32
/// counterparts, and the quantization params for weight and input activation.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub name: &'static str,
    pub weight: Tensor,
    pub bias: Tensor,
    pub q_weight: Tensor,
    pub q_bias: Tensor,
    pub weight_params: QuantizationParams,
    pub input_params: QuantizationParams,
    pub in_shape: [usize; 3],
    pub out_shape: [usize; 3],
    pub kernel_size: usize,
}

impl Conv2d {
    fn build(
        name: &'static str,
        weight: Tensor,
        bias: Tensor,
        input_params: QuantizationParams,
        in_shape: [usize; 3],
        out_shape: [usize; 3],
    ) -> Result<Self> {
        let weight_values = weight.as_f32().expect("conv weights must be f32");
        let weight_params = QuantizationParams::derive(weight_values, &format!("{name}_weight"))?;
        let q_weight = quantize_tensor(&weight, &weight_params, &format!("{name}_weight"))?;
        let q_bias = quantize_bias(&bias, &input_params, &weight_params);
        Ok(Conv2d {
            name,
            weight,
            bias,
            q_weight,
            q_bias,
            weight_params,
            input_params,
            in_shape,
            out_shape,
            kernel_size: KERNEL_SIZE,
        })
    }

    /// Reference output (quantize→dequantize forward) plus the integer MAC
    /// recomputation compared against it.
    fn run(&self, input: &Tensor, tolerance: f64) -> Result<(Tensor, Vec<f64>, VerificationSummary)> {
        input.expect_shape(self.name, &self.in_shape)?;

        // Reference path: what the framework's quantized kernel would see.
        let input_q = fake_quantize(input, &self.input_params, &format!("{}_input", self.name))?;
        let weight_dq = crate::quantize::dequantize_tensor(&self.q_weight, &self.weight_params);
        let bias = self.bias.as_f32().expect("conv bias must be f32");
        let reference = ops::conv2d(&input_q, &weight_dq, bias, self.kernel_size);

        // Independent path: raw input rescaled to quantization steps, pure
        // integer weights and bias, then back to activation units.
        let scaled: Vec<f64> = input
            .as_f32()
            .expect("conv input must be f32")
            .iter()
            .map(|&x| x as f64 / self.input_params.scale)
            .collect();
        let acc = FixedPointConvolver::new(self.kernel_size).convolve(
            &scaled,
            self.in_shape,
            self.q_weight.as_i8().expect("quantized weights are i8"),
            self.out_shape[0],
            self.q_bias.as_i32().expect("quantized bias is i32"),
        );
        let recomputed = rescale(&acc, &self.input_params, &self.weight_params);

        let summary = VerificationSummary::compare(
            self.name,
            reference.as_f32().expect("reference output is f32"),
            &recomputed,
            tolerance,
        );
        Ok((reference, recomputed, summary))
    }
}

/// The fully-connected classifier head, quantized the same way.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    pub name: &'static str,
    pub weight: Tensor,
    pub bias: Tensor,
    pub q_weight: Tensor,
    pub q_bias: Tensor,
    pub weight_params: QuantizationParams,
    pub input_params: QuantizationParams,
    pub in_features: usize,
    pub out_features: usize,
}

impl FullyConnected {
    fn build(
        name: &'static str,
        weight: Tensor,
        bias: Tensor,
        input_params: QuantizationParams,
    ) -> Result<Self> {
        let weight_values = weight.as_f32().expect("fc weights must be f32");
        let weight_params = QuantizationParams::derive(weight_values, &format!("{name}_weight"))?;
        let q_weight = quantize_tensor(&weight, &weight_params, &format!("{name}_weight"))?;
        let q_bias = quantize_bias(&bias, &input_params, &weight_params);
        let (out_features, in_features) = (weight.shape()[0], weight.shape()[1]);
        Ok(FullyConnected {
            name,
            weight,
            bias,
            q_weight,
            q_bias,
            weight_params,
            input_params,
            in_features,
            out_features,
        })
    }

    fn run(&self, input: &Tensor, tolerance: f64) -> Result<(Tensor, Vec<f64>, VerificationSummary)> {
        input.expect_shape(self.name, &[self.in_features])?;

        let input_q = fake_quantize(input, &self.input_params, &format!("{}_input", self.name))?;
        let weight_dq = crate::quantize::dequantize_tensor(&self.q_weight, &self.weight_params);
        let bias = self.bias.as_f32().expect("fc bias must be f32");
        let reference = ops::linear(&input_q, &weight_dq, bias);

        let scaled: Vec<f64> = input
            .as_f32()
            .expect("fc input must be f32")
            .iter()
            .map(|&x| x as f64 / self.input_params.scale)
            .collect();
        let acc = fully_connected(
            &scaled,
            self.q_weight.as_i8().expect("quantized weights are i8"),
            self.out_features,
            self.q_bias.as_i32().expect("quantized bias is i32"),
        );
        let recomputed = rescale(&acc, &self.input_params, &self.weight_params);

        let summary = VerificationSummary::compare(
            self.name,
            reference.as_f32().expect("reference output is f32"),
            &recomputed,
            tolerance,
        );
        Ok((reference, recomputed, summary))
    }
}

/// One stage of the fixed topology.
#[derive(Debug, Clone)]
pub enum Layer {
    Conv2d(Conv2d),
    MaxPool2d { name: &'static str, size: usize, out_shape: [usize; 3] },
    Flatten { name: &'static str, out_features: usize },
    FullyConnected(FullyConnected),
}

/// Float output captured at a layer boundary for the designated calibration
/// input. Recomputed on every inference call.
#[derive(Debug, Clone)]
pub struct ActivationSnapshot {
    pub name: &'static str,
    pub values: Tensor,
}

/// Integer-MAC recomputation of one quantized layer's output, in activation
/// units, kept for the console audit report.
#[derive(Debug, Clone)]
pub struct Recomputation {
    pub name: &'static str,
    pub values: Vec<f64>,
}

/// Result of one pass: every boundary snapshot plus the per-layer
/// verification findings and the recomputed tensors behind them.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub snapshots: Vec<ActivationSnapshot>,
    pub verifications: Vec<VerificationSummary>,
    pub recomputations: Vec<Recomputation>,
    pub output: Tensor,
}

impl PipelineRun {
    pub fn snapshot(&self, name: &str) -> Option<&ActivationSnapshot> {
        self.snapshots.iter().find(|s| s.name == name)
    }

    pub fn recomputation(&self, name: &str) -> Option<&Recomputation> {
        self.recomputations.iter().find(|r| r.name == name)
    }

    /// Strict verification: every quantized layer must agree with its
    /// recomputation for at least `min_agreement` of elements.
    pub fn check(&self, cfg: &PipelineConfig) -> Result<()> {
        for summary in &self.verifications {
            summary.check(cfg.min_agreement)?;
        }
        Ok(())
    }
}

/// The calibrated, quantized model.
pub struct Model {
    pub layers: Vec<Layer>,
}

impl Model {
    /// Quantize `weights` against the designated calibration input.
    ///
    /// The network input scale comes from the supplied observer params (or
    /// the config override); downstream input scales follow the documented
    /// calibration policy of deriving each from the preceding pooled
    /// activation, `max(|v|) / 127`. Scales are frozen once this returns.
    pub fn calibrate(
        weights: ModelWeights,
        input: &Tensor,
        input_params: QuantizationParams,
        cfg: &PipelineConfig,
    ) -> Result<(Model, PipelineRun)> {
        weights.validate()?;
        input.expect_shape("input", &INPUT_SHAPE)?;

        let input_params = match cfg.input_scale {
            Some(scale) => QuantizationParams::symmetric(scale, "input")?,
            None => input_params,
        };

        // Derivation pass: each quantized layer needs its input scale before
        // it can be built, and that scale comes from the activation actually
        // reaching it.
        let conv1 = Conv2d::build(
            "conv1",
            weights.conv1_weight,
            weights.conv1_bias,
            input_params,
            INPUT_SHAPE,
            CONV1_OUT_SHAPE,
        )?;
        let (conv1_out, _, _) = conv1.run(input, cfg.tolerance)?;
        let mp1 = ops::maxpool2_relu(&conv1_out, 2);

        let conv2_input = QuantizationParams::derive(
            mp1.as_f32().expect("pool output is f32"),
            "conv2_input",
        )?;
        let conv2 = Conv2d::build(
            "conv2",
            weights.conv2_weight,
            weights.conv2_bias,
            conv2_input,
            MP1_OUT_SHAPE,
            CONV2_OUT_SHAPE,
        )?;
        let (conv2_out, _, _) = conv2.run(&mp1, cfg.tolerance)?;
        let mp2 = ops::maxpool2_relu(&conv2_out, 2);
        let fc_in = ops::flatten(&mp2);

        let fc_input = QuantizationParams::derive(
            fc_in.as_f32().expect("flatten output is f32"),
            "fc_input",
        )?;
        let fc = FullyConnected::build("fc", weights.fc_weight, weights.fc_bias, fc_input)?;

        let model = Model {
            layers: vec![
                Layer::Conv2d(conv1),
                Layer::MaxPool2d { name: "mp1", size: 2, out_shape: MP1_OUT_SHAPE },
                Layer::Conv2d(conv2),
                Layer::MaxPool2d { name: "mp2", size: 2, out_shape: MP2_OUT_SHAPE },
                Layer::Flatten { name: "fc_in", out_features: FC_IN_FEATURES },
                Layer::FullyConnected(fc),
            ],
        };
        let run = model.forward(input, cfg)?;
        Ok((model, run))
    }

    /// Run the quantized pipeline with frozen scales, capturing a snapshot at
    /// every layer boundary and a verification summary per quantized layer.
    pub fn forward(&self, input: &Tensor, cfg: &PipelineConfig) -> Result<PipelineRun> {
        input.expect_shape("input", &INPUT_SHAPE)?;

        let mut snapshots = Vec::with_capacity(self.layers.len());
        let mut verifications = Vec::new();
        let mut recomputations = Vec::new();
        let mut x = input.clone();

        for layer in &self.layers {
            x = match layer {
                Layer::Conv2d(conv) => {
                    let (out, recomputed, summary) = conv.run(&x, cfg.tolerance)?;
                    out.expect_shape(conv.name, &conv.out_shape)?;
                    snapshots.push(ActivationSnapshot { name: conv.name, values: out.clone() });
                    verifications.push(summary);
                    recomputations.push(Recomputation { name: conv.name, values: recomputed });
                    out
                }
                Layer::MaxPool2d { name, size, out_shape } => {
                    let out = ops::maxpool2_relu(&x, *size);
                    out.expect_shape(name, out_shape)?;
                    snapshots.push(ActivationSnapshot { name: *name, values: out.clone() });
                    out
                }
                Layer::Flatten { name, out_features } => {
                    let out = ops::flatten(&x);
                    out.expect_shape(name, &[*out_features])?;
                    snapshots.push(ActivationSnapshot { name: *name, values: out.clone() });
                    out
                }
                Layer::FullyConnected(fc) => {
                    let (out, recomputed, summary) = fc.run(&x, cfg.tolerance)?;
                    out.expect_shape(fc.name, &[fc.out_features])?;
                    snapshots.push(ActivationSnapshot { name: "fc_out", values: out.clone() });
                    verifications.push(summary);
                    recomputations.push(Recomputation { name: fc.name, values: recomputed });
                    out
                }
            };
        }

        Ok(PipelineRun { snapshots, verifications, recomputations, output: x })
    }

    pub fn conv_layers(&self) -> impl Iterator<Item = &Conv2d> {
        self.layers.iter().filter_map(|l| match l {
            Layer::Conv2d(c) => Some(c),
            _ => None,
        })
    }

    pub fn fc_layer(&self) -> Option<&FullyConnected> {
        self.layers.iter().find_map(|l| match l {
            Layer::FullyConnected(fc) => Some(fc),
            _ => None,
        })
    }
}

/// Build the network input from the designated 28×28 grayscale calibration
/// image: raw bytes normalized to `[0, 1]`. Bitmap decoding is the caller's
/// concern; the core consumes pixels.
pub fn calibration_input(pixels: &[u8]) -> Result<Tensor> {
    let expected: usize = INPUT_SHAPE.iter().product();
    if pixels.len() != expected {
        return Err(QuantError::ShapeMismatch {
            layer: "input".to_string(),
            expected: INPUT_SHAPE.to_vec(),
            actual: vec![pixels.len()],
        });
    }
    let values = pixels.iter().map(|&p| p as f32 / 255.0).collect();
    Ok(Tensor::from_f32(values, &INPUT_SHAPE))
}
