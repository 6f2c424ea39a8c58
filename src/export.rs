//! Artifact export and the console audit report.
//!
//! One plain-text file per tensor slice, whitespace-delimited: weights and
//! biases as two's-complement hex bytes, activations as signed 5-character
//! decimals. Filenames are fixed, descriptive identifiers (layer name, output
//! channel, input channel), so a rerun over identical state produces
//! byte-identical files. Everything is rendered in memory first; a structural
//! error aborts before a single file is written.

use std::fs;
use std::path::PathBuf;

use crate::conv::VerificationSummary;
use crate::encode::{encode_byte, encode_tensor, format_dec_row, format_hex, format_hex_row};
use crate::error::{QuantError, Result};
use crate::pipeline::{
    ActivationSnapshot, Conv2d, FullyConnected, Model, PipelineConfig, PipelineRun,
};
use crate::quantize::QuantizationParams;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactEncoding {
    /// Two lowercase hex digits per value (quantized weights and biases).
    Hex8,
    /// Signed zero-padded 5-character decimal per value (activations).
    Dec5,
}

/// One exported file, as enumerated by the report.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    pub shape: Vec<usize>,
    pub encoding: ArtifactEncoding,
    /// For quantized tensors, the worst dequantization error against the
    /// float reference parameters. Activations are exported raw.
    pub max_abs_error: Option<f64>,
}

/// Everything a human needs to audit one export run.
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub artifacts: Vec<ArtifactEntry>,
    pub verifications: Vec<VerificationSummary>,
}

struct Rendered {
    entry: ArtifactEntry,
    contents: String,
}

/// Serialize every weight, bias, and per-layer activation of the calibrated
/// model. Idempotent: identical inputs produce byte-identical files.
pub fn export(model: &Model, run: &PipelineRun, cfg: &PipelineConfig) -> Result<ExportReport> {
    let mut rendered = Vec::new();

    for conv in model.conv_layers() {
        render_conv(conv, cfg, &mut rendered)?;
    }
    if let Some(fc) = model.fc_layer() {
        render_fc(fc, cfg, &mut rendered)?;
    }
    for snapshot in &run.snapshots {
        render_activation(snapshot, cfg, &mut rendered)?;
    }

    fs::create_dir_all(&cfg.out_dir).map_err(|e| QuantError::io(&cfg.out_dir, e))?;
    let mut artifacts = Vec::with_capacity(rendered.len());
    for r in rendered {
        fs::write(&r.entry.path, &r.contents).map_err(|e| QuantError::io(&r.entry.path, e))?;
        artifacts.push(r.entry);
    }

    Ok(ExportReport { artifacts, verifications: run.verifications.clone() })
}

fn render_conv(conv: &Conv2d, cfg: &PipelineConfig, out: &mut Vec<Rendered>) -> Result<()> {
    let k = conv.kernel_size;
    let (c_out, c_in) = (conv.weight.shape()[0], conv.weight.shape()[1]);
    let q = conv.q_weight.as_i8().expect("quantized weights are i8");
    let w = conv.weight.as_f32().expect("float weights are f32");

    for oc in 0..c_out {
        for ic in 0..c_in {
            let start = (oc * c_in + ic) * k * k;
            let slice = &q[start..start + k * k];
            let contents = hex_grid(slice, k, k, &format!("{}_weight", conv.name))?;
            let max_abs_error = quant_error_i8(&w[start..start + k * k], slice, &conv.weight_params);
            out.push(Rendered {
                entry: ArtifactEntry {
                    path: cfg.out_dir.join(format!("{}_weight_{}_{}.txt", conv.name, oc + 1, ic + 1)),
                    shape: vec![k, k],
                    encoding: ArtifactEncoding::Hex8,
                    max_abs_error: Some(max_abs_error),
                },
                contents,
            });
        }
    }

    render_bias(
        conv.name,
        &conv.q_bias,
        conv.bias.as_f32().expect("float bias is f32"),
        &conv.input_params,
        &conv.weight_params,
        cfg,
        out,
    )
}

fn render_fc(fc: &FullyConnected, cfg: &PipelineConfig, out: &mut Vec<Rendered>) -> Result<()> {
    let q = fc.q_weight.as_i8().expect("quantized weights are i8");
    let w = fc.weight.as_f32().expect("float weights are f32");
    let contents = hex_grid(q, fc.out_features, fc.in_features, "fc_weight")?;
    out.push(Rendered {
        entry: ArtifactEntry {
            path: cfg.out_dir.join("fc_weight.txt"),
            shape: vec![fc.out_features, fc.in_features],
            encoding: ArtifactEncoding::Hex8,
            max_abs_error: Some(quant_error_i8(w, q, &fc.weight_params)),
        },
        contents,
    });

    render_bias(
        fc.name,
        &fc.q_bias,
        fc.bias.as_f32().expect("float bias is f32"),
        &fc.input_params,
        &fc.weight_params,
        cfg,
        out,
    )
}

fn render_bias(
    name: &str,
    q_bias: &Tensor,
    bias: &[f32],
    input_params: &QuantizationParams,
    weight_params: &QuantizationParams,
    cfg: &PipelineConfig,
    out: &mut Vec<Rendered>,
) -> Result<()> {
    let tensor_name = format!("{name}_bias");
    let encoded = encode_tensor(q_bias, &tensor_name)?;
    let mut lines = String::new();
    for &b in &encoded.bytes {
        lines.push_str(&format_hex(b));
        lines.push('\n');
    }
    let combined = input_params.scale * weight_params.scale;
    let max_abs_error = bias
        .iter()
        .zip(q_bias.as_i32().expect("quantized bias is i32"))
        .map(|(&b, &qb)| (b as f64 - qb as f64 * combined).abs())
        .fold(0.0f64, f64::max);
    out.push(Rendered {
        entry: ArtifactEntry {
            path: cfg.out_dir.join(format!("{tensor_name}.txt")),
            shape: encoded.shape.to_vec(),
            encoding: ArtifactEncoding::Hex8,
            max_abs_error: Some(max_abs_error),
        },
        contents: lines,
    });
    Ok(())
}

fn render_activation(
    snapshot: &ActivationSnapshot,
    cfg: &PipelineConfig,
    out: &mut Vec<Rendered>,
) -> Result<()> {
    let shape = snapshot.values.shape();
    match shape.len() {
        // one file per channel plane, one text row per spatial row
        3 => {
            let (c, h, w) = (shape[0], shape[1], shape[2]);
            for ch in 0..c {
                let plane = snapshot.values.channel_plane(ch).expect("snapshot is CHW f32");
                let contents: String = plane
                    .chunks(w)
                    .map(|row| format_dec_row(row) + "\n")
                    .collect();
                out.push(Rendered {
                    entry: ArtifactEntry {
                        path: cfg.out_dir.join(format!("out_{}_{}.txt", snapshot.name, ch + 1)),
                        shape: vec![h, w],
                        encoding: ArtifactEncoding::Dec5,
                        max_abs_error: None,
                    },
                    contents,
                });
            }
        }
        // flat vectors export as a single row
        _ => {
            let values = snapshot.values.as_f32().expect("snapshot is f32");
            out.push(Rendered {
                entry: ArtifactEntry {
                    path: cfg.out_dir.join(format!("{}.txt", snapshot.name)),
                    shape: shape.to_vec(),
                    encoding: ArtifactEncoding::Dec5,
                    max_abs_error: None,
                },
                contents: format_dec_row(values) + "\n",
            });
        }
    }
    Ok(())
}

fn hex_grid(values: &[i8], rows: usize, cols: usize, name: &str) -> Result<String> {
    let mut grid = String::new();
    for row in values.chunks(cols).take(rows) {
        let bytes = row
            .iter()
            .map(|&v| encode_byte(v as i32, name))
            .collect::<Result<Vec<u8>>>()?;
        grid.push_str(&format_hex_row(&bytes));
        grid.push('\n');
    }
    Ok(grid)
}

fn quant_error_i8(float_values: &[f32], q_values: &[i8], params: &QuantizationParams) -> f64 {
    float_values
        .iter()
        .zip(q_values)
        .map(|(&f, &q)| (f as f64 - q as f64 * params.scale).abs())
        .fold(0.0f64, f64::max)
}

/// Print the structured audit report: signed and unsigned parameter tensors
/// per quantized layer, then the three-way comparison of reference output,
/// integer recomputation, and their absolute difference.
pub fn print_report(model: &Model, run: &PipelineRun) {
    for conv in model.conv_layers() {
        let k = conv.kernel_size;
        let (c_out, c_in) = (conv.weight.shape()[0], conv.weight.shape()[1]);
        let q = conv.q_weight.as_i8().expect("quantized weights are i8");
        let q_bias = conv.q_bias.as_i32().expect("quantized bias is i32");

        println!("==== {} ====", conv.name);
        println!("Signed");
        for oc in 0..c_out {
            for ic in 0..c_in {
                println!("weight[{}][{}]", oc + 1, ic + 1);
                let start = (oc * c_in + ic) * k * k;
                print_signed_grid(&q[start..start + k * k], k);
            }
        }
        println!("bias {q_bias:?}");

        println!("Unsigned");
        for oc in 0..c_out {
            for ic in 0..c_in {
                println!("weight[{}][{}]", oc + 1, ic + 1);
                let start = (oc * c_in + ic) * k * k;
                print_unsigned_grid(&q[start..start + k * k], k);
            }
        }
        let unsigned_bias: Vec<i32> = q_bias.iter().map(|&v| v.rem_euclid(256)).collect();
        println!("bias {unsigned_bias:?}");

        print_three_way(conv.name, run, conv.out_shape[1] * conv.out_shape[2]);
        println!();
    }

    if let Some(fc) = model.fc_layer() {
        let q = fc.q_weight.as_i8().expect("quantized weights are i8");
        let q_bias = fc.q_bias.as_i32().expect("quantized bias is i32");
        println!("==== {} ====", fc.name);
        println!("Signed");
        print_signed_grid(q, fc.in_features);
        println!("bias {q_bias:?}");
        println!("Unsigned");
        print_unsigned_grid(q, fc.in_features);
        let unsigned_bias: Vec<i32> = q_bias.iter().map(|&v| v.rem_euclid(256)).collect();
        println!("bias {unsigned_bias:?}");
        print_three_way(fc.name, run, fc.out_features);
        println!();
    }

    println!("Verification");
    for summary in &run.verifications {
        println!(
            "  {}: max |err| {:.6}, {}/{} beyond tolerance {} ({:.2}% agreement)",
            summary.layer,
            summary.max_abs_error,
            summary.mismatches,
            summary.total,
            summary.tolerance,
            summary.agreement() * 100.0,
        );
    }
}

fn print_three_way(name: &str, run: &PipelineRun, row_len: usize) {
    let snapshot = match run.snapshot(if name == "fc" { "fc_out" } else { name }) {
        Some(s) => s,
        None => return,
    };
    let recomputed = match run.recomputation(name) {
        Some(r) => r,
        None => return,
    };
    let reference = snapshot.values.as_f32().expect("snapshot is f32");

    println!("Real Value");
    for row in reference.chunks(row_len) {
        println!("  {}", row.iter().map(|v| format!("{v:9.4}")).collect::<Vec<_>>().join(" "));
    }
    println!("Calc Value");
    for row in recomputed.values.chunks(row_len) {
        println!("  {}", row.iter().map(|v| format!("{v:9.4}")).collect::<Vec<_>>().join(" "));
    }
    println!("Abs Diff");
    let diffs: Vec<f64> = reference
        .iter()
        .zip(&recomputed.values)
        .map(|(&r, &m)| (r as f64 - m).abs())
        .collect();
    for row in diffs.chunks(row_len) {
        println!("  {}", row.iter().map(|v| format!("{v:9.4}")).collect::<Vec<_>>().join(" "));
    }
}

fn print_signed_grid(values: &[i8], cols: usize) {
    for row in values.chunks(cols) {
        println!("  {}", row.iter().map(|v| format!("{v:>4}")).collect::<Vec<_>>().join(" "));
    }
}

fn print_unsigned_grid(values: &[i8], cols: usize) {
    for row in values.chunks(cols) {
        println!(
            "  {}",
            row.iter().map(|&v| format_hex(v as u8)).collect::<Vec<_>>().join(" ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_grid_rows_and_padding() {
        let grid = hex_grid(&[5, -6, 0, 127, -128, 1], 3, 2, "t").unwrap();
        assert_eq!(grid, "05 fa\n00 7f\n80 01\n");
    }

    #[test]
    fn quant_error_bounded_by_half_step() {
        let params = QuantizationParams::symmetric(0.1, "t").unwrap();
        // q = round(f / 0.1)
        let err = quant_error_i8(&[0.34, -0.27], &[3, -3], &params);
        assert!(err <= 0.05 + 1e-9);
    }
}
