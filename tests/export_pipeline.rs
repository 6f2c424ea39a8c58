use std::fs;
use std::path::Path;

use hexquant::pipeline::{CONV1_OUT_SHAPE, FC_OUT_FEATURES, MP2_OUT_SHAPE};
use hexquant::{
    calibration_input, export, Model, ModelWeights, PipelineConfig, QuantizationParams, QuantError,
    Tensor,
};

fn fixture_weights() -> ModelWeights {
    // Deterministic patterned parameters standing in for a trained model.
    let conv1_weight: Vec<f32> = (0..75).map(|i| ((i % 11) as f32 - 5.0) * 0.05).collect();
    let conv2_weight: Vec<f32> = (0..225).map(|i| ((i % 13) as f32 - 6.0) * 0.04).collect();
    let fc_weight: Vec<f32> = (0..480).map(|i| ((i % 17) as f32 - 8.0) * 0.03).collect();
    ModelWeights {
        conv1_weight: Tensor::from_f32(conv1_weight, &[3, 1, 5, 5]),
        conv1_bias: Tensor::from_f32(vec![0.0008, -0.0005, 0.0002], &[3]),
        conv2_weight: Tensor::from_f32(conv2_weight, &[3, 3, 5, 5]),
        conv2_bias: Tensor::from_f32(vec![0.0003, 0.0, -0.0003], &[3]),
        fc_weight: Tensor::from_f32(fc_weight, &[10, 48]),
        fc_bias: Tensor::from_f32(vec![0.0002; 10], &[10]),
    }
}

fn fixture_input() -> Tensor {
    let pixels: Vec<u8> = (0..784).map(|i| ((i * 7) % 256) as u8).collect();
    calibration_input(&pixels).unwrap()
}

fn calibrated(cfg: &PipelineConfig) -> (Model, hexquant::PipelineRun) {
    let input = fixture_input();
    let params = QuantizationParams::derive(input.as_f32().unwrap(), "input").unwrap();
    Model::calibrate(fixture_weights(), &input, params, cfg).unwrap()
}

fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap_or_else(|e| panic!("missing {name}: {e}"))
}

#[test]
fn exports_full_artifact_set() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { out_dir: tmp.path().to_path_buf(), ..PipelineConfig::default() };
    let (model, run) = calibrated(&cfg);
    let report = export(&model, &run, &cfg).unwrap();

    // 3 conv1 + 9 conv2 + 1 fc weight files, 3 bias files,
    // 4 pooled/conv activation sets of 3 channels, fc_in and fc_out
    assert_eq!(report.artifacts.len(), 3 + 9 + 1 + 3 + 12 + 2);
    assert_eq!(report.verifications.len(), 3);

    for name in [
        "conv1_weight_1_1.txt",
        "conv1_weight_3_1.txt",
        "conv2_weight_1_1.txt",
        "conv2_weight_3_3.txt",
        "conv1_bias.txt",
        "conv2_bias.txt",
        "fc_weight.txt",
        "fc_bias.txt",
        "out_conv1_1.txt",
        "out_mp1_3.txt",
        "out_conv2_2.txt",
        "out_mp2_1.txt",
        "fc_in.txt",
        "fc_out.txt",
    ] {
        assert!(tmp.path().join(name).exists(), "missing artifact {name}");
    }
}

#[test]
fn weight_artifacts_are_hex_grids() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { out_dir: tmp.path().to_path_buf(), ..PipelineConfig::default() };
    let (model, run) = calibrated(&cfg);
    export(&model, &run, &cfg).unwrap();

    let contents = read(tmp.path(), "conv1_weight_1_1.txt");
    let rows: Vec<&str> = contents.lines().collect();
    assert_eq!(rows.len(), 5);
    for row in rows {
        let cells: Vec<&str> = row.split(' ').collect();
        assert_eq!(cells.len(), 5);
        for cell in cells {
            assert_eq!(cell.len(), 2);
            assert!(cell.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    let fc = read(tmp.path(), "fc_weight.txt");
    let fc_rows: Vec<&str> = fc.lines().collect();
    assert_eq!(fc_rows.len(), 10);
    assert!(fc_rows.iter().all(|r| r.split(' ').count() == 48));
}

#[test]
fn activation_artifacts_are_signed_decimals() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { out_dir: tmp.path().to_path_buf(), ..PipelineConfig::default() };
    let (model, run) = calibrated(&cfg);
    export(&model, &run, &cfg).unwrap();

    let contents = read(tmp.path(), "out_conv1_1.txt");
    let rows: Vec<&str> = contents.lines().collect();
    assert_eq!(rows.len(), CONV1_OUT_SHAPE[1]);
    for row in rows {
        for cell in row.split(' ') {
            assert!(cell.len() >= 5, "cell {cell:?} shorter than 5 chars");
            assert!(cell.parse::<i64>().is_ok(), "cell {cell:?} is not a signed integer");
        }
    }

    let fc_out = read(tmp.path(), "fc_out.txt");
    assert_eq!(fc_out.lines().count(), 1);
    assert_eq!(fc_out.trim_end().split(' ').count(), FC_OUT_FEATURES);
}

#[test]
fn export_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig { out_dir: tmp.path().to_path_buf(), ..PipelineConfig::default() };
    let (model, run) = calibrated(&cfg);

    export(&model, &run, &cfg).unwrap();
    let first: Vec<(String, Vec<u8>)> = artifact_bytes(tmp.path());

    // a second run over identical state must be byte-identical
    let rerun = model.forward(&fixture_input(), &cfg).unwrap();
    export(&model, &rerun, &cfg).unwrap();
    let second = artifact_bytes(tmp.path());

    assert_eq!(first, second);
}

fn artifact_bytes(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (e.file_name().into_string().unwrap(), fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

#[test]
fn structural_error_writes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let out_dir = tmp.path().join("artifacts");
    let cfg = PipelineConfig { out_dir: out_dir.clone(), ..PipelineConfig::default() };

    // A bias far off the byte grid must fail encoding and abort the export
    // before any file is created.
    let mut weights = fixture_weights();
    weights.conv1_bias = Tensor::from_f32(vec![5.0, 0.0, 0.0], &[3]);
    let input = fixture_input();
    let params = QuantizationParams::derive(input.as_f32().unwrap(), "input").unwrap();
    let (model, run) = Model::calibrate(weights, &input, params, &cfg).unwrap();

    let err = export(&model, &run, &cfg).unwrap_err();
    assert!(matches!(err, QuantError::OutOfRange { .. }));
    assert!(!out_dir.exists(), "no artifact directory may be created on failure");
}

#[test]
fn zero_calibration_image_is_degenerate() {
    let input = calibration_input(&[0u8; 784]).unwrap();
    let err = QuantizationParams::derive(input.as_f32().unwrap(), "input").unwrap_err();
    assert!(matches!(err, QuantError::DegenerateRange { .. }));
}

#[test]
fn verification_holds_on_calibration_input() {
    let cfg = PipelineConfig::default();
    let (_, run) = calibrated(&cfg);

    run.check(&cfg).unwrap();
    for summary in &run.verifications {
        assert!(
            summary.agreement() >= 0.99,
            "{} agreement {:.4} below 99%",
            summary.layer,
            summary.agreement()
        );
    }
    assert_eq!(run.snapshot("mp2").unwrap().values.shape(), &MP2_OUT_SHAPE);
}

#[test]
fn shape_corruption_is_fatal() {
    let cfg = PipelineConfig::default();
    let (model, _) = calibrated(&cfg);

    let bad_input = Tensor::from_f32(vec![0.5; 27 * 27], &[1, 27, 27]);
    let err = model.forward(&bad_input, &cfg).unwrap_err();
    assert!(matches!(err, QuantError::ShapeMismatch { .. }));
}
