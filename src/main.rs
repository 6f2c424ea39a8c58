use std::env;
use std::path::PathBuf;
use std::process;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use hexquant::pipeline::{
    CONV1_OUT_SHAPE, CONV2_OUT_SHAPE, FC_IN_FEATURES, FC_OUT_FEATURES, INPUT_SHAPE, KERNEL_SIZE,
    MP1_OUT_SHAPE,
};
use hexquant::{
    calibration_input, export, print_report, MinMaxObserver, Model, ModelWeights, PipelineConfig,
    Tensor,
};

const USAGE: &str = "Usage: hexquant [OUT_DIR] [--tolerance T]";

fn main() {
    let cfg = match parse_args(&env::args().collect::<Vec<_>>()) {
        Ok(cfg) => cfg,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };
    if let Err(e) = run(cfg) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cfg: PipelineConfig) -> hexquant::Result<()> {
    println!("Int8 Quantization & Artifact Export");
    println!("Output directory: {:?}", cfg.out_dir);
    println!("Tolerance: {} (agreement {:.0}%)\n", cfg.tolerance, cfg.min_agreement * 100.0);

    // Training is a black box; stand in for it with deterministic parameters
    // so every run exports identical artifacts.
    let weights = demo_weights(42);
    let input = calibration_input(&demo_image())?;

    // Short calibration pass over the designated input to fix the network
    // input scale.
    let mut observer = MinMaxObserver::new();
    observer.observe(&input);
    let input_params = observer.input_params()?;
    println!(
        "Calibration: input range [{:.4}, {:.4}], scale {:.6}",
        observer.min(),
        observer.max(),
        input_params.scale
    );

    let (model, run) = Model::calibrate(weights, &input, input_params, &cfg)?;

    print_report(&model, &run);

    let report = export(&model, &run, &cfg)?;
    println!("Exported {} artifacts:", report.artifacts.len());
    for artifact in &report.artifacts {
        match artifact.max_abs_error {
            Some(err) => println!(
                "  {:?} shape {:?} ({:?}, max |err| {:.6})",
                artifact.path, artifact.shape, artifact.encoding, err
            ),
            None => println!("  {:?} shape {:?} ({:?})", artifact.path, artifact.shape, artifact.encoding),
        }
    }

    let prediction = run
        .output
        .as_f32()
        .expect("pipeline output is f32")
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i);
    if let Some(class) = prediction {
        println!("\nPredicted class for calibration input: {class}");
    }

    Ok(())
}

/// `hexquant [OUT_DIR] [--tolerance T]`
fn parse_args(args: &[String]) -> Result<PipelineConfig, String> {
    let mut cfg = PipelineConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tolerance" => {
                match args.get(i + 1).and_then(|v| v.parse().ok()) {
                    Some(t) => cfg.tolerance = t,
                    None => return Err("--tolerance expects a numeric value".to_string()),
                }
                i += 2;
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                process::exit(0);
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown flag {flag}"));
            }
            dir => {
                cfg.out_dir = PathBuf::from(dir);
                i += 1;
            }
        }
    }
    Ok(cfg)
}

/// Deterministic stand-in for trained parameters: He-style uniform weights,
/// biases kept small enough to stay on the byte grid after bias quantization.
fn demo_weights(seed: u64) -> ModelWeights {
    let mut rng = StdRng::seed_from_u64(seed);

    let conv1_fan_in = INPUT_SHAPE[0] * KERNEL_SIZE * KERNEL_SIZE;
    let conv2_fan_in = MP1_OUT_SHAPE[0] * KERNEL_SIZE * KERNEL_SIZE;

    let conv1_weight = sample(
        &mut rng,
        CONV1_OUT_SHAPE[0] * conv1_fan_in,
        (2.0 / conv1_fan_in as f32).sqrt(),
    );
    let conv2_weight = sample(
        &mut rng,
        CONV2_OUT_SHAPE[0] * conv2_fan_in,
        (2.0 / conv2_fan_in as f32).sqrt(),
    );
    let fc_weight = sample(
        &mut rng,
        FC_OUT_FEATURES * FC_IN_FEATURES,
        (2.0 / FC_IN_FEATURES as f32).sqrt(),
    );

    let conv1_bias = sample(&mut rng, CONV1_OUT_SHAPE[0], 0.0002);
    let conv2_bias = sample(&mut rng, CONV2_OUT_SHAPE[0], 0.0002);
    let fc_bias = sample(&mut rng, FC_OUT_FEATURES, 0.0002);

    ModelWeights {
        conv1_weight: Tensor::from_f32(
            conv1_weight,
            &[CONV1_OUT_SHAPE[0], INPUT_SHAPE[0], KERNEL_SIZE, KERNEL_SIZE],
        ),
        conv1_bias: Tensor::from_f32(conv1_bias, &[CONV1_OUT_SHAPE[0]]),
        conv2_weight: Tensor::from_f32(
            conv2_weight,
            &[CONV2_OUT_SHAPE[0], MP1_OUT_SHAPE[0], KERNEL_SIZE, KERNEL_SIZE],
        ),
        conv2_bias: Tensor::from_f32(conv2_bias, &[CONV2_OUT_SHAPE[0]]),
        fc_weight: Tensor::from_f32(fc_weight, &[FC_OUT_FEATURES, FC_IN_FEATURES]),
        fc_bias: Tensor::from_f32(fc_bias, &[FC_OUT_FEATURES]),
    }
}

fn sample(rng: &mut StdRng, n: usize, scale: f32) -> Vec<f32> {
    let dist = Uniform::new_inclusive(-scale, scale);
    (0..n).map(|_| dist.sample(rng)).collect()
}

/// A blocky 28×28 "zero" glyph, the designated calibration image. Bitmap
/// decoding is out of scope; raw grayscale bytes are the interface.
fn demo_image() -> Vec<u8> {
    let mut pixels = vec![0u8; 28 * 28];
    for i in 0..28 {
        for j in 0..28 {
            let di = i as i32 - 14;
            let dj = j as i32 - 14;
            let r2 = di * di + dj * dj;
            if (36..=100).contains(&r2) {
                pixels[i * 28 + j] = 255;
            }
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("hexquant").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn parses_out_dir_and_tolerance() {
        let cfg = parse_args(&args(&["artifacts", "--tolerance", "0.5"])).unwrap();
        assert_eq!(cfg.out_dir, PathBuf::from("artifacts"));
        assert_eq!(cfg.tolerance, 0.5);
    }

    #[test]
    fn rejects_bad_tolerance() {
        assert!(parse_args(&args(&["--tolerance", "abc"])).is_err());
        assert!(parse_args(&args(&["--tolerance"])).is_err());
    }

    #[test]
    fn rejects_unknown_flags() {
        let err = parse_args(&args(&["--fast"])).unwrap_err();
        assert!(err.contains("--fast"));
    }
}
