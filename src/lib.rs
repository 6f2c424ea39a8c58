pub mod conv;
pub mod encode;
pub mod error;
pub mod export;
pub mod ops;
pub mod pipeline;
pub mod quantize;
pub mod tensor;

pub use conv::{FixedPointConvolver, VerificationSummary};
pub use error::{QuantError, Result};
pub use export::{export, print_report, ExportReport};
pub use pipeline::{calibration_input, Model, ModelWeights, PipelineConfig, PipelineRun};
pub use quantize::{MinMaxObserver, QuantizationParams};
pub use tensor::{DType, Tensor};
