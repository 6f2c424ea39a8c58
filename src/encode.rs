//! Two's-complement byte encoding and artifact value formatting.
//!
//! Downstream hardware tooling consumes signed int8 values as unsigned bytes:
//! `v` for `v >= 0`, `v + 256` otherwise. Encoding is a bijection between
//! `[-128, 127]` and `[0, 255]`, applied uniformly to every weight and bias
//! tensor rather than hand-specialized per layer.

use crate::error::{QuantError, Result};
use crate::tensor::{Shape, Tensor, TensorData};

/// Encode one signed value as its unsigned two's-complement byte.
/// Values outside `[-128, 127]` indicate a calibration bug and must not be
/// silently clamped.
pub fn encode_byte(v: i32, tensor: &str) -> Result<u8> {
    if !(-128..=127).contains(&v) {
        return Err(QuantError::OutOfRange { tensor: tensor.to_string(), value: v });
    }
    Ok(if v >= 0 { v as u8 } else { (v + 256) as u8 })
}

/// Inverse of [`encode_byte`].
pub fn decode_byte(b: u8) -> i32 {
    if b < 128 { b as i32 } else { b as i32 - 256 }
}

/// Byte-encoded tensor: the elementwise encoding of an integer tensor, with
/// the source shape carried along so layout survives the encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTensor {
    pub bytes: Vec<u8>,
    pub shape: Shape,
}

/// Encode an integer tensor elementwise, preserving shape. The int32 variant
/// covers quantized biases, which live in 32 bits internally but must still
/// fit a single byte on the wire.
pub fn encode_tensor(t: &Tensor, name: &str) -> Result<EncodedTensor> {
    let bytes: Result<Vec<u8>> = match t.data() {
        TensorData::I8(values) => values.iter().map(|&v| encode_byte(v as i32, name)).collect(),
        TensorData::I32(values) => values.iter().map(|&v| encode_byte(v, name)).collect(),
        TensorData::F32(_) => panic!("encode_tensor expects an integer tensor"),
    };
    Ok(EncodedTensor { bytes: bytes?, shape: t.shape().iter().copied().collect() })
}

/// Two lowercase hex digits, zero-padded: `5 -> "05"`, `250 -> "fa"`.
pub fn format_hex(byte: u8) -> String {
    format!("{byte:02x}")
}

/// One artifact row of space-separated hex bytes.
pub fn format_hex_row(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format_hex(b)).collect::<Vec<_>>().join(" ")
}

/// Signed 5-character zero-padded decimal of a float truncated toward zero,
/// the activation display format: `3.7 -> "00003"`, `-3.7 -> "-0003"`.
pub fn format_dec(value: f32) -> String {
    format!("{:05}", value.trunc() as i64)
}

/// One artifact row of space-separated decimal activations.
pub fn format_dec_row(values: &[f32]) -> String {
    values.iter().map(|&v| format_dec(v)).collect::<Vec<_>>().join(" ")
}
