//! Scalar reference convolutions.
//!
//! These serve as golden outputs for the fused kernels: every loop runs in
//! float32 straight over the HWIO weights, with no packing, tiling or
//! reduced-precision intermediates.
//!
//! This crate is compiled with `opt-level = 1` (configured in the workspace
//! root Cargo.toml) so the loops stay as written.

pub mod activations;
pub mod conv;

pub use conv::{conv2d_nchw, conv2d_nhwc, ConvShape};
