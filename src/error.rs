//! Error type shared by descriptors, planners and engines.

use thiserror::Error;

use crate::activation::ActivationTag;
use crate::primitive::{GroupStructure, StageRole};
use crate::stage::ElementType;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConvError {
    #[error("unsupported fusion topology: {0}")]
    UnsupportedTopology(String),
    #[error("invalid stage chain: {0}")]
    InvalidShapeChain(String),
    #[error("invalid convolution stage: {0}")]
    InvalidStage(String),
    #[error("no compute primitive for role {role:?}, activation {activation:?}, group structure {group:?}")]
    UnmappedPrimitive {
        role: StageRole,
        activation: ActivationTag,
        group: GroupStructure,
    },
    #[error("scratch buffer too small: required {required} bytes, provided {provided}")]
    InsufficientScratch { required: usize, provided: usize },
    #[error("scratch layout error: {0}")]
    ScratchLayout(String),
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("element type mismatch: expected {expected:?}, got {actual:?}")]
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },
    #[error("tensor size mismatch: expected {expected} elements, got {actual}")]
    TensorSize { expected: usize, actual: usize },
    #[error("engine weights are not set")]
    NotConfigured,
}

pub type ConvResult<T> = Result<T, ConvError>;
