//! fusedconv-kernels: fused, cache-aware multi-stage convolution kernels.
//!
//! A short chain of convolutions (pointwise expansion, depthwise filter,
//! pointwise projection) runs as a single pass over the image:
//! - **Topology selection**: one of `Cdc`, `Cd`, `Dc` or `DenseGemm` is
//!   picked from the stage chain at configuration time
//! - **Cache-aware tiling**: channel tiles sized from L3, row bands from L2
//! - **bf16 weights**: packed once into micro-tile panels, f32 accumulation
//! - **Bit-stable tiling**: the result does not depend on the channel split
//!
//! # Quick Start
//!
//! ```ignore
//! use fusedconv_kernels::{ConvEngine, EngineConfig, FusedPipelineDescriptor, StageParams};
//!
//! let mut engine = ConvEngine::new(desc, EngineConfig::default())?;
//! engine.set_params(&[StageParams::new(&w0), StageParams::new(&w1), StageParams::new(&w2)])?;
//! engine.forward(&src, None, &mut dst)?;
//! ```

pub mod activation;
pub mod buffer;
pub mod cache_params;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod isa;
mod kernels;
pub mod packing;
pub mod primitive;
pub mod stage;
pub mod tensor;
pub mod tiling;
pub mod traits;

pub use activation::{ActivationKind, ActivationTag};
pub use buffer::{BufferLayout, BufferManager, Region};
pub use cache_params::CacheTopology;
pub use descriptor::{FusedPipelineDescriptor, Topology};
pub use engine::{ConvEngine, StageParams};
pub use error::{ConvError, ConvResult};
pub use isa::{get_isa_level, EngineConfig, IsaLevel, MicroTile};
pub use packing::{PackedStage, PackedWeights, WeightPacker};
pub use primitive::{ComputePrimitive, GroupStructure, StageRole};
pub use stage::{conv_output_size, ConvStage, ConvStageBuilder, ElementType, TensorLayout};
pub use tensor::{TensorSlice, TensorSliceMut};
pub use tiling::{GemmParams, RowWindow, TileParams, TilingPlanner};
pub use traits::Element;
