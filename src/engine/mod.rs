//! Topology engines.
//!
//! [`ConvEngine`] owns one fusion shape, chosen once from the descriptor:
//!
//! | Variant | Kernel | Scratch regions |
//! |---|---|---|
//! | `Cdc` | [`cdc::MergedCdc`] | bf16 source rows, f32 expanded rows, bf16 depthwise rows, f32 sums (bf16 output) |
//! | `Cd` | [`cd::MergedCd`] | bf16 source rows, f32 expanded rows |
//! | `Dc` | [`dc::MergedDc`] | bf16 depthwise rows, f32 sums (bf16 output) |
//! | `DenseGemm` | [`gemm::NchwGemm`] | bf16 patches, f32 partial sums |
//!
//! Dispatch is a plain `match` over the closed set of kernels; element
//! types are monomorphized through [`Element`].

pub mod cd;
pub mod cdc;
pub mod dc;
pub mod gemm;

use half::bf16;
use rayon::prelude::*;

use crate::buffer::{Arena, BufferLayout, BufferManager};
use crate::descriptor::{FusedPipelineDescriptor, Topology};
use crate::error::{ConvError, ConvResult};
use crate::isa::EngineConfig;
use crate::packing::{PackedStage, WeightPacker};
use crate::primitive::StageRole;
use crate::tensor::{TensorSlice, TensorSliceMut};
use crate::tiling::{GemmParams, TileParams, TilingPlanner};
use crate::traits::Element;

use self::cd::MergedCd;
use self::cdc::MergedCdc;
use self::dc::MergedDc;
use self::gemm::NchwGemm;

/// Planar parameters of one stage, as handed to [`ConvEngine::set_params`].
///
/// `weights` is HWIO float32. `bias` defaults to zero; `params` carries
/// the per-channel slopes of a Prelu stage and is empty otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageParams<'a> {
    pub weights: &'a [f32],
    pub bias: Option<&'a [f32]>,
    pub params: Option<&'a [f32]>,
}

impl<'a> StageParams<'a> {
    pub fn new(weights: &'a [f32]) -> Self {
        Self { weights, bias: None, params: None }
    }

    pub fn bias(mut self, bias: &'a [f32]) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn params(mut self, params: &'a [f32]) -> Self {
        self.params = Some(params);
        self
    }
}

/// Indices of the scratch regions a kernel uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RegionMap {
    pub buf0: Option<usize>,
    pub buf1: Option<usize>,
    pub buf2: Option<usize>,
    pub sum: Option<usize>,
}

impl RegionMap {
    fn carve<'a>(&self, arena: &mut Arena<'a>) -> ConvResult<Scratch<'a>> {
        fn view<'a, T: bytemuck::Pod>(arena: &mut Arena<'a>, idx: Option<usize>) -> ConvResult<&'a mut [T]> {
            match idx {
                Some(i) => arena.take(i),
                None => Ok(Default::default()),
            }
        }
        Ok(Scratch {
            buf0: view(arena, self.buf0)?,
            buf1: view(arena, self.buf1)?,
            buf2: view(arena, self.buf2)?,
            sum: view(arena, self.sum)?,
        })
    }
}

/// Typed scratch views for one forward call; unused regions are empty.
#[derive(Debug)]
pub(crate) struct Scratch<'a> {
    pub buf0: &'a mut [bf16],
    pub buf1: &'a mut [f32],
    pub buf2: &'a mut [bf16],
    pub sum: &'a mut [f32],
}

/// Shared shape of the per-topology kernels.
pub(crate) trait FusedKernel: Send + Sync {
    /// Role of every stage, in order.
    fn roles(&self) -> &'static [StageRole];

    /// Tile width the output-stage weights are blocked by.
    fn output_tile(&self) -> usize;

    /// Run one batch item.
    fn run_item<S: Element, D: Element>(
        &self,
        packed: &[PackedStage],
        scratch: &mut Scratch<'_>,
        src: &[S],
        dst: &mut [D],
    );
}

#[derive(Debug, Clone)]
enum EngineKind {
    Cdc(MergedCdc),
    Cd(MergedCd),
    Dc(MergedDc),
    DenseGemm(NchwGemm),
}

macro_rules! with_kernel {
    ($kind:expr, $k:ident => $body:expr) => {
        match $kind {
            EngineKind::Cdc($k) => $body,
            EngineKind::Cd($k) => $body,
            EngineKind::Dc($k) => $body,
            EngineKind::DenseGemm($k) => $body,
        }
    };
}

/// Fused convolution engine for one pipeline descriptor.
#[derive(Debug)]
pub struct ConvEngine {
    desc: FusedPipelineDescriptor,
    topology: Topology,
    kind: EngineKind,
    packer: WeightPacker,
    packed: Option<Vec<PackedStage>>,
    buffers: BufferManager,
    regions: RegionMap,
}

impl ConvEngine {
    /// Select the topology, plan the tiling and lay out scratch.
    /// Weights must be supplied through [`ConvEngine::set_params`] before
    /// the first forward.
    pub fn new(desc: FusedPipelineDescriptor, config: EngineConfig) -> ConvResult<Self> {
        let topology = Topology::select(&desc)?;
        let planner = TilingPlanner::new(&config);
        let mut layout = BufferLayout::new();
        let (kind, regions) = match topology {
            Topology::Cdc => {
                let (k, r) = MergedCdc::new(&desc, &planner, &mut layout)?;
                (EngineKind::Cdc(k), r)
            }
            Topology::Cd => {
                let (k, r) = MergedCd::new(&desc, &planner, &mut layout)?;
                (EngineKind::Cd(k), r)
            }
            Topology::Dc => {
                let (k, r) = MergedDc::new(&desc, &planner, &mut layout)?;
                (EngineKind::Dc(k), r)
            }
            Topology::DenseGemm => {
                let (k, r) = NchwGemm::new(&desc, &planner, &mut layout)?;
                (EngineKind::DenseGemm(k), r)
            }
        };
        log::debug!(
            "Portable::{}: batch {}, {} stage(s), scratch {} B",
            topology.name(),
            desc.batch(),
            desc.count(),
            layout.external_size()
        );
        Ok(Self {
            desc,
            topology,
            kind,
            packer: WeightPacker::new(config.micro),
            packed: None,
            buffers: BufferManager::new(layout),
            regions,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn descriptor(&self) -> &FusedPipelineDescriptor {
        &self.desc
    }

    pub fn description(&self) -> String {
        format!("Portable::{}", self.topology.name())
    }

    /// Schedule of a merged topology; `None` for the GEMM engine.
    pub fn tile_params(&self) -> Option<&TileParams> {
        match &self.kind {
            EngineKind::Cdc(k) => Some(k.tile()),
            EngineKind::Cd(k) => Some(k.tile()),
            EngineKind::Dc(k) => Some(k.tile()),
            EngineKind::DenseGemm(_) => None,
        }
    }

    pub fn gemm_params(&self) -> Option<&GemmParams> {
        match &self.kind {
            EngineKind::DenseGemm(k) => Some(k.params()),
            _ => None,
        }
    }

    /// Bytes a caller-provided scratch buffer must have.
    pub fn external_buffer_size(&self) -> usize {
        self.buffers.external_size()
    }

    /// Bytes owned by the engine: packed weights, bias, parameters and the
    /// internal scratch buffer once allocated.
    pub fn internal_buffer_size(&self) -> usize {
        let packed: usize = self.packed.iter().flatten().map(PackedStage::size_bytes).sum();
        packed + self.buffers.internal_size()
    }

    pub fn is_configured(&self) -> bool {
        self.packed.is_some()
    }

    /// Pack weights, bias and activation parameters of every stage.
    ///
    /// On error the previous parameters stay in place.
    pub fn set_params(&mut self, stages: &[StageParams<'_>]) -> ConvResult<()> {
        if stages.len() != self.desc.count() {
            return Err(ConvError::InvalidParams(format!(
                "expected parameters for {} stage(s), got {}",
                self.desc.count(),
                stages.len()
            )));
        }
        let (roles, tile) = with_kernel!(&self.kind, k => (k.roles(), k.output_tile()));
        let packed = self
            .desc
            .stages()
            .iter()
            .zip(roles)
            .zip(stages)
            .map(|((stage, &role), p)| self.packer.pack_stage(role, stage, p.weights, p.bias, p.params, tile))
            .collect::<ConvResult<Vec<_>>>()?;
        log::debug!(
            "{}: packed {} B of parameters",
            self.description(),
            packed.iter().map(PackedStage::size_bytes).sum::<usize>()
        );
        self.packed = Some(packed);
        Ok(())
    }

    fn check_io<S: Element, D: Element>(&self, src: &[S], dst: &[D]) -> ConvResult<()> {
        let first = self.desc.first();
        let last = self.desc.last();
        if S::ELEM != first.src_type {
            return Err(ConvError::ElementTypeMismatch { expected: first.src_type, actual: S::ELEM });
        }
        if D::ELEM != last.dst_type {
            return Err(ConvError::ElementTypeMismatch { expected: last.dst_type, actual: D::ELEM });
        }
        let batch = self.desc.batch();
        if src.len() != batch * self.desc.src_size() {
            return Err(ConvError::TensorSize { expected: batch * self.desc.src_size(), actual: src.len() });
        }
        if dst.len() != batch * self.desc.dst_size() {
            return Err(ConvError::TensorSize { expected: batch * self.desc.dst_size(), actual: dst.len() });
        }
        Ok(())
    }

    /// Run the pipeline over every batch item.
    ///
    /// `scratch` must hold at least [`ConvEngine::external_buffer_size`]
    /// bytes; with `None` the engine allocates and keeps its own buffer.
    pub fn forward<S: Element, D: Element>(
        &mut self,
        src: &[S],
        scratch: Option<&mut [u8]>,
        dst: &mut [D],
    ) -> ConvResult<()> {
        self.check_io(src, dst)?;
        let packed = self.packed.as_deref().ok_or(ConvError::NotConfigured)?;
        let mut arena = self.buffers.arena(scratch)?;
        let mut views = self.regions.carve(&mut arena)?;
        let (src_n, dst_n) = (self.desc.src_size(), self.desc.dst_size());
        log::trace!("{}: forward batch {}", self.topology.name(), self.desc.batch());
        for (s, d) in src.chunks_exact(src_n).zip(dst.chunks_exact_mut(dst_n)) {
            with_kernel!(&self.kind, k => k.run_item(packed, &mut views, s, d));
        }
        Ok(())
    }

    /// [`ConvEngine::forward`] for runtime-typed views.
    pub fn forward_tensor(
        &mut self,
        src: TensorSlice<'_>,
        scratch: Option<&mut [u8]>,
        dst: TensorSliceMut<'_>,
    ) -> ConvResult<()> {
        match (src, dst) {
            (TensorSlice::F32(s), TensorSliceMut::F32(d)) => self.forward(s, scratch, d),
            (TensorSlice::F32(s), TensorSliceMut::BF16(d)) => self.forward(s, scratch, d),
            (TensorSlice::BF16(s), TensorSliceMut::F32(d)) => self.forward(s, scratch, d),
            (TensorSlice::BF16(s), TensorSliceMut::BF16(d)) => self.forward(s, scratch, d),
        }
    }

    /// Batch items in parallel, each with its own scratch. Produces the same
    /// bits as [`ConvEngine::forward`].
    pub fn forward_parallel<S: Element, D: Element>(&self, src: &[S], dst: &mut [D]) -> ConvResult<()> {
        self.check_io(src, dst)?;
        let packed = self.packed.as_deref().ok_or(ConvError::NotConfigured)?;
        let (src_n, dst_n) = (self.desc.src_size(), self.desc.dst_size());
        let layout = self.buffers.layout();
        log::trace!("{}: parallel forward batch {}", self.topology.name(), self.desc.batch());
        dst.par_chunks_exact_mut(dst_n)
            .zip(src.par_chunks_exact(src_n))
            .try_for_each(|(d, s)| {
                let mut buffers = BufferManager::new(layout.clone());
                let mut arena = buffers.arena(None)?;
                let mut views = self.regions.carve(&mut arena)?;
                with_kernel!(&self.kind, k => k.run_item(packed, &mut views, s, d));
                Ok(())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationKind;
    use crate::cache_params::CacheTopology;
    use crate::isa::MicroTile;
    use crate::stage::{ConvStage, ElementType, TensorLayout};

    fn config() -> EngineConfig {
        EngineConfig::new(CacheTopology::new(32 << 10, 1 << 20, 8 << 20), MicroTile::new(8, 2).unwrap())
    }

    fn cd_desc() -> FusedPipelineDescriptor {
        FusedPipelineDescriptor::new(
            2,
            vec![
                ConvStage::pointwise(4, 4, 3, 8, ActivationKind::Relu).unwrap(),
                ConvStage::depthwise(4, 4, 8, 3, 1, 1, ActivationKind::Identity).unwrap(),
            ],
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_description_and_sizes() {
        let engine = ConvEngine::new(cd_desc(), config()).unwrap();
        assert_eq!(engine.topology(), Topology::Cd);
        assert_eq!(engine.description(), "Portable::MergedCd");
        assert!(engine.external_buffer_size() > 0);
        assert_eq!(engine.internal_buffer_size(), 0);
        assert!(engine.tile_params().is_some());
        assert!(engine.gemm_params().is_none());
    }

    #[test]
    fn test_forward_before_params() {
        let mut engine = ConvEngine::new(cd_desc(), config()).unwrap();
        let src = vec![0.0f32; 2 * 4 * 4 * 3];
        let mut dst = vec![0.0f32; 2 * 4 * 4 * 8];
        assert_eq!(engine.forward(&src, None, &mut dst), Err(ConvError::NotConfigured));
    }

    #[test]
    fn test_io_checks() {
        let mut engine = ConvEngine::new(cd_desc(), config()).unwrap();
        let w0 = vec![0.5f32; 3 * 8];
        let w1 = vec![0.25f32; 9 * 8];
        engine.set_params(&[StageParams::new(&w0), StageParams::new(&w1)]).unwrap();
        assert!(engine.internal_buffer_size() > 0);

        let src = vec![0.0f32; 2 * 4 * 4 * 3];
        let mut short = vec![0.0f32; 10];
        assert!(matches!(engine.forward(&src, None, &mut short), Err(ConvError::TensorSize { .. })));
        let mut wrong = vec![bf16::ZERO; 2 * 4 * 4 * 8];
        assert_eq!(
            engine.forward(&src, None, &mut wrong),
            Err(ConvError::ElementTypeMismatch { expected: ElementType::F32, actual: ElementType::Bf16 })
        );
        let mut dst = vec![0.0f32; 2 * 4 * 4 * 8];
        let mut tiny = vec![0u8; 16];
        assert!(matches!(
            engine.forward(&src, Some(&mut tiny[..]), &mut dst),
            Err(ConvError::InsufficientScratch { .. })
        ));
        assert!(engine.forward_tensor(TensorSlice::F32(&src), None, TensorSliceMut::F32(&mut dst)).is_ok());
    }

    #[test]
    fn test_set_params_validates() {
        let mut engine = ConvEngine::new(cd_desc(), config()).unwrap();
        let w0 = vec![0.5f32; 3 * 8];
        assert!(matches!(engine.set_params(&[StageParams::new(&w0)]), Err(ConvError::InvalidParams(_))));
        let bad = vec![0.5f32; 7];
        let w1 = vec![0.25f32; 9 * 8];
        assert!(engine.set_params(&[StageParams::new(&bad), StageParams::new(&w1)]).is_err());
        assert!(!engine.is_configured());
    }

    #[test]
    fn test_unsupported_topology() {
        let grouped = ConvStage::builder(4, 4, 8, 8).group(2).layout(TensorLayout::Nchw).build().unwrap();
        let desc = FusedPipelineDescriptor::new(1, vec![grouped], false).unwrap();
        assert!(matches!(ConvEngine::new(desc, config()), Err(ConvError::UnsupportedTopology(_))));
    }

    #[test]
    fn test_parallel_matches_serial() {
        let mut engine = ConvEngine::new(cd_desc(), config()).unwrap();
        let w0: Vec<f32> = (0..24).map(|i| (i % 5) as f32 * 0.25 - 0.5).collect();
        let w1: Vec<f32> = (0..72).map(|i| (i % 7) as f32 * 0.125).collect();
        engine.set_params(&[StageParams::new(&w0), StageParams::new(&w1)]).unwrap();
        let src: Vec<f32> = (0..96).map(|i| (i % 11) as f32 * 0.1 - 0.4).collect();
        let mut serial = vec![0.0f32; 256];
        let mut parallel = vec![0.0f32; 256];
        engine.forward(&src, None, &mut serial).unwrap();
        engine.forward_parallel(&src, &mut parallel).unwrap();
        assert_eq!(serial, parallel);
    }
}
