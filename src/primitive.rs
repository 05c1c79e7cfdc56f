//! Compute primitive selection.
//!
//! Each stage of a pipeline runs through exactly one primitive, picked once
//! at configuration time from its role, activation and channel grouping.
//! The mapping is a closed match: a combination that falls outside it is a
//! configuration error, never a runtime fallback.

use half::bf16;

use crate::activation::{ActivationKind, ActivationTag};
use crate::error::{ConvError, ConvResult};
use crate::kernels::{self, DepthwiseTaps, Epilogue, GemmBlock, OutputInit, PackedPanel, RowLayout};
use crate::stage::ConvStage;
use crate::traits::Element;

/// Position of a stage inside its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageRole {
    /// Leading 1×1 expansion of Cdc / Cd.
    Input,
    Depthwise,
    /// Trailing 1×1 projection of Cdc / Dc.
    Output,
    /// Whole-layer dense convolution.
    Gemm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupStructure {
    /// Dense 1×1, unit stride, no pad.
    Pointwise,
    /// Dense with a spatial kernel.
    Dense,
    Depthwise,
    Grouped,
}

impl GroupStructure {
    pub fn of(stage: &ConvStage) -> Self {
        if stage.is_depthwise() {
            GroupStructure::Depthwise
        } else if !stage.is_dense() {
            GroupStructure::Grouped
        } else if stage.is_1x1() {
            GroupStructure::Pointwise
        } else {
            GroupStructure::Dense
        }
    }
}

/// Resolved primitive. The activation rides along so the epilogue is fixed
/// for the lifetime of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComputePrimitive {
    InputPointwise(ActivationKind),
    Depthwise(ActivationKind),
    OutputPointwise(ActivationKind),
    Gemm(ActivationKind),
}

impl ComputePrimitive {
    pub fn resolve(role: StageRole, stage: &ConvStage) -> ConvResult<Self> {
        let act = stage.activation;
        let group = GroupStructure::of(stage);
        match (role, group) {
            (StageRole::Input, GroupStructure::Pointwise) => Ok(Self::InputPointwise(act)),
            (StageRole::Depthwise, GroupStructure::Depthwise) => Ok(Self::Depthwise(act)),
            (StageRole::Output, GroupStructure::Pointwise) => Ok(Self::OutputPointwise(act)),
            (StageRole::Gemm, GroupStructure::Pointwise | GroupStructure::Dense) => Ok(Self::Gemm(act)),
            _ => Err(ConvError::UnmappedPrimitive { role, activation: act.tag(), group }),
        }
    }

    pub fn role(&self) -> StageRole {
        match self {
            Self::InputPointwise(_) => StageRole::Input,
            Self::Depthwise(_) => StageRole::Depthwise,
            Self::OutputPointwise(_) => StageRole::Output,
            Self::Gemm(_) => StageRole::Gemm,
        }
    }

    pub fn activation(&self) -> &ActivationKind {
        match self {
            Self::InputPointwise(a) | Self::Depthwise(a) | Self::OutputPointwise(a) | Self::Gemm(a) => a,
        }
    }

    pub fn tag(&self) -> ActivationTag {
        self.activation().tag()
    }

    #[inline]
    fn epilogue<'a>(&'a self, bias: &'a [f32], params: &'a [f32]) -> Epilogue<'a> {
        Epilogue { act: self.activation(), bias, params }
    }

    /// 1×1 expansion of `rows` into `channels` destination channels of the
    /// current tile. `bias` and `params` start at the tile.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub(crate) fn input(
        &self,
        src: &[bf16],
        src_l: RowLayout,
        src_c: usize,
        rows: (usize, usize),
        weight: PackedPanel<'_>,
        channels: usize,
        bias: &[f32],
        params: &[f32],
        dst: &mut [f32],
        dst_l: RowLayout,
    ) {
        debug_assert_eq!(self.role(), StageRole::Input);
        let epi = self.epilogue(bias, params);
        kernels::input_rows(src, src_l, src_c, rows, weight, channels, &epi, dst, dst_l);
    }

    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub(crate) fn depthwise<S: Element, D: Element>(
        &self,
        stage: &ConvStage,
        src: &[S],
        src_l: RowLayout,
        rows: (usize, usize),
        taps: DepthwiseTaps<'_>,
        channels: usize,
        bias: &[f32],
        params: &[f32],
        dst: &mut [D],
        dst_l: RowLayout,
    ) {
        debug_assert_eq!(self.role(), StageRole::Depthwise);
        let epi = self.epilogue(bias, params);
        kernels::depthwise_rows(stage, src, src_l, rows, taps, channels, &epi, dst, dst_l);
    }

    /// 1×1 projection of the tile's `channels` source channels into the
    /// full-width accumulator; the epilogue runs only when `finalize`.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub(crate) fn output(
        &self,
        src: &[bf16],
        src_l: RowLayout,
        rows: (usize, usize),
        channels: usize,
        weight: PackedPanel<'_>,
        bias: &[f32],
        params: &[f32],
        acc: &mut [f32],
        acc_l: RowLayout,
        init: OutputInit,
        finalize: bool,
    ) {
        debug_assert_eq!(self.role(), StageRole::Output);
        let epi = self.epilogue(bias, params);
        let dst_c = acc_l.stride;
        kernels::output_rows(src, src_l, rows, channels, weight, &epi, acc, acc_l, dst_c, init, finalize);
    }

    #[inline]
    pub(crate) fn gemm<D: Element>(&self, block: &GemmBlock<'_>, bias: &[f32], params: &[f32], out: &mut [D]) {
        debug_assert_eq!(self.role(), StageRole::Gemm);
        let epi = self.epilogue(bias, params);
        kernels::gemm_block(block, &epi, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_structure() {
        let pw = ConvStage::pointwise(4, 4, 8, 16, ActivationKind::Relu).unwrap();
        let dw = ConvStage::depthwise(4, 4, 8, 3, 1, 1, ActivationKind::Relu).unwrap();
        let dense = ConvStage::builder(4, 4, 8, 8).kernel(3, 3).pad(1, 1).build().unwrap();
        let grouped = ConvStage::builder(4, 4, 8, 8).group(2).build().unwrap();
        assert_eq!(GroupStructure::of(&pw), GroupStructure::Pointwise);
        assert_eq!(GroupStructure::of(&dw), GroupStructure::Depthwise);
        assert_eq!(GroupStructure::of(&dense), GroupStructure::Dense);
        assert_eq!(GroupStructure::of(&grouped), GroupStructure::Grouped);
    }

    #[test]
    fn test_every_activation_resolves_for_valid_roles() {
        let acts = [
            ActivationKind::Identity,
            ActivationKind::Relu,
            ActivationKind::LeakyRelu { slope: 0.1 },
            ActivationKind::RestrictRange { lower: 0.0, upper: 6.0 },
            ActivationKind::Prelu,
            ActivationKind::Elu { alpha: 1.0 },
            ActivationKind::Hswish { shift: 3.0, scale: 1.0 / 6.0 },
            ActivationKind::Mish { threshold: 20.0 },
            ActivationKind::HardSigmoid { scale: 0.2, shift: 0.5 },
            ActivationKind::Swish { slope: 1.0 },
            ActivationKind::Gelu,
        ];
        for act in acts {
            let pw = ConvStage::pointwise(4, 4, 8, 8, act).unwrap();
            let dw = ConvStage::depthwise(4, 4, 8, 3, 1, 1, act).unwrap();
            let p = ComputePrimitive::resolve(StageRole::Input, &pw).unwrap();
            assert_eq!(p.tag(), act.tag());
            assert_eq!(ComputePrimitive::resolve(StageRole::Output, &pw).unwrap().role(), StageRole::Output);
            assert_eq!(ComputePrimitive::resolve(StageRole::Depthwise, &dw).unwrap(), ComputePrimitive::Depthwise(act));
            assert!(ComputePrimitive::resolve(StageRole::Gemm, &pw).is_ok());
        }
    }

    #[test]
    fn test_unmapped_combinations() {
        let dw = ConvStage::depthwise(4, 4, 8, 3, 1, 1, ActivationKind::Relu).unwrap();
        let err = ComputePrimitive::resolve(StageRole::Input, &dw).unwrap_err();
        assert_eq!(
            err,
            ConvError::UnmappedPrimitive {
                role: StageRole::Input,
                activation: ActivationTag::Relu,
                group: GroupStructure::Depthwise,
            }
        );
        let grouped = ConvStage::builder(4, 4, 8, 8).group(2).build().unwrap();
        assert!(ComputePrimitive::resolve(StageRole::Gemm, &grouped).is_err());
        let dense = ConvStage::builder(4, 4, 8, 8).kernel(3, 3).pad(1, 1).build().unwrap();
        assert!(ComputePrimitive::resolve(StageRole::Output, &dense).is_err());
    }
}
