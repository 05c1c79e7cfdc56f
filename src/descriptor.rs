//! Fused pipeline descriptor and topology selection.
//!
//! A descriptor is an ordered chain of 1-3 [`ConvStage`]s whose tensor
//! shapes thread through unchanged. [`Topology::select`] maps it onto exactly
//! one engine shape:
//!
//! | Topology | Stages | Predicate |
//! |----------|--------|-----------|
//! | `Cdc` | 3 | stage 0 is a 1×1 dense convolution |
//! | `Cd` | 2 | stage 0 is a 1×1 dense convolution |
//! | `Dc` | 2 | stage 1 is dense and stage 0 is not 1×1 dense |
//! | `DenseGemm` | 1 | dense, channels-first layout |
//!
//! The merged shapes additionally require every stage to be channels-last.

use crate::error::{ConvError, ConvResult};
use crate::stage::{ConvStage, TensorLayout};

pub const MAX_STAGES: usize = 3;

/// Immutable chain of convolutions executed as one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPipelineDescriptor {
    stages: Vec<ConvStage>,
    batch: usize,
    add_residual: bool,
}

impl FusedPipelineDescriptor {
    pub fn new(batch: usize, stages: Vec<ConvStage>, add_residual: bool) -> ConvResult<Self> {
        if batch == 0 {
            return Err(ConvError::InvalidShapeChain("batch must be > 0".into()));
        }
        if stages.is_empty() || stages.len() > MAX_STAGES {
            return Err(ConvError::InvalidShapeChain(format!(
                "expected 1..={MAX_STAGES} stages, got {}",
                stages.len()
            )));
        }
        for (i, pair) in stages.windows(2).enumerate() {
            let (a, b) = (&pair[0], &pair[1]);
            if (a.dst_h, a.dst_w, a.dst_c) != (b.src_h, b.src_w, b.src_c) {
                return Err(ConvError::InvalidShapeChain(format!(
                    "stage {i} output {}x{}x{} does not match stage {} input {}x{}x{}",
                    a.dst_h, a.dst_w, a.dst_c, i + 1, b.src_h, b.src_w, b.src_c
                )));
            }
            if a.layout != b.layout {
                return Err(ConvError::InvalidShapeChain(format!(
                    "stage {i} layout {:?} differs from stage {} layout {:?}",
                    a.layout, i + 1, b.layout
                )));
            }
        }
        if add_residual {
            let first = &stages[0];
            let last = &stages[stages.len() - 1];
            if stages.len() != 3 || first.src_size() != last.dst_size() {
                return Err(ConvError::InvalidShapeChain(format!(
                    "residual add needs 3 stages with equal source and output sizes \
                     (stages {}, src {}, dst {})",
                    stages.len(),
                    first.src_size(),
                    last.dst_size()
                )));
            }
        }
        Ok(Self { stages, batch, add_residual })
    }

    #[inline]
    pub fn stages(&self) -> &[ConvStage] {
        &self.stages
    }

    #[inline]
    pub fn stage(&self, i: usize) -> &ConvStage {
        &self.stages[i]
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn add_residual(&self) -> bool {
        self.add_residual
    }

    #[inline]
    pub fn first(&self) -> &ConvStage {
        &self.stages[0]
    }

    #[inline]
    pub fn last(&self) -> &ConvStage {
        &self.stages[self.stages.len() - 1]
    }

    /// Elements of one batch item of the pipeline source.
    #[inline]
    pub fn src_size(&self) -> usize {
        self.first().src_size()
    }

    /// Elements of one batch item of the pipeline output.
    #[inline]
    pub fn dst_size(&self) -> usize {
        self.last().dst_size()
    }

    fn all_channels_last(&self) -> bool {
        self.stages.iter().all(|s| s.layout == TensorLayout::Nhwc)
    }
}

/// Fusion shape handled by one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topology {
    /// Pointwise → depthwise → pointwise.
    Cdc,
    /// Pointwise → depthwise.
    Cd,
    /// Depthwise → pointwise.
    Dc,
    /// Single dense convolution as a blocked GEMM.
    DenseGemm,
}

impl Topology {
    pub const ALL: [Topology; 4] = [Topology::Cdc, Topology::Cd, Topology::Dc, Topology::DenseGemm];

    /// Structural predicate of this topology.
    pub fn matches(self, p: &FusedPipelineDescriptor) -> bool {
        let pointwise0 = p.first().is_dense() && p.first().is_1x1();
        match self {
            Topology::Cdc => p.count() == 3 && pointwise0 && p.all_channels_last(),
            Topology::Cd => p.count() == 2 && pointwise0 && p.all_channels_last(),
            Topology::Dc => {
                p.count() == 2 && !pointwise0 && p.stage(1).is_dense() && p.all_channels_last()
            }
            Topology::DenseGemm => {
                p.count() == 1 && p.first().is_dense() && p.first().layout == TensorLayout::Nchw
            }
        }
    }

    /// The single topology whose predicate accepts `p`.
    pub fn select(p: &FusedPipelineDescriptor) -> ConvResult<Topology> {
        let mut hits = Topology::ALL.iter().copied().filter(|t| t.matches(p));
        match (hits.next(), hits.next()) {
            (Some(t), None) => Ok(t),
            (None, _) => Err(ConvError::UnsupportedTopology(describe(p))),
            (Some(a), Some(b)) => Err(ConvError::UnsupportedTopology(format!(
                "ambiguous topology {a:?}/{b:?} for {}",
                describe(p)
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Topology::Cdc => "MergedCdc",
            Topology::Cd => "MergedCd",
            Topology::Dc => "MergedDc",
            Topology::DenseGemm => "NchwGemm",
        }
    }
}

fn describe(p: &FusedPipelineDescriptor) -> String {
    let stages: Vec<String> = p
        .stages()
        .iter()
        .map(|s| {
            format!(
                "{}x{} g{} {:?} {}->{}",
                s.kernel_y, s.kernel_x, s.group, s.layout, s.src_c, s.dst_c
            )
        })
        .collect();
    format!("[{}] residual={}", stages.join(", "), p.add_residual())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ActivationKind;

    fn cdc_stages() -> Vec<ConvStage> {
        vec![
            ConvStage::pointwise(8, 8, 16, 32, ActivationKind::Relu).unwrap(),
            ConvStage::depthwise(8, 8, 32, 3, 1, 1, ActivationKind::Identity).unwrap(),
            ConvStage::pointwise(8, 8, 32, 16, ActivationKind::Identity).unwrap(),
        ]
    }

    #[test]
    fn test_cdc_selected() {
        let p = FusedPipelineDescriptor::new(1, cdc_stages(), true).unwrap();
        assert_eq!(Topology::select(&p).unwrap(), Topology::Cdc);
        assert_eq!(Topology::select(&p).unwrap(), Topology::select(&p).unwrap());
    }

    #[test]
    fn test_cd_and_dc_selected() {
        let cd = FusedPipelineDescriptor::new(1, cdc_stages()[..2].to_vec(), false).unwrap();
        assert_eq!(Topology::select(&cd).unwrap(), Topology::Cd);
        let dc = FusedPipelineDescriptor::new(1, cdc_stages()[1..].to_vec(), false).unwrap();
        assert_eq!(Topology::select(&dc).unwrap(), Topology::Dc);
    }

    #[test]
    fn test_dense_gemm_needs_channels_first() {
        let nchw = ConvStage::builder(8, 8, 4, 8)
            .kernel(3, 3)
            .pad(1, 1)
            .layout(TensorLayout::Nchw)
            .build()
            .unwrap();
        let p = FusedPipelineDescriptor::new(2, vec![nchw], false).unwrap();
        assert_eq!(Topology::select(&p).unwrap(), Topology::DenseGemm);

        let nhwc = ConvStage::builder(8, 8, 4, 8).kernel(3, 3).pad(1, 1).build().unwrap();
        let p = FusedPipelineDescriptor::new(1, vec![nhwc], false).unwrap();
        assert!(matches!(Topology::select(&p), Err(ConvError::UnsupportedTopology(_))));
    }

    #[test]
    fn test_shape_chain_mismatch() {
        let mut stages = cdc_stages();
        stages[2] = ConvStage::pointwise(8, 8, 24, 16, ActivationKind::Identity).unwrap();
        assert!(matches!(
            FusedPipelineDescriptor::new(1, stages, false),
            Err(ConvError::InvalidShapeChain(_))
        ));
    }

    #[test]
    fn test_residual_rules() {
        let two = cdc_stages()[..2].to_vec();
        assert!(FusedPipelineDescriptor::new(1, two, true).is_err());
        let mut stages = cdc_stages();
        stages[2] = ConvStage::pointwise(8, 8, 32, 8, ActivationKind::Identity).unwrap();
        assert!(FusedPipelineDescriptor::new(1, stages, true).is_err());
    }

    #[test]
    fn test_stage_count_bounds() {
        assert!(FusedPipelineDescriptor::new(1, vec![], false).is_err());
        let mut four = cdc_stages();
        four.push(ConvStage::pointwise(8, 8, 16, 16, ActivationKind::Identity).unwrap());
        assert!(FusedPipelineDescriptor::new(1, four, false).is_err());
        assert!(FusedPipelineDescriptor::new(0, cdc_stages(), false).is_err());
    }
}
