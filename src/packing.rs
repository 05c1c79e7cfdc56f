//! Weight, bias and activation-parameter packing.
//!
//! Planar weights arrive as HWIO float32 (`[kY][kX][srcC][dstC / group]`).
//! Dense stages are re-tiled into bf16 panels `[dstC / F][depth / 2][F][2]`
//! with `F = 2 * mi_c`; depthwise taps stay f32 as `[C / mi_c][kY*kX][mi_c]`.
//! Every padded cell is zero.

use half::bf16;

use crate::activation::ActivationKind;
use crate::error::{ConvError, ConvResult};
use crate::isa::MicroTile;
use crate::primitive::StageRole;
use crate::stage::ConvStage;
use crate::tiling::align_hi;

#[derive(Debug, Clone, PartialEq)]
pub enum PackedWeights {
    Dense(Vec<bf16>),
    Depthwise(Vec<f32>),
}

/// Everything one stage needs at forward time.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedStage {
    pub weights: PackedWeights,
    pub bias: Vec<f32>,
    pub params: Vec<f32>,
}

impl PackedStage {
    pub fn dense(&self) -> &[bf16] {
        match &self.weights {
            PackedWeights::Dense(w) => w,
            PackedWeights::Depthwise(_) => &[],
        }
    }

    pub fn taps(&self) -> &[f32] {
        match &self.weights {
            PackedWeights::Depthwise(w) => w,
            PackedWeights::Dense(_) => &[],
        }
    }

    pub fn size_bytes(&self) -> usize {
        let w = match &self.weights {
            PackedWeights::Dense(w) => w.len() * 2,
            PackedWeights::Depthwise(w) => w.len() * 4,
        };
        w + (self.bias.len() + self.params.len()) * 4
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WeightPacker {
    micro: MicroTile,
}

impl WeightPacker {
    pub fn new(micro: MicroTile) -> Self {
        Self { micro }
    }

    /// Pack one stage for `role`. `ma_c` is the macro-channel tile, used by
    /// the output role whose reduction is split across channel tiles.
    pub fn pack_stage(
        &self,
        role: StageRole,
        stage: &ConvStage,
        weights: &[f32],
        bias: Option<&[f32]>,
        params: Option<&[f32]>,
        ma_c: usize,
    ) -> ConvResult<PackedStage> {
        let weights = match role {
            StageRole::Input | StageRole::Gemm => PackedWeights::Dense(self.pack_dense(stage, weights)?),
            StageRole::Output => PackedWeights::Dense(self.pack_output(stage, weights, ma_c)?),
            StageRole::Depthwise => PackedWeights::Depthwise(self.pack_depthwise(stage, weights)?),
        };
        Ok(PackedStage {
            weights,
            bias: self.pack_bias(stage, bias)?,
            params: self.pack_params(stage, params)?,
        })
    }

    /// Reduction depth of a dense panel, padded to `mi_k`.
    #[inline]
    pub fn dense_depth(&self, stage: &ConvStage) -> usize {
        align_hi(stage.src_c * stage.kernel_area(), self.micro.mi_k)
    }

    /// Dense panel over the whole reduction, index `k = (sc * kY + ky) * kX + kx`.
    pub fn pack_dense(&self, stage: &ConvStage, weights: &[f32]) -> ConvResult<Vec<bf16>> {
        check_len("weights", stage.weight_len(), weights.len())?;
        let f = self.micro.panel();
        let depth = self.dense_depth(stage);
        let mut out = vec![bf16::ZERO; align_hi(stage.dst_c, f) * depth];
        let kx_n = stage.kernel_x;
        for ky in 0..stage.kernel_y {
            for kx in 0..kx_n {
                for sc in 0..stage.src_c {
                    let k = (sc * stage.kernel_y + ky) * kx_n + kx;
                    let row = &weights[((ky * kx_n + kx) * stage.src_c + sc) * stage.dst_c..][..stage.dst_c];
                    for (d, &w) in row.iter().enumerate() {
                        out[panel_index(k, d, depth, f)] = bf16::from_f32(w);
                    }
                }
            }
        }
        Ok(out)
    }

    /// 1×1 projection whose source channels are split into blocks of
    /// `ma_c`; each block is its own panel of depth `alignHi(block, mi_k)`
    /// starting at `c * alignHi(dstC, F)`.
    pub fn pack_output(&self, stage: &ConvStage, weights: &[f32], ma_c: usize) -> ConvResult<Vec<bf16>> {
        check_len("weights", stage.weight_len(), weights.len())?;
        if !stage.is_1x1() || ma_c == 0 || ma_c % self.micro.mi_k != 0 {
            return Err(ConvError::InvalidParams(format!(
                "output packing needs a 1x1 stage and a tile aligned to {} (got {ma_c})",
                self.micro.mi_k
            )));
        }
        let f = self.micro.panel();
        let d_aligned = align_hi(stage.dst_c, f);
        let tiles: Vec<(usize, usize)> = (0..stage.src_c)
            .step_by(ma_c)
            .map(|c| (c, align_hi(ma_c.min(stage.src_c - c), self.micro.mi_k)))
            .collect();
        let len = tiles.last().map_or(0, |&(c, depth)| c * d_aligned + depth * d_aligned);
        let mut out = vec![bf16::ZERO; len];
        for (c, depth) in tiles {
            let block = &mut out[c * d_aligned..][..depth * d_aligned];
            for sc in c..(c + ma_c).min(stage.src_c) {
                let row = &weights[sc * stage.dst_c..][..stage.dst_c];
                for (d, &w) in row.iter().enumerate() {
                    block[panel_index(sc - c, d, depth, f)] = bf16::from_f32(w);
                }
            }
        }
        Ok(out)
    }

    pub fn pack_depthwise(&self, stage: &ConvStage, weights: &[f32]) -> ConvResult<Vec<f32>> {
        check_len("weights", stage.weight_len(), weights.len())?;
        let mi_c = self.micro.mi_c;
        let area = stage.kernel_area();
        let c_n = stage.src_c;
        let mut out = vec![0.0f32; align_hi(c_n, mi_c) * area];
        for k in 0..area {
            for c in 0..c_n {
                out[(c / mi_c * area + k) * mi_c + c % mi_c] = weights[k * c_n + c];
            }
        }
        Ok(out)
    }

    pub fn pack_bias(&self, stage: &ConvStage, bias: Option<&[f32]>) -> ConvResult<Vec<f32>> {
        let mut out = vec![0.0f32; align_hi(stage.dst_c, self.micro.panel())];
        if let Some(b) = bias {
            check_len("bias", stage.dst_c, b.len())?;
            out[..b.len()].copy_from_slice(b);
        }
        Ok(out)
    }

    /// Control values of the stage's activation: two slots for scalar
    /// kinds, one padded slot per destination channel for per-channel kinds.
    pub fn pack_params(&self, stage: &ConvStage, params: Option<&[f32]>) -> ConvResult<Vec<f32>> {
        let supplied = params.unwrap_or(&[]);
        check_len("activation params", stage.activation.expected_params(stage.dst_c), supplied.len())?;
        let padded = align_hi(stage.dst_c, self.micro.panel());
        let out = match stage.activation {
            ActivationKind::Identity => vec![-f32::MAX, f32::MAX],
            ActivationKind::Relu => vec![0.0, f32::MAX],
            ActivationKind::RestrictRange { lower, upper } => vec![lower, upper],
            ActivationKind::Hswish { shift, scale } => vec![shift, scale],
            ActivationKind::HardSigmoid { scale, shift } => vec![scale, shift],
            ActivationKind::Elu { alpha } => vec![alpha, 0.0],
            ActivationKind::Mish { threshold } => vec![threshold, 0.0],
            ActivationKind::Swish { slope } => vec![slope, 0.0],
            ActivationKind::Gelu => vec![0.0, 0.0],
            ActivationKind::LeakyRelu { slope } => {
                let mut v = vec![0.0; padded];
                v[..stage.dst_c].fill(slope);
                v
            }
            ActivationKind::Prelu => {
                let mut v = vec![0.0; padded];
                v[..stage.dst_c].copy_from_slice(supplied);
                v
            }
        };
        Ok(out)
    }

    /// Read a dense panel back into HWIO float32.
    pub fn unpack_dense(&self, stage: &ConvStage, packed: &[bf16]) -> Vec<f32> {
        let f = self.micro.panel();
        let depth = self.dense_depth(stage);
        let mut out = vec![0.0f32; stage.weight_len()];
        for ky in 0..stage.kernel_y {
            for kx in 0..stage.kernel_x {
                for sc in 0..stage.src_c {
                    let k = (sc * stage.kernel_y + ky) * stage.kernel_x + kx;
                    for d in 0..stage.dst_c {
                        out[((ky * stage.kernel_x + kx) * stage.src_c + sc) * stage.dst_c + d] =
                            packed[panel_index(k, d, depth, f)].to_f32();
                    }
                }
            }
        }
        out
    }
}

#[inline(always)]
fn panel_index(k: usize, d: usize, depth: usize, panel: usize) -> usize {
    ((d / panel * (depth / 2) + k / 2) * panel + d % panel) * 2 + (k & 1)
}

fn check_len(what: &str, expected: usize, actual: usize) -> ConvResult<()> {
    if expected != actual {
        return Err(ConvError::InvalidParams(format!("{what}: expected {expected} values, got {actual}")));
    }
    Ok(())
}
