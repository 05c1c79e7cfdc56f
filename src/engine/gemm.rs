//! Single dense channels-first convolution as a blocked GEMM.
//!
//! The image is lowered to bf16 patches once per batch item, then the
//! output is produced block by block: destination channels in `macro_d`,
//! reduction in `macro_k`, pixels in bands of `macro_h` rows. The first
//! reduction block starts from zero, the last applies bias and activation.

use super::{FusedKernel, RegionMap, Scratch};
use crate::buffer::BufferLayout;
use crate::descriptor::FusedPipelineDescriptor;
use crate::error::ConvResult;
use crate::kernels::{self, GemmBlock, PackedPanel};
use crate::packing::PackedStage;
use crate::primitive::{ComputePrimitive, StageRole};
use crate::stage::ConvStage;
use crate::tiling::{GemmParams, TilingPlanner};
use crate::traits::Element;

const ROLES: [StageRole; 1] = [StageRole::Gemm];

#[derive(Debug, Clone)]
pub struct NchwGemm {
    stage: ConvStage,
    prim: ComputePrimitive,
    params: GemmParams,
}

impl NchwGemm {
    pub(crate) fn new(
        desc: &FusedPipelineDescriptor,
        planner: &TilingPlanner,
        layout: &mut BufferLayout,
    ) -> ConvResult<(Self, RegionMap)> {
        let stage = *desc.first();
        let prim = ComputePrimitive::resolve(StageRole::Gemm, &stage)?;
        let params = planner.plan_gemm(&stage);
        let regions = RegionMap {
            buf0: Some(layout.push("gemm.patches", params.n * params.buf_k * 2)),
            sum: params.sum_buf.then(|| layout.push("gemm.sums", params.macro_d * params.n * 4)),
            ..RegionMap::default()
        };
        Ok((Self { stage, prim, params }, regions))
    }

    pub fn params(&self) -> &GemmParams {
        &self.params
    }
}

impl FusedKernel for NchwGemm {
    fn roles(&self) -> &'static [StageRole] {
        &ROLES
    }

    fn output_tile(&self) -> usize {
        self.params.micro_k
    }

    fn run_item<S: Element, D: Element>(
        &self,
        packed: &[PackedStage],
        scratch: &mut Scratch<'_>,
        src: &[S],
        dst: &mut [D],
    ) {
        let gp = &self.params;
        let stage = &self.stage;
        let packed = &packed[0];
        let n = gp.n;

        kernels::im2col(stage, src, gp.buf_k, &mut scratch.buf0[..n * gp.buf_k]);
        let a = &*scratch.buf0;
        let weight = PackedPanel { data: packed.dense(), depth: gp.buf_k, panel: gp.micro_d };
        let band = gp.macro_h * stage.dst_w;
        let (bias, act_params) = (&packed.bias[..], &packed.params[..]);

        for d0 in (0..stage.dst_c).step_by(gp.macro_d) {
            let d1 = (d0 + gp.macro_d).min(stage.dst_c);
            for k0 in (0..gp.k).step_by(gp.macro_k) {
                let k1 = (k0 + gp.macro_k).min(gp.k);
                for n0 in (0..n).step_by(band) {
                    let mut block = GemmBlock {
                        a,
                        a_stride: gp.buf_k,
                        weight,
                        n: (n0, (n0 + band).min(n)),
                        d: (d0, d1),
                        k: (k0, k1),
                        out_d0: 0,
                        out_stride: n,
                        load: k0 > 0,
                        finalize: k1 == gp.k,
                    };
                    if let Some(out) = D::as_f32_slice_mut(dst) {
                        self.prim.gemm(&block, bias, act_params, out);
                    } else if gp.sum_buf {
                        block.out_d0 = d0;
                        self.prim.gemm(&block, bias, act_params, &mut *scratch.sum);
                    } else {
                        // Single reduction block: results go out in one pass.
                        self.prim.gemm(&block, bias, act_params, dst);
                    }
                }
            }
            if gp.sum_buf {
                for d in d0..d1 {
                    let sums = &scratch.sum[(d - d0) * n..][..n];
                    for (o, &v) in dst[d * n..][..n].iter_mut().zip(sums) {
                        *o = D::from_f32(v);
                    }
                }
            }
        }
    }
}
