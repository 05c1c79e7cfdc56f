//! Pointwise → depthwise → pointwise.
//!
//! Per channel tile `[c, c + ma_c)` of the expanded tensor the rows cascade
//! through three ring buffers: bf16 source rows, f32 expanded rows and bf16
//! depthwise rows. The projection then adds the tile's share of the
//! reduction into the full-width f32 accumulator, and the last tile applies
//! bias and activation.

use half::bf16;

use super::{FusedKernel, RegionMap, Scratch};
use crate::buffer::BufferLayout;
use crate::descriptor::{FusedPipelineDescriptor, Topology};
use crate::error::ConvResult;
use crate::kernels::{self, DepthwiseTaps, OutputInit, PackedPanel, RowLayout};
use crate::packing::PackedStage;
use crate::primitive::{ComputePrimitive, StageRole};
use crate::stage::{ConvStage, ElementType};
use crate::tiling::{align_hi, TileParams, TilingPlanner};
use crate::traits::Element;

const ROLES: [StageRole; 3] = [StageRole::Input, StageRole::Depthwise, StageRole::Output];

#[derive(Debug, Clone)]
pub struct MergedCdc {
    stages: [ConvStage; 3],
    prims: [ComputePrimitive; 3],
    tile: TileParams,
    residual: bool,
}

impl MergedCdc {
    pub(crate) fn new(
        desc: &FusedPipelineDescriptor,
        planner: &TilingPlanner,
        layout: &mut BufferLayout,
    ) -> ConvResult<(Self, RegionMap)> {
        let stages = [*desc.stage(0), *desc.stage(1), *desc.stage(2)];
        let prims = [
            ComputePrimitive::resolve(ROLES[0], &stages[0])?,
            ComputePrimitive::resolve(ROLES[1], &stages[1])?,
            ComputePrimitive::resolve(ROLES[2], &stages[2])?,
        ];
        let tile = planner.plan(Topology::Cdc, desc);
        let [c0, c1, c2] = &stages;
        let regions = RegionMap {
            buf0: Some(layout.push("cdc.src_rows", tile.rows[0].buf_h * c0.src_w * align_hi(c0.src_c, tile.mi_k) * 2)),
            buf1: Some(layout.push("cdc.expanded_rows", tile.rows[1].buf_h * c1.src_w * tile.ma_c * 4)),
            buf2: Some(layout.push("cdc.depthwise_rows", tile.rows[2].buf_h * c1.dst_w * tile.ma_c * 2)),
            sum: (c2.dst_type == ElementType::Bf16).then(|| layout.push("cdc.sums", c2.dst_size() * 4)),
        };
        Ok((Self { stages, prims, tile, residual: desc.add_residual() }, regions))
    }

    pub fn tile(&self) -> &TileParams {
        &self.tile
    }

    #[allow(clippy::too_many_arguments)]
    fn bands<S: Element, D: Element>(
        &self,
        packed: &[PackedStage],
        buf0: &mut [bf16],
        buf1: &mut [f32],
        buf2: &mut [bf16],
        src: &[S],
        acc: &mut [f32],
        mut out: Option<&mut [D]>,
    ) {
        let [c0, c1, c2] = &self.stages;
        let [p0, p1, p2] = &self.prims;
        let (s0, s1, s2) = (&packed[0], &packed[1], &packed[2]);
        let tp = &self.tile;
        let f = tp.panel();
        let k0 = align_hi(c0.src_c, tp.mi_k);
        let channels = c1.src_c;
        let row_elems = c2.dst_w * c2.dst_c;

        let l_src = RowLayout::image(c0.src_w, c0.src_c);
        let l0 = RowLayout::ring(c0.src_w, k0, tp.rows[0].buf_h);
        let l1 = RowLayout::ring(c1.src_w, tp.ma_c, tp.rows[1].buf_h);
        let l2 = RowLayout::ring(c1.dst_w, tp.ma_c, tp.rows[2].buf_h);
        let l_acc = RowLayout::image(c2.dst_w, c2.dst_c);

        for c in (0..channels).step_by(tp.ma_c) {
            let mac = tp.ma_c.min(channels - c);
            let first = c == 0;
            let last = c + mac == channels;
            let w0 = PackedPanel { data: &s0.dense()[c * tp.dw[0]..], depth: k0, panel: f };
            let w1 = DepthwiseTaps { data: &s1.taps()[c * tp.dw[1]..], area: c1.kernel_area(), mi_c: tp.mi_c };
            let w2 = PackedPanel { data: &s2.dense()[c * tp.dw[2]..], depth: align_hi(mac, tp.mi_k), panel: f };
            let (b0, a0) = (&s0.bias[c..], &s0.params[c * tp.dp[0]..]);
            let (b1, a1) = (&s1.bias[c..], &s1.params[c * tp.dp[1]..]);
            let init = if first && !self.residual { OutputInit::Zero } else { OutputInit::Load };

            let (mut y0, mut y1, mut y2) = (0, 0, 0);
            while y2 < c1.dst_h {
                let e0 = tp.rows[0].end(y0, c0.src_h);
                let e1 = tp.rows[1].end(y1, c1.src_h);
                let e2 = tp.rows[2].end(y2, c1.dst_h);
                kernels::convert_rows(src, l_src, c0.src_c, (y0, e0), buf0, l0);
                p0.input(buf0, l0, c0.src_c, (y1, e1), w0, mac, b0, a0, buf1, l1);
                p1.depthwise(c1, &*buf1, l1, (y2, e2), w1, mac, b1, a1, buf2, l2);
                if self.residual && first {
                    kernels::seed_rows(src, acc, y2 * row_elems..e2 * row_elems);
                }
                p2.output(buf2, l2, (y2, e2), mac, w2, &s2.bias, &s2.params, acc, l_acc, init, last);
                if last {
                    if let Some(out) = out.as_deref_mut() {
                        kernels::store_rows(acc, out, y2 * row_elems..e2 * row_elems);
                    }
                }
                (y0, y1, y2) = (e0, e1, e2);
            }
        }
    }
}

impl FusedKernel for MergedCdc {
    fn roles(&self) -> &'static [StageRole] {
        &ROLES
    }

    fn output_tile(&self) -> usize {
        self.tile.ma_c
    }

    fn run_item<S: Element, D: Element>(
        &self,
        packed: &[PackedStage],
        scratch: &mut Scratch<'_>,
        src: &[S],
        dst: &mut [D],
    ) {
        let (buf0, buf1, buf2) = (&mut *scratch.buf0, &mut *scratch.buf1, &mut *scratch.buf2);
        if let Some(acc) = D::as_f32_slice_mut(dst) {
            self.bands(packed, buf0, buf1, buf2, src, acc, None::<&mut [D]>);
        } else {
            let acc = &mut scratch.sum[..self.stages[2].dst_size()];
            self.bands(packed, buf0, buf1, buf2, src, acc, Some(dst));
        }
    }
}
