//! Depthwise → pointwise. The depthwise stage reads the source image
//! directly; only its bf16 output rows are buffered.

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

const ROLES: [StageRole; 2] = [StageRole::Depthwise, StageRole::Output];

#[derive(Debug, Clone)]
pub struct MergedDc {
    stages: [ConvStage; 2],
    prims: [ComputePrimitive; 2],
    tile: TileParams,
}

impl MergedDc {
    pub(crate) fn new(
        desc: &FusedPipelineDescriptor,
        planner: &TilingPlanner,
        layout: &mut BufferLayout,
    ) -> ConvResult<(Self, RegionMap)> {
        let stages = [*desc.stage(0), *desc.stage(1)];
        let prims = [
            ComputePrimitive::resolve(ROLES[0], &stages[0])?,
            ComputePrimitive::resolve(ROLES[1], &stages[1])?,
        ];
        let tile = planner.plan(Topology::Dc, desc);
        let [c0, c1] = &stages;
        let regions = RegionMap {
            buf2: Some(layout.push("dc.depthwise_rows", tile.rows[2].buf_h * c0.dst_w * tile.ma_c * 2)),
            sum: (c1.dst_type == ElementType::Bf16).then(|| layout.push("dc.sums", c1.dst_size() * 4)),
            ..RegionMap::default()
        };
        Ok((Self { stages, prims, tile }, regions))
    }

    pub fn tile(&self) -> &TileParams {
        &self.tile
    }

    fn bands<S: Element, D: Element>(
        &self,
        packed: &[PackedStage],
        buf2: &mut [bf16],
        src: &[S],
        acc: &mut [f32],
        mut out: Option<&mut [D]>,
    ) {
        let [c0, c1] = &self.stages;
        let [p0, p1] = &self.prims;
        let (s0, s1) = (&packed[0], &packed[1]);
        let tp = &self.tile;
        let row_elems = c1.dst_w * c1.dst_c;
        let l2 = RowLayout::ring(c0.dst_w, tp.ma_c, tp.rows[2].buf_h);
        let l_acc = RowLayout::image(c1.dst_w, c1.dst_c);

        for c in (0..c0.src_c).step_by(tp.ma_c) {
            let mac = tp.ma_c.min(c0.src_c - c);
            let last = c + mac == c0.src_c;
            let w0 = DepthwiseTaps { data: &s0.taps()[c * tp.dw[0]..], area: c0.kernel_area(), mi_c: tp.mi_c };
            let w1 = PackedPanel { data: &s1.dense()[c * tp.dw[1]..], depth: align_hi(mac, tp.mi_k), panel: tp.panel() };
            let l_src = RowLayout::image(c0.src_w, c0.src_c).with_offset(c);
            let init = if c == 0 { OutputInit::Zero } else { OutputInit::Load };

            let mut y = 0;
            while y < c0.dst_h {
                let e = tp.rows[2].end(y, c0.dst_h);
                p0.depthwise(c0, src, l_src, (y, e), w0, mac, &s0.bias[c..], &s0.params[c * tp.dp[0]..], buf2, l2);
                p1.output(buf2, l2, (y, e), mac, w1, &s1.bias, &s1.params, acc, l_acc, init, last);
                if last {
                    if let Some(out) = out.as_deref_mut() {
                        kernels::store_rows(acc, out, y * row_elems..e * row_elems);
                    }
                }
                y = e;
            }
        }
    }
}

impl FusedKernel for MergedDc {
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
        let buf2 = &mut *scratch.buf2;
        if let Some(acc) = D::as_f32_slice_mut(dst) {
            self.bands(packed, buf2, src, acc, None::<&mut [D]>);
        } else {
            let acc = &mut scratch.sum[..self.stages[1].dst_size()];
            self.bands(packed, buf2, src, acc, Some(dst));
        }
    }
}
