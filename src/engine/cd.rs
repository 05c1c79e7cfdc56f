//! Pointwise → depthwise. The depthwise stage writes straight into its
//! channel slice of the destination.

use super::{FusedKernel, RegionMap, Scratch};
use crate::buffer::BufferLayout;
use crate::descriptor::{FusedPipelineDescriptor, Topology};
use crate::error::ConvResult;
use crate::kernels::{self, DepthwiseTaps, PackedPanel, RowLayout};
use crate::packing::PackedStage;
use crate::primitive::{ComputePrimitive, StageRole};
use crate::stage::ConvStage;
use crate::tiling::{align_hi, TileParams, TilingPlanner};
use crate::traits::Element;

const ROLES: [StageRole; 2] = [StageRole::Input, StageRole::Depthwise];

#[derive(Debug, Clone)]
pub struct MergedCd {
    stages: [ConvStage; 2],
    prims: [ComputePrimitive; 2],
    tile: TileParams,
}

impl MergedCd {
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
        let tile = planner.plan(Topology::Cd, desc);
        let [c0, c1] = &stages;
        let regions = RegionMap {
            buf0: Some(layout.push("cd.src_rows", tile.rows[0].buf_h * c0.src_w * align_hi(c0.src_c, tile.mi_k) * 2)),
            buf1: Some(layout.push("cd.expanded_rows", tile.rows[1].buf_h * c1.src_w * tile.ma_c * 4)),
            ..RegionMap::default()
        };
        Ok((Self { stages, prims, tile }, regions))
    }

    pub fn tile(&self) -> &TileParams {
        &self.tile
    }
}

impl FusedKernel for MergedCd {
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
        let [c0, c1] = &self.stages;
        let [p0, p1] = &self.prims;
        let (s0, s1) = (&packed[0], &packed[1]);
        let tp = &self.tile;
        let k0 = align_hi(c0.src_c, tp.mi_k);
        let (buf0, buf1) = (&mut *scratch.buf0, &mut *scratch.buf1);

        let l_src = RowLayout::image(c0.src_w, c0.src_c);
        let l0 = RowLayout::ring(c0.src_w, k0, tp.rows[0].buf_h);
        let l1 = RowLayout::ring(c1.src_w, tp.ma_c, tp.rows[1].buf_h);

        for c in (0..c1.src_c).step_by(tp.ma_c) {
            let mac = tp.ma_c.min(c1.src_c - c);
            let w0 = PackedPanel { data: &s0.dense()[c * tp.dw[0]..], depth: k0, panel: tp.panel() };
            let w1 = DepthwiseTaps { data: &s1.taps()[c * tp.dw[1]..], area: c1.kernel_area(), mi_c: tp.mi_c };
            let l_dst = RowLayout::image(c1.dst_w, c1.dst_c).with_offset(c);

            let (mut y0, mut y1, mut y2) = (0, 0, 0);
            while y2 < c1.dst_h {
                let e0 = tp.rows[0].end(y0, c0.src_h);
                let e1 = tp.rows[1].end(y1, c1.src_h);
                let e2 = tp.rows[2].end(y2, c1.dst_h);
                kernels::convert_rows(src, l_src, c0.src_c, (y0, e0), buf0, l0);
                p0.input(buf0, l0, c0.src_c, (y1, e1), w0, mac, &s0.bias[c..], &s0.params[c * tp.dp[0]..], buf1, l1);
                p1.depthwise(
                    c1,
                    &*buf1,
                    l1,
                    (y2, e2),
                    w1,
                    mac,
                    &s1.bias[c..],
                    &s1.params[c * tp.dp[1]..],
                    dst,
                    l_dst,
                );
                (y0, y1, y2) = (e0, e1, e2);
            }
        }
    }
}
