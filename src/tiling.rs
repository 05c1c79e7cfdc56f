//! Cache-driven tiling schedules.
//!
//! Two levels: the macro-channel tile `ma_c` keeps one slice of every
//! stage's weights inside half of L3, and the row windows keep the live
//! intermediate row bands inside L2. Planning never fails; when no row
//! window fits, a single-row window is used.

use crate::cache_params::CacheTopology;
use crate::descriptor::{FusedPipelineDescriptor, Topology};
use crate::isa::{EngineConfig, MicroTile};
use crate::stage::{ConvStage, ElementType};

#[inline]
pub fn align_hi(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[inline]
pub fn align_lo(value: usize, align: usize) -> usize {
    value / align * align
}

/// Smallest power of two `>= value` (and `>= 1`).
#[inline]
pub fn pow2_hi(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

#[inline]
pub(crate) fn restrict_range(value: usize, lo: usize, hi: usize) -> usize {
    value.max(lo).min(hi)
}

/// Row schedule of one pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowWindow {
    /// Rows produced per iteration.
    pub y_step: usize,
    /// Rows the first iteration must produce.
    pub y_start: usize,
    /// Ring buffer height (power of two).
    pub buf_h: usize,
}

impl RowWindow {
    /// End of the band that starts at `beg`, for a position `limit` rows high.
    #[inline]
    pub fn end(&self, beg: usize, limit: usize) -> usize {
        restrict_range(beg + self.y_step, self.y_start, limit)
    }
}

/// Schedule of a merged (Cdc / Cd / Dc) pipeline.
///
/// Row position 0 is the converted source, 1 the depthwise input and 2 the
/// depthwise output. `dw[i]` / `dp[i]` are the per-channel strides of
/// stage `i`'s packed weights / parameters, so the slice of a channel tile
/// starting at `c` begins at `c * dw[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileParams {
    pub mi_c: usize,
    pub mi_k: usize,
    pub ma_c: usize,
    pub rows: [RowWindow; 3],
    pub dw: [usize; 3],
    pub dp: [usize; 3],
}

impl TileParams {
    #[inline]
    pub fn panel(&self) -> usize {
        self.mi_c * 2
    }
}

/// Schedule of the channels-first GEMM engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmParams {
    pub micro_d: usize,
    pub micro_k: usize,
    pub macro_d: usize,
    pub macro_k: usize,
    pub macro_h: usize,
    /// Output pixels per image.
    pub n: usize,
    /// Real reduction depth `srcC * kY * kX`.
    pub k: usize,
    pub buf_d: usize,
    pub buf_k: usize,
    /// Partial sums need an f32 region (bf16 output, split reduction).
    pub sum_buf: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TilingPlanner {
    cache: CacheTopology,
    micro: MicroTile,
}

impl TilingPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self { cache: config.cache, micro: config.micro }
    }

    pub fn cache(&self) -> &CacheTopology {
        &self.cache
    }

    /// Plan a merged pipeline. `topology` must be one of the merged shapes.
    pub fn plan(&self, topology: Topology, p: &FusedPipelineDescriptor) -> TileParams {
        let MicroTile { mi_c, mi_k } = self.micro;
        let f = self.micro.panel();
        let weight_bytes: usize = p.stages().iter().map(|s| self.weight_bytes(s)).sum();
        let count = weight_bytes / (self.cache.l3 / 2).max(1) + 1;

        let (tiled, dw_stage, round_k) = match topology {
            Topology::Cdc => (p.stage(1).src_c, p.stage(1), true),
            Topology::Cd => (p.stage(1).src_c, p.stage(1), false),
            Topology::Dc => (p.stage(0).src_c, p.stage(0), true),
            Topology::DenseGemm => (p.first().dst_c, p.first(), false),
        };
        let mut ma_c = align_hi((tiled / count).max(1), f);
        if round_k {
            ma_c = align_hi(ma_c, mi_k);
        }

        let c0 = p.first();
        let mut step = dw_stage.dst_h;
        let rows = loop {
            let rows = self.row_chain(dw_stage, c0.src_h, step);
            let bytes = self.scratch_bytes(topology, p, &rows, ma_c);
            if bytes <= self.cache.l2 {
                break rows;
            }
            if step == 1 {
                log::warn!(
                    "{}: single-row window needs {bytes} scratch bytes, L2 is {}",
                    topology.name(),
                    self.cache.l2
                );
                break rows;
            }
            step -= 1;
        };

        let per_channel = |s: &ConvStage| usize::from(s.activation.is_per_channel());
        let (dw, dp) = match topology {
            Topology::Cdc => (
                [align_hi(c0.src_c, mi_k), p.stage(1).kernel_area(), align_hi(p.stage(2).dst_c, f)],
                [per_channel(c0), per_channel(p.stage(1)), per_channel(p.stage(2))],
            ),
            Topology::Cd => (
                [align_hi(c0.src_c, mi_k), p.stage(1).kernel_area(), 0],
                [per_channel(c0), per_channel(p.stage(1)), 0],
            ),
            Topology::Dc => (
                [c0.kernel_area(), align_hi(p.stage(1).dst_c, f), 0],
                [per_channel(c0), per_channel(p.stage(1)), 0],
            ),
            Topology::DenseGemm => ([0; 3], [0; 3]),
        };

        let params = TileParams { mi_c, mi_k, ma_c, rows, dw, dp };
        log::debug!(
            "{} tiling: weights {weight_bytes} B / {count} tile(s), ma_c {ma_c}, rows {:?} ({})",
            topology.name(),
            params.rows,
            self.cache
        );
        params
    }

    /// Back-propagate a depthwise output step to the rows each earlier
    /// position must hold.
    fn row_chain(&self, dw: &ConvStage, src_h0: usize, step: usize) -> [RowWindow; 3] {
        let (k, s, pad) = (dw.kernel_y, dw.stride_y, dw.pad_y);
        let r2 = RowWindow { y_step: step, y_start: step, buf_h: pow2_hi(step) };

        let window = (step - 1) * s + k;
        let y_step1 = step * s;
        let y_start1 = window.saturating_sub(pad).min(dw.src_h);
        // Every row from the band's first tap to the newest written row stays resident.
        let r1 = RowWindow {
            y_step: y_step1,
            y_start: y_start1,
            buf_h: pow2_hi(window.max(y_start1).max(y_step1 + pad)),
        };

        let y_start0 = y_start1.min(src_h0);
        let r0 = RowWindow { y_step: y_step1, y_start: y_start0, buf_h: pow2_hi(y_step1.max(y_start0)) };
        [r0, r1, r2]
    }

    fn scratch_bytes(&self, topology: Topology, p: &FusedPipelineDescriptor, rows: &[RowWindow; 3], ma_c: usize) -> usize {
        let c0 = p.first();
        let b0 = || rows[0].buf_h * c0.src_w * align_hi(c0.src_c, self.micro.mi_k) * 2;
        let b1 = || rows[1].buf_h * p.stage(1).src_w * ma_c * 4;
        match topology {
            Topology::Cdc => b0() + b1() + rows[2].buf_h * p.stage(1).dst_w * ma_c * 2,
            Topology::Cd => b0() + b1(),
            Topology::Dc => rows[2].buf_h * p.stage(1).src_w * ma_c * 2,
            Topology::DenseGemm => 0,
        }
    }

    fn weight_bytes(&self, s: &ConvStage) -> usize {
        if s.is_depthwise() {
            s.kernel_area() * s.src_c * 4
        } else {
            align_hi(s.src_c * s.kernel_area(), self.micro.mi_k) * align_hi(s.dst_c, self.micro.panel()) * 2
        }
    }

    /// Plan the blocked GEMM of a single channels-first convolution.
    pub fn plan_gemm(&self, stage: &ConvStage) -> GemmParams {
        let micro_d = self.micro.panel();
        let micro_k = self.micro.mi_k;
        let n = stage.dst_h * stage.dst_w;
        let k = stage.src_c * stage.kernel_area();
        let buf_d = align_hi(stage.dst_c, micro_d);
        let buf_k = align_hi(k, micro_k);

        let macro_k = align_lo(self.cache.l1 / micro_d / 2, micro_k).clamp(micro_k, buf_k);
        let macro_h = (self.cache.l2 / macro_k / stage.dst_w / 2).clamp(1, stage.dst_h);
        let mut macro_d = align_lo(self.cache.l3 / macro_k / 2, micro_d).clamp(micro_d, buf_d);
        let sum_buf = stage.dst_type == ElementType::Bf16 && macro_k < buf_k;
        if !sum_buf && macro_d > stage.dst_c {
            macro_d = stage.dst_c;
        }

        let params = GemmParams { micro_d, micro_k, macro_d, macro_k, macro_h, n, k, buf_d, buf_k, sum_buf };
        log::debug!("NchwGemm tiling: {params:?} ({})", self.cache);
        params
    }
}
