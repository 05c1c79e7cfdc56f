//! Portable row-band kernels behind the compute primitives.
//!
//! | Kernel | Reads | Writes |
//! |---|---|---|
//! | [`convert_rows`] | source rows (`f32`/`bf16`) | bf16 ring rows, channel padded |
//! | [`input_rows`] | bf16 rows × packed bf16 panel | f32 rows, `act(sum + bias)` |
//! | [`depthwise_rows`] | f32 or bf16 rows × f32 taps | any [`Element`] rows |
//! | [`output_rows`] | bf16 rows × packed bf16 panel | f32 accumulator (accumulate or finalize) |
//! | [`im2col`] / [`gemm_block`] | channels-first image | channels-first output block |
//!
//! Dense reductions always walk the source channels in ascending order and
//! accumulate into a single f32, so splitting the reduction over channel
//! tiles yields the same bits as a single pass.

use half::bf16;

use crate::activation::ActivationKind;
use crate::stage::ConvStage;
use crate::traits::Element;

/// Maps `(row, column)` to the first channel of a pixel.
///
/// Full images use an unbounded row mask; ring buffers wrap rows with
/// `row & (buf_h - 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RowLayout {
    pub width: usize,
    pub stride: usize,
    pub offset: usize,
    mask: usize,
}

impl RowLayout {
    pub fn image(width: usize, stride: usize) -> Self {
        Self { width, stride, offset: 0, mask: usize::MAX }
    }

    pub fn ring(width: usize, stride: usize, buf_h: usize) -> Self {
        debug_assert!(buf_h.is_power_of_two());
        Self { width, stride, offset: 0, mask: buf_h - 1 }
    }

    /// Start at channel `offset` of every pixel.
    pub fn with_offset(self, offset: usize) -> Self {
        Self { offset, ..self }
    }

    #[inline(always)]
    pub fn at(&self, y: usize, x: usize) -> usize {
        ((y & self.mask) * self.width + x) * self.stride + self.offset
    }
}

/// Bf16 weights re-tiled as `[d / panel][depth / 2][panel][2]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PackedPanel<'a> {
    pub data: &'a [bf16],
    pub depth: usize,
    pub panel: usize,
}

impl PackedPanel<'_> {
    #[inline(always)]
    pub fn at(&self, k: usize, d: usize) -> f32 {
        let idx = ((d / self.panel * (self.depth / 2) + k / 2) * self.panel + d % self.panel) * 2 + (k & 1);
        self.data[idx].to_f32()
    }
}

/// F32 depthwise taps re-tiled as `[c / mi_c][area][mi_c]`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DepthwiseTaps<'a> {
    pub data: &'a [f32],
    pub area: usize,
    pub mi_c: usize,
}

impl DepthwiseTaps<'_> {
    #[inline(always)]
    pub fn at(&self, k: usize, c: usize) -> f32 {
        self.data[(c / self.mi_c * self.area + k) * self.mi_c + c % self.mi_c]
    }
}

/// `act(sum + bias[c])` with the stage's packed parameters, both already
/// offset to the current channel tile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Epilogue<'a> {
    pub act: &'a ActivationKind,
    pub bias: &'a [f32],
    pub params: &'a [f32],
}

impl Epilogue<'_> {
    #[inline(always)]
    pub fn apply(&self, sum: f32, c: usize) -> f32 {
        self.act.apply(sum + self.bias[c], self.params, c)
    }
}

/// Starting value of an output-stage accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputInit {
    Zero,
    /// Continue from the partial sums (or residual seed) already in place.
    Load,
}

/// Round source rows onto the bf16 grid, zero-filling channels
/// `src_c..dst_l.stride`.
pub(crate) fn convert_rows<S: Element>(
    src: &[S],
    src_l: RowLayout,
    src_c: usize,
    rows: (usize, usize),
    dst: &mut [bf16],
    dst_l: RowLayout,
) {
    for y in rows.0..rows.1 {
        for x in 0..src_l.width {
            let s = &src[src_l.at(y, x)..][..src_c];
            let d = &mut dst[dst_l.at(y, x)..][..dst_l.stride];
            for (o, v) in d.iter_mut().zip(s) {
                *o = v.to_bf16();
            }
            d[src_c..].fill(bf16::ZERO);
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn input_rows(
    src: &[bf16],
    src_l: RowLayout,
    src_c: usize,
    rows: (usize, usize),
    weight: PackedPanel<'_>,
    channels: usize,
    epi: &Epilogue<'_>,
    dst: &mut [f32],
    dst_l: RowLayout,
) {
    for y in rows.0..rows.1 {
        for x in 0..src_l.width {
            let s = &src[src_l.at(y, x)..][..src_c];
            let o = dst_l.at(y, x);
            for dc in 0..channels {
                let mut sum = 0.0f32;
                for (k, v) in s.iter().enumerate() {
                    sum += v.to_f32() * weight.at(k, dc);
                }
                dst[o + dc] = epi.apply(sum, dc);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn depthwise_rows<S: Element, D: Element>(
    stage: &ConvStage,
    src: &[S],
    src_l: RowLayout,
    rows: (usize, usize),
    taps: DepthwiseTaps<'_>,
    channels: usize,
    epi: &Epilogue<'_>,
    dst: &mut [D],
    dst_l: RowLayout,
) {
    for y in rows.0..rows.1 {
        for x in 0..stage.dst_w {
            let o = dst_l.at(y, x);
            for c in 0..channels {
                let mut sum = 0.0f32;
                for ky in 0..stage.kernel_y {
                    let Some(sy) = (y * stage.stride_y + ky).checked_sub(stage.pad_y) else { continue };
                    if sy >= stage.src_h {
                        continue;
                    }
                    for kx in 0..stage.kernel_x {
                        let Some(sx) = (x * stage.stride_x + kx).checked_sub(stage.pad_x) else { continue };
                        if sx >= stage.src_w {
                            continue;
                        }
                        sum += src[src_l.at(sy, sx) + c].to_f32() * taps.at(ky * stage.kernel_x + kx, c);
                    }
                }
                dst[o + c] = D::from_f32(epi.apply(sum, c));
            }
        }
    }
}

/// Accumulate `channels` source channels of the tile into every
/// destination channel of `acc`; apply the epilogue when `finalize`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn output_rows(
    src: &[bf16],
    src_l: RowLayout,
    rows: (usize, usize),
    channels: usize,
    weight: PackedPanel<'_>,
    epi: &Epilogue<'_>,
    acc: &mut [f32],
    acc_l: RowLayout,
    dst_c: usize,
    init: OutputInit,
    finalize: bool,
) {
    for y in rows.0..rows.1 {
        for x in 0..src_l.width {
            let s = &src[src_l.at(y, x)..][..channels];
            let a = &mut acc[acc_l.at(y, x)..][..dst_c];
            for (dc, out) in a.iter_mut().enumerate() {
                let mut sum = match init {
                    OutputInit::Zero => 0.0f32,
                    OutputInit::Load => *out,
                };
                for (k, v) in s.iter().enumerate() {
                    sum += v.to_f32() * weight.at(k, dc);
                }
                *out = if finalize { epi.apply(sum, dc) } else { sum };
            }
        }
    }
}

/// Copy `src[range]` into `acc[range]` as f32.
pub(crate) fn seed_rows<S: Element>(src: &[S], acc: &mut [f32], range: std::ops::Range<usize>) {
    for (a, s) in acc[range.clone()].iter_mut().zip(&src[range]) {
        *a = s.to_f32();
    }
}

/// Round finished f32 values into the destination element type.
pub(crate) fn store_rows<D: Element>(acc: &[f32], dst: &mut [D], range: std::ops::Range<usize>) {
    for (d, a) in dst[range.clone()].iter_mut().zip(&acc[range]) {
        *d = D::from_f32(*a);
    }
}

/// Lower one channels-first image to bf16 patches `[dstH*dstW][depth]`,
/// reduction index `(sc * kY + ky) * kX + kx`, zero past the real depth.
pub(crate) fn im2col<S: Element>(stage: &ConvStage, src: &[S], depth: usize, dst: &mut [bf16]) {
    let plane = stage.src_h * stage.src_w;
    for dy in 0..stage.dst_h {
        for dx in 0..stage.dst_w {
            let row = &mut dst[(dy * stage.dst_w + dx) * depth..][..depth];
            let mut k = 0;
            for sc in 0..stage.src_c {
                for ky in 0..stage.kernel_y {
                    let sy = (dy * stage.stride_y + ky).checked_sub(stage.pad_y).filter(|&v| v < stage.src_h);
                    for kx in 0..stage.kernel_x {
                        let sx = (dx * stage.stride_x + kx).checked_sub(stage.pad_x).filter(|&v| v < stage.src_w);
                        row[k] = match (sy, sx) {
                            (Some(sy), Some(sx)) => src[sc * plane + sy * stage.src_w + sx].to_bf16(),
                            _ => bf16::ZERO,
                        };
                        k += 1;
                    }
                }
            }
            row[k..].fill(bf16::ZERO);
        }
    }
}

/// One `(macroD × macroK × macroH)` block of the channels-first GEMM.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GemmBlock<'a> {
    /// Patches `[N][a_stride]`.
    pub a: &'a [bf16],
    pub a_stride: usize,
    pub weight: PackedPanel<'a>,
    pub n: (usize, usize),
    pub d: (usize, usize),
    pub k: (usize, usize),
    /// Output element `(d, n)` lives at `(d - out_d0) * out_stride + n`.
    pub out_d0: usize,
    pub out_stride: usize,
    pub load: bool,
    pub finalize: bool,
}

pub(crate) fn gemm_block<D: Element>(block: &GemmBlock<'_>, epi: &Epilogue<'_>, out: &mut [D]) {
    for d in block.d.0..block.d.1 {
        let o = &mut out[(d - block.out_d0) * block.out_stride..];
        for n in block.n.0..block.n.1 {
            let a = &block.a[n * block.a_stride..];
            let mut sum = if block.load { o[n].to_f32() } else { 0.0f32 };
            for k in block.k.0..block.k.1 {
                sum += a[k].to_f32() * block.weight.at(k, d);
            }
            o[n] = D::from_f32(if block.finalize { epi.apply(sum, d) } else { sum });
        }
    }
}
