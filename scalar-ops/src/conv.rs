//! Direct convolutions over HWIO weights.
//!
//! Weight element `(ky, kx, ic, oc)` lives at
//! `((ky * kernel_x + kx) * (src_c / group) + ic) * dst_c + oc`; for a
//! depthwise stage (`group == src_c == dst_c`) that is `(ky * kernel_x + kx) * c + c`.

/// Geometry of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub src_h: usize,
    pub src_w: usize,
    pub src_c: usize,
    pub dst_c: usize,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub group: usize,
}

impl ConvShape {
    /// 1×1, unit stride, no padding.
    pub fn pointwise(h: usize, w: usize, src_c: usize, dst_c: usize) -> Self {
        Self::dense(h, w, src_c, dst_c, 1, 1, 0)
    }

    pub fn dense(h: usize, w: usize, src_c: usize, dst_c: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            src_h: h,
            src_w: w,
            src_c,
            dst_c,
            kernel_y: kernel,
            kernel_x: kernel,
            stride_y: stride,
            stride_x: stride,
            pad_y: pad,
            pad_x: pad,
            group: 1,
        }
    }

    pub fn depthwise(h: usize, w: usize, c: usize, kernel: usize, stride: usize, pad: usize) -> Self {
        Self { group: c, ..Self::dense(h, w, c, c, kernel, stride, pad) }
    }

    pub fn dst_h(&self) -> usize {
        (self.src_h + 2 * self.pad_y - self.kernel_y) / self.stride_y + 1
    }

    pub fn dst_w(&self) -> usize {
        (self.src_w + 2 * self.pad_x - self.kernel_x) / self.stride_x + 1
    }

    pub fn dst_len(&self) -> usize {
        self.dst_h() * self.dst_w() * self.dst_c
    }

    /// Sum of `src[..] * w[..]` for output pixel `(dy, dx)` and channel `oc`,
    /// with `src_at(sy, sx, ic)` addressing the source.
    fn reduce(&self, weights: &[f32], dy: usize, dx: usize, oc: usize, src_at: impl Fn(usize, usize, usize) -> f32) -> f32 {
        let ic_n = self.src_c / self.group;
        let oc_n = self.dst_c / self.group;
        let g = oc / oc_n;
        let mut sum = 0.0f32;
        for ky in 0..self.kernel_y {
            let Some(sy) = (dy * self.stride_y + ky).checked_sub(self.pad_y).filter(|&v| v < self.src_h) else {
                continue;
            };
            for kx in 0..self.kernel_x {
                let Some(sx) = (dx * self.stride_x + kx).checked_sub(self.pad_x).filter(|&v| v < self.src_w) else {
                    continue;
                };
                for ic in 0..ic_n {
                    let w = weights[((ky * self.kernel_x + kx) * ic_n + ic) * self.dst_c + oc];
                    sum += src_at(sy, sx, g * ic_n + ic) * w;
                }
            }
        }
        sum
    }
}

/// Channels-last convolution: `dst[y][x][oc] = act(sum + bias[oc], oc)`.
#[inline(never)]
pub fn conv2d_nhwc(
    shape: &ConvShape,
    src: &[f32],
    weights: &[f32],
    bias: &[f32],
    act: impl Fn(f32, usize) -> f32,
) -> Vec<f32> {
    let (dst_h, dst_w) = (shape.dst_h(), shape.dst_w());
    let mut dst = vec![0.0f32; shape.dst_len()];
    for dy in 0..dst_h {
        for dx in 0..dst_w {
            for oc in 0..shape.dst_c {
                let sum = shape.reduce(weights, dy, dx, oc, |sy, sx, ic| src[(sy * shape.src_w + sx) * shape.src_c + ic]);
                let b = bias.get(oc).copied().unwrap_or(0.0);
                dst[(dy * dst_w + dx) * shape.dst_c + oc] = act(sum + b, oc);
            }
        }
    }
    dst
}

/// Channels-first convolution: `dst[oc][y][x] = act(sum + bias[oc], oc)`.
#[inline(never)]
pub fn conv2d_nchw(
    shape: &ConvShape,
    src: &[f32],
    weights: &[f32],
    bias: &[f32],
    act: impl Fn(f32, usize) -> f32,
) -> Vec<f32> {
    let (dst_h, dst_w) = (shape.dst_h(), shape.dst_w());
    let plane = shape.src_h * shape.src_w;
    let mut dst = vec![0.0f32; shape.dst_len()];
    for oc in 0..shape.dst_c {
        for dy in 0..dst_h {
            for dx in 0..dst_w {
                let sum = shape.reduce(weights, dy, dx, oc, |sy, sx, ic| src[ic * plane + sy * shape.src_w + sx]);
                let b = bias.get(oc).copied().unwrap_or(0.0);
                dst[(oc * dst_h + dy) * dst_w + dx] = act(sum + b, oc);
            }
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activations::identity;

    #[test]
    fn test_pointwise_sums_channels() {
        let shape = ConvShape::pointwise(1, 2, 2, 1);
        let src = [1.0, 2.0, 3.0, 4.0];
        let dst = conv2d_nhwc(&shape, &src, &[0.5, 0.25], &[1.0], identity);
        assert_eq!(dst, vec![2.0, 3.5]);
    }

    #[test]
    fn test_depthwise_padding_counts_only_interior() {
        let shape = ConvShape::depthwise(2, 2, 1, 3, 1, 1);
        let dst = conv2d_nhwc(&shape, &[1.0; 4], &[1.0; 9], &[], identity);
        assert_eq!(dst, vec![4.0; 4]);
    }

    #[test]
    fn test_layouts_agree() {
        let shape = ConvShape::dense(3, 3, 2, 2, 3, 2, 1);
        let nhwc: Vec<f32> = (0..18).map(|i| i as f32 * 0.5).collect();
        let mut nchw = vec![0.0; 18];
        for p in 0..9 {
            for c in 0..2 {
                nchw[c * 9 + p] = nhwc[p * 2 + c];
            }
        }
        let w: Vec<f32> = (0..36).map(|i| (i % 5) as f32 - 2.0).collect();
        let a = conv2d_nhwc(&shape, &nhwc, &w, &[], identity);
        let b = conv2d_nchw(&shape, &nchw, &w, &[], identity);
        let (oh, ow) = (shape.dst_h(), shape.dst_w());
        for p in 0..oh * ow {
            for c in 0..2 {
                assert_eq!(a[p * 2 + c], b[c * oh * ow + p]);
            }
        }
    }
}
