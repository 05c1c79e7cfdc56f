//! Single convolution descriptor.

use crate::activation::ActivationKind;
use crate::error::{ConvError, ConvResult};

/// Storage type of a boundary tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ElementType {
    #[default]
    F32,
    Bf16,
}

impl ElementType {
    #[inline]
    pub fn size_bytes(self) -> usize {
        match self {
            ElementType::F32 => 4,
            ElementType::Bf16 => 2,
        }
    }
}

/// Memory order of activations. `Nhwc` is the channels-last ("transposed")
/// order used by the merged pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

/// Shape, activation and element types of one convolution.
///
/// Built through [`ConvStage::builder`]; the destination spatial size is
/// derived from the source size, kernel, stride and pad so it can never
/// disagree with them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvStage {
    pub src_h: usize,
    pub src_w: usize,
    pub src_c: usize,
    pub dst_h: usize,
    pub dst_w: usize,
    pub dst_c: usize,
    pub kernel_y: usize,
    pub kernel_x: usize,
    pub stride_y: usize,
    pub stride_x: usize,
    pub pad_y: usize,
    pub pad_x: usize,
    pub group: usize,
    pub activation: ActivationKind,
    pub src_type: ElementType,
    pub dst_type: ElementType,
    pub layout: TensorLayout,
}

/// Standard convolution output size; `None` when the kernel does not fit.
#[inline]
pub fn conv_output_size(src: usize, kernel: usize, stride: usize, pad: usize) -> Option<usize> {
    let padded = src + 2 * pad;
    if stride == 0 || kernel == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

impl ConvStage {
    pub fn builder(src_h: usize, src_w: usize, src_c: usize, dst_c: usize) -> ConvStageBuilder {
        ConvStageBuilder {
            src_h,
            src_w,
            src_c,
            dst_c,
            kernel: (1, 1),
            stride: (1, 1),
            pad: (0, 0),
            group: 1,
            activation: ActivationKind::Identity,
            src_type: ElementType::F32,
            dst_type: ElementType::F32,
            layout: TensorLayout::Nhwc,
        }
    }

    /// Pointwise shorthand: 1×1 kernel, stride 1, no pad.
    pub fn pointwise(h: usize, w: usize, src_c: usize, dst_c: usize, activation: ActivationKind) -> ConvResult<Self> {
        Self::builder(h, w, src_c, dst_c).activation(activation).build()
    }

    /// Depthwise shorthand with a square kernel.
    pub fn depthwise(
        h: usize,
        w: usize,
        c: usize,
        kernel: usize,
        stride: usize,
        pad: usize,
        activation: ActivationKind,
    ) -> ConvResult<Self> {
        Self::builder(h, w, c, c)
            .kernel(kernel, kernel)
            .stride(stride, stride)
            .pad(pad, pad)
            .group(c)
            .activation(activation)
            .build()
    }

    /// 1×1 kernel, unit stride, no padding.
    #[inline]
    pub fn is_1x1(&self) -> bool {
        self.kernel_y == 1
            && self.kernel_x == 1
            && self.stride_y == 1
            && self.stride_x == 1
            && self.pad_y == 0
            && self.pad_x == 0
    }

    #[inline]
    pub fn is_dense(&self) -> bool {
        self.group == 1
    }

    #[inline]
    pub fn is_depthwise(&self) -> bool {
        // A single-channel convolution counts as dense.
        self.group > 1 && self.group == self.src_c && self.group == self.dst_c
    }

    #[inline]
    pub fn kernel_area(&self) -> usize {
        self.kernel_y * self.kernel_x
    }

    #[inline]
    pub fn src_size(&self) -> usize {
        self.src_h * self.src_w * self.src_c
    }

    #[inline]
    pub fn dst_size(&self) -> usize {
        self.dst_h * self.dst_w * self.dst_c
    }

    /// Length of the planar HWIO weight array: `[kY][kX][srcC][dstC/group]`.
    #[inline]
    pub fn weight_len(&self) -> usize {
        self.kernel_area() * self.src_c * self.dst_c / self.group
    }
}

#[derive(Debug, Clone)]
pub struct ConvStageBuilder {
    src_h: usize,
    src_w: usize,
    src_c: usize,
    dst_c: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    pad: (usize, usize),
    group: usize,
    activation: ActivationKind,
    src_type: ElementType,
    dst_type: ElementType,
    layout: TensorLayout,
}

impl ConvStageBuilder {
    pub fn kernel(mut self, ky: usize, kx: usize) -> Self {
        self.kernel = (ky, kx);
        self
    }

    pub fn stride(mut self, sy: usize, sx: usize) -> Self {
        self.stride = (sy, sx);
        self
    }

    pub fn pad(mut self, py: usize, px: usize) -> Self {
        self.pad = (py, px);
        self
    }

    pub fn group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn src_type(mut self, t: ElementType) -> Self {
        self.src_type = t;
        self
    }

    pub fn dst_type(mut self, t: ElementType) -> Self {
        self.dst_type = t;
        self
    }

    pub fn layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn build(self) -> ConvResult<ConvStage> {
        let (ky, kx) = self.kernel;
        let (sy, sx) = self.stride;
        let (py, px) = self.pad;
        if self.src_h == 0 || self.src_w == 0 || self.src_c == 0 || self.dst_c == 0 {
            return Err(ConvError::InvalidStage(format!(
                "zero dimension in src {}x{}x{} -> dstC {}",
                self.src_h, self.src_w, self.src_c, self.dst_c
            )));
        }
        if self.group == 0 || self.src_c % self.group != 0 || self.dst_c % self.group != 0 {
            return Err(ConvError::InvalidStage(format!(
                "group {} does not divide srcC {} and dstC {}",
                self.group, self.src_c, self.dst_c
            )));
        }
        let dst_h = conv_output_size(self.src_h, ky, sy, py);
        let dst_w = conv_output_size(self.src_w, kx, sx, px);
        let (Some(dst_h), Some(dst_w)) = (dst_h, dst_w) else {
            return Err(ConvError::InvalidStage(format!(
                "kernel {ky}x{kx} stride {sy}x{sx} pad {py}x{px} does not fit src {}x{}",
                self.src_h, self.src_w
            )));
        };
        Ok(ConvStage {
            src_h: self.src_h,
            src_w: self.src_w,
            src_c: self.src_c,
            dst_h,
            dst_w,
            dst_c: self.dst_c,
            kernel_y: ky,
            kernel_x: kx,
            stride_y: sy,
            stride_x: sx,
            pad_y: py,
            pad_x: px,
            group: self.group,
            activation: self.activation,
            src_type: self.src_type,
            dst_type: self.dst_type,
            layout: self.layout,
        })
    }
}
