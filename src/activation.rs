//! Activation functions fused into the convolution epilogues.
//!
//! Every stage finishes with `act(sum + bias)`. Scalar-valued activations
//! carry their parameters in [`ActivationKind`]; Prelu slopes are
//! per channel and arrive with the weights.

/// Activation with its scalar parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    Identity,
    Relu,
    LeakyRelu { slope: f32 },
    RestrictRange { lower: f32, upper: f32 },
    /// Per-channel slopes supplied through `set_params`.
    Prelu,
    Elu { alpha: f32 },
    Hswish { shift: f32, scale: f32 },
    Mish { threshold: f32 },
    HardSigmoid { scale: f32, shift: f32 },
    Swish { slope: f32 },
    Gelu,
}

/// Parameter-free discriminant, used for primitive lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationTag {
    Identity,
    Relu,
    LeakyRelu,
    RestrictRange,
    Prelu,
    Elu,
    Hswish,
    Mish,
    HardSigmoid,
    Swish,
    Gelu,
}

impl ActivationTag {
    pub const ALL: [ActivationTag; 11] = [
        ActivationTag::Identity,
        ActivationTag::Relu,
        ActivationTag::LeakyRelu,
        ActivationTag::RestrictRange,
        ActivationTag::Prelu,
        ActivationTag::Elu,
        ActivationTag::Hswish,
        ActivationTag::Mish,
        ActivationTag::HardSigmoid,
        ActivationTag::Swish,
        ActivationTag::Gelu,
    ];
}

impl ActivationKind {
    pub fn tag(&self) -> ActivationTag {
        match self {
            Self::Identity => ActivationTag::Identity,
            Self::Relu => ActivationTag::Relu,
            Self::LeakyRelu { .. } => ActivationTag::LeakyRelu,
            Self::RestrictRange { .. } => ActivationTag::RestrictRange,
            Self::Prelu => ActivationTag::Prelu,
            Self::Elu { .. } => ActivationTag::Elu,
            Self::Hswish { .. } => ActivationTag::Hswish,
            Self::Mish { .. } => ActivationTag::Mish,
            Self::HardSigmoid { .. } => ActivationTag::HardSigmoid,
            Self::Swish { .. } => ActivationTag::Swish,
            Self::Gelu => ActivationTag::Gelu,
        }
    }

    /// One parameter per destination channel (padded) instead of two
    /// control slots.
    #[inline]
    pub fn is_per_channel(&self) -> bool {
        matches!(self, Self::LeakyRelu { .. } | Self::Prelu)
    }

    /// Number of values `set_params` expects for this stage.
    pub fn expected_params(&self, dst_c: usize) -> usize {
        match self {
            Self::Prelu => dst_c,
            _ => 0,
        }
    }

    /// Apply to `x` for destination channel `c`. `params` is the packed
    /// parameter buffer of the stage, already offset to the channel tile.
    #[inline(always)]
    pub fn apply(&self, x: f32, params: &[f32], c: usize) -> f32 {
        match *self {
            Self::Identity => x,
            Self::Relu => x.max(0.0),
            Self::LeakyRelu { .. } | Self::Prelu => {
                if x > 0.0 { x } else { params[c] * x }
            }
            Self::RestrictRange { .. } => x.max(params[0]).min(params[1]),
            Self::Elu { alpha } => {
                if x >= 0.0 { x } else { alpha * (x.exp() - 1.0) }
            }
            Self::Hswish { shift, scale } => (x.min(shift) + shift).max(0.0) * scale * x,
            Self::Mish { threshold } => {
                if x > threshold { x } else { x * x.exp().ln_1p().tanh() }
            }
            Self::HardSigmoid { scale, shift } => (x * scale + shift).min(1.0).max(0.0),
            Self::Swish { slope } => x / (1.0 + (-slope * x).exp()),
            Self::Gelu => {
                const INV_SQRT2: f32 = 0.7071067811865476;
                0.5 * x * (1.0 + erf(x * INV_SQRT2))
            }
        }
    }
}

/// Abramowitz & Stegun 7.1.26, max abs error 1.5e-7.
#[inline]
pub(crate) fn erf(x: f32) -> f32 {
    const A1: f32 = 0.254829592;
    const A2: f32 = -0.284496736;
    const A3: f32 = 1.421413741;
    const A4: f32 = -1.453152027;
    const A5: f32 = 1.061405429;
    const P: f32 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_and_identity() {
        assert_eq!(ActivationKind::Relu.apply(-2.0, &[], 0), 0.0);
        assert_eq!(ActivationKind::Relu.apply(3.0, &[], 0), 3.0);
        assert_eq!(ActivationKind::Identity.apply(-7.5, &[], 0), -7.5);
    }

    #[test]
    fn test_per_channel_slopes() {
        let params = [0.1, 0.2, 0.3];
        assert!((ActivationKind::Prelu.apply(-1.0, &params, 2) + 0.3).abs() < 1e-7);
        assert_eq!(ActivationKind::Prelu.apply(4.0, &params, 1), 4.0);
        let leaky = ActivationKind::LeakyRelu { slope: 0.5 };
        assert_eq!(leaky.apply(-2.0, &[0.5, 0.5], 1), -1.0);
    }

    #[test]
    fn test_restrict_range_reads_packed_bounds() {
        let act = ActivationKind::RestrictRange { lower: -1.0, upper: 6.0 };
        let params = [-1.0, 6.0];
        assert_eq!(act.apply(10.0, &params, 0), 6.0);
        assert_eq!(act.apply(-3.0, &params, 0), -1.0);
        assert_eq!(act.apply(2.0, &params, 0), 2.0);
    }

    #[test]
    fn test_hswish_and_hard_sigmoid() {
        let hs = ActivationKind::Hswish { shift: 3.0, scale: 1.0 / 6.0 };
        assert_eq!(hs.apply(-4.0, &[], 0), 0.0);
        assert!((hs.apply(4.0, &[], 0) - 4.0).abs() < 1e-6);
        let sig = ActivationKind::HardSigmoid { scale: 0.2, shift: 0.5 };
        assert_eq!(sig.apply(10.0, &[], 0), 1.0);
        assert_eq!(sig.apply(-10.0, &[], 0), 0.0);
        assert!((sig.apply(0.0, &[], 0) - 0.5).abs() < 1e-7);
    }

    #[test]
    fn test_smooth_activations() {
        let gelu = ActivationKind::Gelu;
        assert!(gelu.apply(0.0, &[], 0).abs() < 1e-6);
        assert!((gelu.apply(-2.0, &[], 0) - (-0.0455)).abs() < 1e-3);
        let swish = ActivationKind::Swish { slope: 1.0 };
        assert!((swish.apply(1.0, &[], 0) - 0.7310586).abs() < 1e-5);
        let mish = ActivationKind::Mish { threshold: 20.0 };
        assert!((mish.apply(1.0, &[], 0) - 0.8650984).abs() < 1e-5);
        assert_eq!(mish.apply(25.0, &[], 0), 25.0);
        let elu = ActivationKind::Elu { alpha: 1.0 };
        assert!((elu.apply(-1.0, &[], 0) - (-0.6321206)).abs() < 1e-6);
    }

    #[test]
    fn test_tags_are_distinct() {
        let mut tags = ActivationTag::ALL.to_vec();
        tags.dedup();
        assert_eq!(tags.len(), 11);
        assert_eq!(ActivationKind::Swish { slope: 2.0 }.tag(), ActivationTag::Swish);
    }
}
