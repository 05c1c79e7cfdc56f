//! Pointwise activations as plain functions of `(x, channel)`.

/// ReLU: `max(x, 0)`
#[inline(never)]
pub fn relu(x: f32, _c: usize) -> f32 {
    x.max(0.0)
}

/// Identity
#[inline(never)]
pub fn identity(x: f32, _c: usize) -> f32 {
    x
}

/// Clamp: `min(max(x, lower), upper)`
pub fn clamp(lower: f32, upper: f32) -> impl Fn(f32, usize) -> f32 {
    move |x, _| x.max(lower).min(upper)
}

/// PReLU: `x > 0 ? x : slopes[c] * x`
pub fn prelu(slopes: &[f32]) -> impl Fn(f32, usize) -> f32 + '_ {
    move |x, c| if x > 0.0 { x } else { slopes[c] * x }
}

/// Hard swish: `x * clamp(x + shift, 0, 2 * shift) * scale`
pub fn hswish(shift: f32, scale: f32) -> impl Fn(f32, usize) -> f32 {
    move |x, _| x * (x + shift).clamp(0.0, 2.0 * shift) * scale
}

/// Swish: `x * sigmoid(slope * x)`
pub fn swish(slope: f32) -> impl Fn(f32, usize) -> f32 {
    move |x, _| x / (1.0 + (-slope * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_activations() {
        assert_eq!(relu(-1.0, 0), 0.0);
        assert_eq!(clamp(0.0, 6.0)(7.5, 0), 6.0);
        assert_eq!(prelu(&[0.5, 0.25])(-4.0, 1), -1.0);
        assert_eq!(hswish(3.0, 1.0 / 6.0)(-5.0, 0), 0.0);
        assert!((swish(1.0)(0.0, 0)).abs() < 1e-7);
    }
}
