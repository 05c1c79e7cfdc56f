use std::fmt::Debug;

use half::bf16;

use crate::stage::ElementType;

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for half::bf16 {}
}

/// Tensor element accepted at the pipeline boundary (stage 0 source, last
/// stage destination).
///
/// Compile-time monomorphization; the float32 path is a plain slice borrow.
pub trait Element: sealed::Sealed + Debug + Clone + Copy + Send + Sync + Default + 'static {
    const ZERO: Self;
    const ELEM: ElementType;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;

    /// Round to the bf16 grid used by the dense-stage operands.
    fn to_bf16(self) -> bf16;

    /// Zero-cost view as f32 when `Self == f32`.
    fn as_f32_slice(s: &[Self]) -> Option<&[f32]>;

    /// Zero-cost mutable view as f32 when `Self == f32`.
    fn as_f32_slice_mut(s: &mut [Self]) -> Option<&mut [f32]>;
}

impl Element for f32 {
    const ZERO: Self = 0.0;
    const ELEM: ElementType = ElementType::F32;

    #[inline(always)] fn from_f32(v: f32) -> Self { v }
    #[inline(always)] fn to_f32(self) -> f32 { self }
    #[inline(always)] fn to_bf16(self) -> bf16 { bf16::from_f32(self) }

    #[inline(always)]
    fn as_f32_slice(s: &[Self]) -> Option<&[f32]> { Some(s) }

    #[inline(always)]
    fn as_f32_slice_mut(s: &mut [Self]) -> Option<&mut [f32]> { Some(s) }
}

impl Element for bf16 {
    const ZERO: Self = bf16::ZERO;
    const ELEM: ElementType = ElementType::Bf16;

    #[inline(always)] fn from_f32(v: f32) -> Self { bf16::from_f32(v) }
    #[inline(always)] fn to_f32(self) -> f32 { bf16::to_f32(self) }
    #[inline(always)] fn to_bf16(self) -> bf16 { self }

    #[inline(always)] fn as_f32_slice(_s: &[Self]) -> Option<&[f32]> { None }
    #[inline(always)] fn as_f32_slice_mut(_s: &mut [Self]) -> Option<&mut [f32]> { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_views_are_identity() {
        let mut v = vec![1.0f32, 2.0, 3.0];
        assert_eq!(f32::as_f32_slice(&v).map(|s| s.len()), Some(3));
        f32::as_f32_slice_mut(&mut v).unwrap()[1] = 5.0;
        assert_eq!(v[1], 5.0);
    }

    #[test]
    fn test_bf16_has_no_f32_view() {
        let v = vec![bf16::ONE; 4];
        assert!(bf16::as_f32_slice(&v).is_none());
        assert_eq!(<bf16 as Element>::ELEM, ElementType::Bf16);
    }

    #[test]
    fn test_bf16_rounding_is_nearest_even() {
        // 1 + 2^-8 sits exactly between two bf16 values; ties go to even (1.0).
        let tie = f32::from_bits(0x3F80_8000);
        assert_eq!(tie.to_bf16().to_bits(), 0x3F80);
        // Slightly above the tie rounds up.
        let above = f32::from_bits(0x3F80_8001);
        assert_eq!(above.to_bf16().to_bits(), 0x3F81);
        // Odd mantissa tie rounds up to even.
        let odd_tie = f32::from_bits(0x3F81_8000);
        assert_eq!(odd_tie.to_bf16().to_bits(), 0x3F82);
    }
}
