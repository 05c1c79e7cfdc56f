//! ISA detection and the micro-tile geometry derived from it.

use std::sync::OnceLock;

use crate::cache_params::CacheTopology;
use crate::error::{ConvError, ConvResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsaLevel {
    Scalar,
    Avx2,
    Avx512,
    Neon,
}

impl IsaLevel {
    /// Native f32 lanes per vector register.
    pub fn f32_lanes(self) -> usize {
        match self {
            IsaLevel::Avx512 => 16,
            IsaLevel::Avx2 => 8,
            IsaLevel::Neon => 4,
            IsaLevel::Scalar => 1,
        }
    }
}

static ISA_LEVEL: OnceLock<IsaLevel> = OnceLock::new();

pub fn get_isa_level() -> IsaLevel {
    *ISA_LEVEL.get_or_init(detect_isa_features)
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn detect_isa_features() -> IsaLevel {
    if is_x86_feature_detected!("avx512f") && is_x86_feature_detected!("avx512bw") {
        IsaLevel::Avx512
    } else if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        IsaLevel::Avx2
    } else {
        IsaLevel::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_isa_features() -> IsaLevel {
    IsaLevel::Neon
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_isa_features() -> IsaLevel {
    IsaLevel::Scalar
}

/// Channel packing granularity.
///
/// `mi_c` is the micro-channel count (one register of f32 lanes), `mi_k` the
/// reduction pairing of the 16-bit weight layout and is always even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroTile {
    pub mi_c: usize,
    pub mi_k: usize,
}

impl MicroTile {
    pub fn new(mi_c: usize, mi_k: usize) -> ConvResult<Self> {
        if mi_c == 0 {
            return Err(ConvError::InvalidParams("mi_c must be > 0".into()));
        }
        if mi_k == 0 || mi_k % 2 != 0 {
            return Err(ConvError::InvalidParams(format!("mi_k {mi_k} must be a positive even number")));
        }
        Ok(Self { mi_c, mi_k })
    }

    /// Wider tiles for wider native lanes; narrow ISAs still pack 8 channels.
    pub fn for_isa(isa: IsaLevel) -> Self {
        let mi_c = isa.f32_lanes().max(8);
        Self { mi_c, mi_k: 2 }
    }

    pub fn detect() -> Self {
        Self::for_isa(get_isa_level())
    }

    /// Destination-channel width of one dense weight panel.
    #[inline]
    pub fn panel(&self) -> usize {
        self.mi_c * 2
    }
}

impl Default for MicroTile {
    fn default() -> Self {
        Self::detect()
    }
}

/// Everything an engine needs from the host, resolved once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineConfig {
    pub cache: CacheTopology,
    pub micro: MicroTile,
}

impl EngineConfig {
    pub fn new(cache: CacheTopology, micro: MicroTile) -> Self {
        Self { cache, micro }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isa_singleton_consistency() {
        assert_eq!(get_isa_level(), get_isa_level());
    }

    #[test]
    fn test_micro_tile_for_isa() {
        assert_eq!(MicroTile::for_isa(IsaLevel::Avx512), MicroTile { mi_c: 16, mi_k: 2 });
        assert_eq!(MicroTile::for_isa(IsaLevel::Avx2), MicroTile { mi_c: 8, mi_k: 2 });
        assert_eq!(MicroTile::for_isa(IsaLevel::Neon).mi_c, 8);
        assert_eq!(MicroTile::for_isa(IsaLevel::Scalar).panel(), 16);
    }

    #[test]
    fn test_micro_tile_validation() {
        assert!(MicroTile::new(0, 2).is_err());
        assert!(MicroTile::new(8, 3).is_err());
        assert!(MicroTile::new(8, 0).is_err());
        assert_eq!(MicroTile::new(4, 4).unwrap().panel(), 8);
    }
}
