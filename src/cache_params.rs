//! Cache hierarchy used by the tiling planner.
//!
//! Detects L1D / L2 / L3 sizes via CPUID (x86) or sysfs (Linux/ARM) once per
//! process. Planners never read the globals directly: they take a
//! [`CacheTopology`] value so tests can inject synthetic sizes.

use std::sync::OnceLock;

/// Conservative fallback: 32 KB L1D, 512 KB L2, 8 MB L3.
const FALLBACK: (usize, usize, usize) = (32 * 1024, 512 * 1024, 8 * 1024 * 1024);

/// Cache capacities in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTopology {
    pub l1: usize,
    pub l2: usize,
    pub l3: usize,
}

impl CacheTopology {
    pub const fn new(l1: usize, l2: usize, l3: usize) -> Self {
        Self { l1, l2, l3 }
    }

    /// Sizes of the host, detected once and cached.
    pub fn detect() -> Self {
        let (l1, l2, l3) = *CACHE_SIZES.get_or_init(detect_cache_sizes);
        Self { l1, l2, l3 }
    }

    /// Detected sizes with `FUSEDCONV_L1` / `FUSEDCONV_L2` / `FUSEDCONV_L3`
    /// overrides applied (plain bytes or a `K`/`M` suffix).
    pub fn from_env() -> Self {
        let mut topo = Self::detect();
        let read = |name: &str| -> Option<usize> {
            let raw = std::env::var(name).ok()?;
            match parse_size(&raw) {
                Some(v) if v > 0 => Some(v),
                _ => {
                    log::warn!("ignoring unparsable {name}={raw:?}");
                    None
                }
            }
        };
        if let Some(v) = read("FUSEDCONV_L1") {
            topo.l1 = v;
        }
        if let Some(v) = read("FUSEDCONV_L2") {
            topo.l2 = v;
        }
        if let Some(v) = read("FUSEDCONV_L3") {
            topo.l3 = v;
        }
        topo
    }
}

impl Default for CacheTopology {
    fn default() -> Self {
        Self::from_env()
    }
}

impl std::fmt::Display for CacheTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L1D={}K L2={}K L3={}K", self.l1 / 1024, self.l2 / 1024, self.l3 / 1024)
    }
}

static CACHE_SIZES: OnceLock<(usize, usize, usize)> = OnceLock::new();

/// Parse `"48K"`, `"2M"`, `"1048576"`.
pub(crate) fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(kb) = s.strip_suffix('K') {
        kb.trim().parse::<usize>().ok().map(|v| v * 1024)
    } else if let Some(mb) = s.strip_suffix('M') {
        mb.trim().parse::<usize>().ok().map(|v| v * 1024 * 1024)
    } else {
        s.parse::<usize>().ok()
    }
}

// ── Cache size detection ─────────────────────────────────────────────

fn detect_cache_sizes() -> (usize, usize, usize) {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(sizes) = detect_x86_cache() {
            log::debug!("cache sizes from CPUID: {sizes:?}");
            return sizes;
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(sizes) = detect_sysfs_cache() {
            log::debug!("cache sizes from sysfs: {sizes:?}");
            return sizes;
        }
    }
    log::debug!("cache detection failed, using fallback {FALLBACK:?}");
    FALLBACK
}

#[cfg(target_arch = "x86_64")]
fn detect_x86_cache() -> Option<(usize, usize, usize)> {
    // CPUID leaf 4: deterministic cache parameters (Intel & AMD Zen+)
    let mut l1d: Option<usize> = None;
    let mut l2: Option<usize> = None;
    let mut l3: Option<usize> = None;

    for sub in 0..16u32 {
        // SAFETY: CPUID is available on every x86_64 CPU.
        #[allow(unused_unsafe)]
        let info = unsafe { std::arch::x86_64::__cpuid_count(4, sub) };
        let cache_type = info.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        let level = (info.eax >> 5) & 0x7;
        let line_size = (info.ebx & 0xFFF) + 1;
        let partitions = ((info.ebx >> 12) & 0x3FF) + 1;
        let ways = ((info.ebx >> 22) & 0x3FF) + 1;
        let sets = info.ecx + 1;
        let size = line_size as usize * partitions as usize * ways as usize * sets as usize;

        match (level, cache_type) {
            (1, 1) => l1d = Some(size),
            (2, 3) | (2, 2) => l2 = Some(size),
            (3, 3) | (3, 2) => l3 = Some(size),
            _ => {}
        }
    }

    match (l1d, l2) {
        (Some(d), Some(u)) => Some((d, u, l3.unwrap_or(FALLBACK.2))),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn detect_sysfs_cache() -> Option<(usize, usize, usize)> {
    let mut l1d: Option<usize> = None;
    let mut l2: Option<usize> = None;
    let mut l3: Option<usize> = None;

    for idx in 0..8 {
        let base = format!("/sys/devices/system/cpu/cpu0/cache/index{idx}");
        let read = |leaf: &str| std::fs::read_to_string(format!("{base}/{leaf}")).ok();
        let (Some(level), Some(ctype), Some(size)) = (read("level"), read("type"), read("size"))
        else {
            continue;
        };
        let size = parse_size(&size)?;
        let level: u32 = level.trim().parse().ok()?;

        match (level, ctype.trim()) {
            (1, "Data") => l1d = Some(size),
            (2, "Unified") => l2 = Some(size),
            (3, "Unified") => l3 = Some(size),
            _ => {}
        }
    }

    match (l1d, l2) {
        (Some(d), Some(u)) => Some((d, u, l3.unwrap_or(FALLBACK.2))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_detection() {
        let c = CacheTopology::detect();
        // Sanity: L1D 4KB-1MB, L2 >= L1D, L3 >= 256KB
        assert!(c.l1 >= 4 * 1024, "L1D too small: {}", c.l1);
        assert!(c.l1 <= 1024 * 1024, "L1D too large: {}", c.l1);
        assert!(c.l2 >= c.l1, "L2 {} smaller than L1D {}", c.l2, c.l1);
        assert!(c.l3 >= 256 * 1024, "L3 too small: {}", c.l3);
        eprintln!("Detected: {c}");
    }

    #[test]
    fn test_detect_is_cached() {
        assert_eq!(CacheTopology::detect(), CacheTopology::detect());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("48K"), Some(48 * 1024));
        assert_eq!(parse_size(" 2M\n"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_injected_topology() {
        let c = CacheTopology::new(1024, 4096, 65536);
        assert_eq!((c.l1, c.l2, c.l3), (1024, 4096, 65536));
        assert_eq!(c.to_string(), "L1D=1K L2=4K L3=64K");
    }
}
