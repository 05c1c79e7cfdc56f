//! Scratch arena for intermediate row buffers.
//!
//! A [`BufferLayout`] is computed once per engine: every region starts on a
//! 64-byte boundary and consecutive regions are separated by
//! [`ALIAS_GAP`] bytes so equally strided buffers do not map onto the same
//! cache sets. [`BufferManager`] then carves typed views out of either a
//! caller buffer or an internally owned one.

use bytemuck::Pod;

use crate::error::{ConvError, ConvResult};
use crate::tiling::align_hi;

pub const REGION_ALIGN: usize = 64;
pub const ALIAS_GAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub offset: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferLayout {
    regions: Vec<Region>,
    total: usize,
}

impl BufferLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region and return its index.
    pub fn push(&mut self, name: &'static str, bytes: usize) -> usize {
        let start = if self.regions.is_empty() { 0 } else { self.total + ALIAS_GAP };
        let offset = align_hi(start, REGION_ALIGN);
        self.regions.push(Region { name, offset, bytes });
        self.total = offset + bytes;
        self.regions.len() - 1
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Bytes from the first region start to the last region end.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes a caller buffer must provide, including slack to align an
    /// arbitrary start address.
    pub fn external_size(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            self.total + REGION_ALIGN
        }
    }
}

/// Owns the layout and, lazily, an internal buffer reused across calls.
#[derive(Debug, Default)]
pub struct BufferManager {
    layout: BufferLayout,
    internal: Vec<u8>,
}

impl BufferManager {
    pub fn new(layout: BufferLayout) -> Self {
        Self { layout, internal: Vec::new() }
    }

    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    pub fn external_size(&self) -> usize {
        self.layout.external_size()
    }

    /// Bytes currently owned by the internal buffer.
    pub fn internal_size(&self) -> usize {
        self.internal.len()
    }

    /// Split `external` (or the internal buffer when `None`) into the
    /// layout's regions.
    pub fn arena<'a>(&'a mut self, external: Option<&'a mut [u8]>) -> ConvResult<Arena<'a>> {
        let required = self.layout.external_size();
        let buf: &'a mut [u8] = match external {
            Some(buf) => {
                if buf.len() < required {
                    return Err(ConvError::InsufficientScratch { required, provided: buf.len() });
                }
                buf
            }
            None => {
                if self.internal.len() < required {
                    log::debug!("allocating {required} B internal scratch");
                    self.internal.resize(required, 0);
                }
                &mut self.internal
            }
        };
        Arena::carve(&self.layout, buf)
    }
}

/// Disjoint byte views, one per region, each taken at most once.
#[derive(Debug)]
pub struct Arena<'a> {
    views: Vec<&'a mut [u8]>,
}

impl<'a> Arena<'a> {
    fn carve(layout: &BufferLayout, buf: &'a mut [u8]) -> ConvResult<Self> {
        let provided = buf.len();
        let skip = buf.as_ptr().align_offset(REGION_ALIGN);
        if layout.total() == 0 {
            return Ok(Self { views: layout.regions().iter().map(|_| <&mut [u8]>::default()).collect() });
        }
        let Some(mut rest) = buf.get_mut(skip..skip + layout.total()) else {
            return Err(ConvError::InsufficientScratch { required: layout.external_size(), provided });
        };
        let mut cursor = 0;
        let mut views = Vec::with_capacity(layout.regions().len());
        for region in layout.regions() {
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(region.offset - cursor);
            let (view, tail) = tail.split_at_mut(region.bytes);
            views.push(view);
            rest = tail;
            cursor = region.offset + region.bytes;
        }
        Ok(Self { views })
    }

    /// Typed view of region `index`. A second take of the same region
    /// yields an empty slice.
    pub fn take<T: Pod>(&mut self, index: usize) -> ConvResult<&'a mut [T]> {
        let bytes = self.views.get_mut(index).map(std::mem::take).unwrap_or_default();
        // An empty view may carry a dangling pointer with byte alignment.
        if bytes.is_empty() {
            return Ok(&mut []);
        }
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| ConvError::ScratchLayout(format!("region {index}: {e:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_layout_offsets_are_aligned_and_gapped() {
        let mut l = BufferLayout::new();
        assert_eq!(l.push("a", 100), 0);
        assert_eq!(l.push("b", 64), 1);
        assert_eq!(l.push("c", 8), 2);
        let r = l.regions();
        assert_eq!(r[0].offset, 0);
        assert_eq!(r[1].offset, align_hi(100 + ALIAS_GAP, REGION_ALIGN));
        assert!(r[2].offset >= r[1].offset + 64 + ALIAS_GAP);
        for region in r {
            assert_eq!(region.offset % REGION_ALIGN, 0);
        }
        assert_eq!(l.total(), r[2].offset + 8);
        assert_eq!(l.external_size(), l.total() + REGION_ALIGN);
        assert_eq!(BufferLayout::new().external_size(), 0);
    }

    #[test]
    fn test_arena_views_are_typed_and_disjoint() {
        let mut l = BufferLayout::new();
        let a = l.push("f32", 16 * 4);
        let b = l.push("bf16", 8 * 2);
        let mut mgr = BufferManager::new(l);
        let mut arena = mgr.arena(None).unwrap();
        let fa: &mut [f32] = arena.take(a).unwrap();
        let hb: &mut [bf16] = arena.take(b).unwrap();
        assert_eq!(fa.len(), 16);
        assert_eq!(hb.len(), 8);
        fa.fill(1.0);
        hb.fill(bf16::ONE);
        let again: &mut [f32] = arena.take(a).unwrap();
        assert!(again.is_empty());
        assert_eq!(mgr.internal_size(), mgr.external_size());
    }

    #[test]
    fn test_empty_regions_take_as_empty_slices() {
        let mut l = BufferLayout::new();
        let z = l.push("empty", 0);
        assert_eq!(l.total(), 0);
        let mut mgr = BufferManager::new(l);
        let mut arena = mgr.arena(None).unwrap();
        let v: &mut [f32] = arena.take(z).unwrap();
        assert!(v.is_empty());
        let missing: &mut [bf16] = arena.take(7).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_external_buffer_checked() {
        let mut l = BufferLayout::new();
        l.push("x", 128);
        let mut mgr = BufferManager::new(l);
        let need = mgr.external_size();
        let mut small = vec![0u8; need - 1];
        assert_eq!(
            mgr.arena(Some(&mut small[..])).unwrap_err(),
            ConvError::InsufficientScratch { required: need, provided: need - 1 }
        );
        // Misaligned start still fits thanks to the slack.
        let mut big = vec![0u8; need + 1];
        let mut arena = mgr.arena(Some(&mut big[1..])).unwrap();
        let v: &mut [f32] = arena.take(0).unwrap();
        assert_eq!(v.len(), 32);
        assert_eq!(mgr.internal_size(), 0);
    }
}
