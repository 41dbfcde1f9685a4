//! Extents and the image/object address-space mapping.

use std::fmt;

/// A byte range `[offset, offset + length)` within some address space (object-local
/// or image-global, depending on context). Vectors of extents are kept disjoint and
/// in ascending offset order by every producer in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    /// # Panics
    ///
    /// Panics if `length == 0`; a zero-length extent is meaningless and every
    /// producer in this crate is expected to prune rather than emit one.
    pub fn new(offset: u64, length: u64) -> Self {
        assert!(length > 0, "extent length must be positive");
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Total bytes covered by a vector of (assumed disjoint) extents.
    pub fn total_len(extents: &[Extent]) -> u64 {
        extents.iter().map(|e| e.length).sum()
    }

    /// Intersects `self` with `[0, limit)`, returning `None` if nothing remains.
    fn clamp_to(&self, limit: u64) -> Option<Extent> {
        if self.offset >= limit {
            return None;
        }
        let end = self.end().min(limit);
        Some(Extent::new(self.offset, end - self.offset))
    }
}

/// The fixed striping layout that splits an image's logical address space across
/// backing objects. Out of scope per spec.md §1 (treated as an external
/// collaborator); this is the minimal surface the request engine consumes.
#[derive(Debug, Clone, Copy)]
pub struct StripeLayout {
    pub object_size: u64,
    pub stripe_unit: u64,
    pub stripe_count: u64,
}

impl StripeLayout {
    /// A layout with no striping: one object per `object_size` chunk, addressed
    /// linearly. Useful for tests and for images that do not fan out across
    /// multiple objects per stripe period.
    pub fn unstriped(object_size: u64) -> Self {
        Self { object_size, stripe_unit: object_size, stripe_count: 1 }
    }
}

/// Converts (object number, intra-object offset, length) to the image-space
/// extents it occupies. This is the consumed interface named in spec.md §6; the
/// striping math itself is out of scope, so the reference implementation here only
/// supports the common `stripe_count == 1` (linear) case precisely and falls back
/// to a best-effort approximation otherwise, which is sufficient for this crate's
/// own needs (computing the full-object address range to prune against parent
/// overlap).
pub trait ExtentMapper: Send + Sync {
    fn object_to_image_extents(&self, object_no: u64, intra_off: u64, intra_len: u64) -> Vec<Extent>;
}

#[derive(Debug, Clone, Copy)]
pub struct LinearExtentMapper {
    pub layout: StripeLayout,
}

impl ExtentMapper for LinearExtentMapper {
    fn object_to_image_extents(&self, object_no: u64, intra_off: u64, intra_len: u64) -> Vec<Extent> {
        if intra_len == 0 {
            return Vec::new();
        }
        let base = object_no * self.layout.object_size;
        vec![Extent::new(base + intra_off, intra_len)]
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// Prunes `extents` down to the portion that lies within `[0, overlap)`, in place,
/// and returns the number of bytes remaining. Used to restrict a request's
/// candidate parent extents to the live parent-overlap prefix for its snapshot id
/// (spec.md §6: `prune_parent_extents`).
pub fn prune_parent_extents(extents: &mut Vec<Extent>, overlap: u64) -> u64 {
    if overlap == 0 {
        extents.clear();
        return 0;
    }
    let mut remaining = 0u64;
    extents.retain_mut(|e| match e.clamp_to(overlap) {
        Some(clamped) => {
            remaining += clamped.length;
            *e = clamped;
            true
        }
        None => false,
    });
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_mapper_offsets_by_object_number() {
        let mapper = LinearExtentMapper { layout: StripeLayout::unstriped(4096) };
        let extents = mapper.object_to_image_extents(3, 100, 200);
        assert_eq!(extents, vec![Extent::new(3 * 4096 + 100, 200)]);
    }

    #[test]
    fn prune_clips_to_overlap() {
        let mut extents = vec![Extent::new(0, 4096)];
        let remaining = prune_parent_extents(&mut extents, 2048);
        assert_eq!(remaining, 2048);
        assert_eq!(extents, vec![Extent::new(0, 2048)]);
    }

    #[test]
    fn prune_drops_extents_entirely_past_overlap() {
        let mut extents = vec![Extent::new(4096, 4096)];
        let remaining = prune_parent_extents(&mut extents, 2048);
        assert_eq!(remaining, 0);
        assert!(extents.is_empty());
    }

    #[test]
    fn prune_zero_overlap_clears_everything() {
        let mut extents = vec![Extent::new(0, 4096)];
        assert_eq!(prune_parent_extents(&mut extents, 0), 0);
        assert!(extents.is_empty());
    }
}
