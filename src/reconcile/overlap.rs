// src/reconcile/overlap.rs
//
// The sole signal for "same lesion across raters": how many voxels two
// masks both set.

use crate::volume::MaskVolume;

/// Two rater nodules describe the same lesion when more than this many
/// voxels are covered by both segmentations.
pub const OVERLAP_VOXEL_THRESHOLD: usize = 10;

/// Count of voxels nonzero in both masks. The caller guarantees the grids
/// match; no resampling happens here.
pub fn overlap_voxels(a: &MaskVolume, b: &MaskVolume) -> usize {
    debug_assert!(a.geometry.matches(&b.geometry));
    a.data
        .iter()
        .zip(b.data.iter())
        .filter(|(x, y)| **x > 0 && **y > 0)
        .count()
}

/// The overlap predicate. Symmetric; transitivity is imposed by the
/// resolver via connected components, not assumed here.
pub fn same_lesion(a: &MaskVolume, b: &MaskVolume) -> bool {
    overlap_voxels(a, b) > OVERLAP_VOXEL_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn test_overlap_is_symmetric() {
        let geometry = testutil::unit_geometry([40, 2, 1]);
        let a = testutil::block_mask(geometry.clone(), 0..20, 0..2, 0..1);
        let b = testutil::block_mask(geometry.clone(), 10..30, 0..1, 0..1);

        assert_eq!(overlap_voxels(&a, &b), 10);
        assert_eq!(overlap_voxels(&b, &a), 10);
        assert_eq!(same_lesion(&a, &b), same_lesion(&b, &a));
    }

    #[test]
    fn test_threshold_is_strictly_greater_than() {
        let geometry = testutil::unit_geometry([40, 1, 1]);
        let a = testutil::block_mask(geometry.clone(), 0..20, 0..1, 0..1);

        // Exactly 10 shared voxels is not enough.
        let ten = testutil::block_mask(geometry.clone(), 10..30, 0..1, 0..1);
        assert_eq!(overlap_voxels(&a, &ten), 10);
        assert!(!same_lesion(&a, &ten));

        // Eleven is.
        let eleven = testutil::block_mask(geometry.clone(), 9..30, 0..1, 0..1);
        assert_eq!(overlap_voxels(&a, &eleven), 11);
        assert!(same_lesion(&a, &eleven));
    }

    #[test]
    fn test_mask_overlaps_itself_when_large_enough() {
        let geometry = testutil::unit_geometry([40, 1, 1]);
        let large = testutil::block_mask(geometry.clone(), 0..11, 0..1, 0..1);
        assert!(same_lesion(&large, &large));

        let small = testutil::block_mask(geometry.clone(), 0..10, 0..1, 0..1);
        assert!(!same_lesion(&small, &small));
    }
}
