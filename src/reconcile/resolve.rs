// src/reconcile/resolve.rs
//
// Groups a patient's nodule masks into canonical lesions. The overlap
// predicate is pairwise and not transitive; connected components impose
// the transitive closure. The canonical id of a component is the numeric
// minimum of its members' raw ids.

use std::collections::BTreeMap;

use tracing::debug;

use super::overlap;
use super::MaskKey;
use crate::error::ReconcileError;
use crate::volume::MaskVolume;

/// Maps every mask key to the canonical id of its component.
///
/// Every unordered pair is tested — O(n²) voxel intersections — which is
/// fine at the few dozen annotations a patient carries. Keys come out of a
/// BTreeMap, so iteration order (and with it the result) does not depend
/// on how the map was built.
pub fn resolve(
    patient: &str,
    masks: &BTreeMap<MaskKey, MaskVolume>,
) -> Result<BTreeMap<MaskKey, u64>, ReconcileError> {
    let keys: Vec<MaskKey> = masks.keys().copied().collect();
    check_geometry(patient, &keys, masks)?;

    let mut components = UnionFind::new(keys.len());
    for i in 0..keys.len() {
        for j in (i + 1)..keys.len() {
            if overlap::same_lesion(&masks[&keys[i]], &masks[&keys[j]]) {
                components.union(i, j);
            }
        }
    }

    // Numeric minimum raw id per component root.
    let mut minimum: BTreeMap<usize, u64> = BTreeMap::new();
    for (idx, key) in keys.iter().enumerate() {
        let root = components.find(idx);
        let entry = minimum.entry(root).or_insert(key.raw_id);
        *entry = (*entry).min(key.raw_id);
    }

    let mut canonical = BTreeMap::new();
    for (idx, key) in keys.iter().enumerate() {
        let id = minimum[&components.find(idx)];
        debug!("mask {} -> canonical {}", key, id);
        canonical.insert(*key, id);
    }
    Ok(canonical)
}

/// All masks entering the pairwise comparison must share one voxel grid.
fn check_geometry(
    patient: &str,
    keys: &[MaskKey],
    masks: &BTreeMap<MaskKey, MaskVolume>,
) -> Result<(), ReconcileError> {
    let Some(first) = keys.first() else {
        return Ok(());
    };
    let reference = &masks[first].geometry;
    for key in &keys[1..] {
        let geometry = &masks[key].geometry;
        if !reference.matches(geometry) {
            return Err(ReconcileError::GeometryMismatch {
                patient: patient.to_string(),
                detail: format!(
                    "mask {} is on a different voxel grid than mask {} ({:?} vs {:?})",
                    key, first, geometry.dims, reference.dims
                ),
            });
        }
    }
    Ok(())
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            // Path halving.
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn key(session: u32, raw_id: u64) -> MaskKey {
        MaskKey { session, raw_id }
    }

    #[test]
    fn test_mutual_overlap_takes_minimum_raw_id() {
        let geometry = testutil::unit_geometry([40, 1, 1]);
        let block = testutil::block_mask(geometry.clone(), 0..15, 0..1, 0..1);

        let mut masks = BTreeMap::new();
        masks.insert(key(0, 7), block.clone());
        masks.insert(key(1, 3), block.clone());
        masks.insert(key(2, 11), block.clone());

        let canonical = resolve("0001a", &masks).unwrap();
        assert_eq!(canonical[&key(0, 7)], 3);
        assert_eq!(canonical[&key(1, 3)], 3);
        assert_eq!(canonical[&key(2, 11)], 3);
    }

    // A overlaps B and B overlaps C, but A and C never touch: connectivity
    // still puts all three in one component.
    #[test]
    fn test_transitive_chain_is_one_component() {
        let geometry = testutil::unit_geometry([64, 1, 1]);
        let a = testutil::block_mask(geometry.clone(), 0..16, 0..1, 0..1);
        let b = testutil::block_mask(geometry.clone(), 4..28, 0..1, 0..1);
        let c = testutil::block_mask(geometry.clone(), 16..40, 0..1, 0..1);

        assert!(overlap::same_lesion(&a, &b));
        assert!(overlap::same_lesion(&b, &c));
        assert!(!overlap::same_lesion(&a, &c));

        let mut masks = BTreeMap::new();
        masks.insert(key(0, 2), a);
        masks.insert(key(1, 5), b);
        masks.insert(key(2, 8), c);

        let canonical = resolve("0001a", &masks).unwrap();
        assert_eq!(canonical[&key(0, 2)], 2);
        assert_eq!(canonical[&key(1, 5)], 2);
        assert_eq!(canonical[&key(2, 8)], 2);
    }

    #[test]
    fn test_below_threshold_stays_singleton() {
        let geometry = testutil::unit_geometry([64, 1, 1]);
        // 10 shared voxels: not the same lesion.
        let a = testutil::block_mask(geometry.clone(), 0..20, 0..1, 0..1);
        let b = testutil::block_mask(geometry.clone(), 10..40, 0..1, 0..1);

        let mut masks = BTreeMap::new();
        masks.insert(key(0, 4), a);
        masks.insert(key(1, 6), b);

        let canonical = resolve("0001a", &masks).unwrap();
        assert_eq!(canonical[&key(0, 4)], 4);
        assert_eq!(canonical[&key(1, 6)], 6);
    }

    #[test]
    fn test_resolution_independent_of_insertion_order() {
        let geometry = testutil::unit_geometry([64, 1, 1]);
        let a = testutil::block_mask(geometry.clone(), 0..16, 0..1, 0..1);
        let b = testutil::block_mask(geometry.clone(), 4..28, 0..1, 0..1);
        let c = testutil::block_mask(geometry.clone(), 40..60, 0..1, 0..1);

        let mut forward = BTreeMap::new();
        forward.insert(key(0, 1), a.clone());
        forward.insert(key(1, 2), b.clone());
        forward.insert(key(2, 3), c.clone());

        let mut reverse = BTreeMap::new();
        reverse.insert(key(2, 3), c);
        reverse.insert(key(1, 2), b);
        reverse.insert(key(0, 1), a);

        assert_eq!(
            resolve("0001a", &forward).unwrap(),
            resolve("0001a", &reverse).unwrap()
        );
    }

    #[test]
    fn test_grid_mismatch_is_an_error() {
        let mut masks = BTreeMap::new();
        masks.insert(
            key(0, 1),
            testutil::block_mask(testutil::unit_geometry([32, 1, 1]), 0..16, 0..1, 0..1),
        );
        masks.insert(
            key(1, 2),
            testutil::block_mask(testutil::unit_geometry([32, 2, 1]), 0..16, 0..1, 0..1),
        );

        match resolve("0001a", &masks) {
            Err(ReconcileError::GeometryMismatch { patient, .. }) => assert_eq!(patient, "0001a"),
            other => panic!("expected GeometryMismatch, got {:?}", other),
        }
    }
}
