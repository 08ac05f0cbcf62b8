// src/reconcile/merge.rs
//
// Inter-rater merge: one binary union mask per canonical lesion. Distinct
// raters' masks are expected to overlap here — that overlap is what
// grouped them — so this is a union, not the disjoint sum the mask store
// applies within a rater.

use std::collections::BTreeMap;

use super::MaskKey;
use crate::volume::MaskVolume;

/// One physical lesion with all raters' annotations merged.
#[derive(Debug)]
pub struct CanonicalNodule {
    /// Minimum raw id across the members.
    pub canonical_id: u64,
    /// The minimum-id member; its session and raw id tag the output file.
    pub representative: MaskKey,
    pub members: Vec<MaskKey>,
    pub mask: MaskVolume,
}

/// Builds the union mask of every canonical group. Geometry agreement
/// across members was asserted during resolution; the merged mask takes
/// its grid from the first member.
pub fn merge_canonical(
    masks: &BTreeMap<MaskKey, MaskVolume>,
    canonical_ids: &BTreeMap<MaskKey, u64>,
) -> Vec<CanonicalNodule> {
    let mut groups: BTreeMap<u64, Vec<MaskKey>> = BTreeMap::new();
    for (key, canonical_id) in canonical_ids {
        groups.entry(*canonical_id).or_default().push(*key);
    }

    let mut nodules = Vec::new();
    for (canonical_id, members) in groups {
        let Some(representative) = members.iter().copied().min_by_key(|k| k.raw_id) else {
            continue;
        };
        let mut mask = MaskVolume::zeros(masks[&members[0]].geometry.clone());
        for member in &members {
            mask.union_with(&masks[member]);
        }
        nodules.push(CanonicalNodule {
            canonical_id,
            representative,
            members,
            mask,
        });
    }
    nodules
}
