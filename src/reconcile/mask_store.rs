// src/reconcile/mask_store.rs
//
// Loads every per-ROI mask of one patient and merges them per rater
// nodule. ROIs of one nodule are slice contours and must be
// voxel-disjoint; a summed value above 1 means the source annotation was
// corrupt and the whole nodule mask is dropped.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::MaskKey;
use crate::error::{ErrorLog, ReconcileError};
use crate::volume::{self, MaskVolume};

pub struct LoadedMasks {
    /// One summed, validated mask per (session, raw id).
    pub masks: BTreeMap<MaskKey, MaskVolume>,
    /// ROI files read.
    pub roi_count: usize,
    /// Groups dropped because their ROIs overlapped.
    pub rejected: usize,
}

/// Directory the rasterizer fills with per-ROI masks for one patient.
pub fn roi_mask_dir(volumes_dir: &Path, patient: &str) -> PathBuf {
    volumes_dir.join(patient).join("planar_masks")
}

/// Reads all per-ROI masks and produces one summed mask per rater nodule.
pub fn load(
    volumes_dir: &Path,
    patient: &str,
    errors: &ErrorLog,
) -> Result<LoadedMasks, ReconcileError> {
    let dir = roi_mask_dir(volumes_dir, patient);
    let mut paths: Vec<PathBuf> = match std::fs::read_dir(&dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("nrrd"))
            .collect(),
        Err(_) => {
            warn!("no ROI masks under {}", dir.display());
            return Ok(LoadedMasks {
                masks: BTreeMap::new(),
                roi_count: 0,
                rejected: 0,
            });
        }
    };
    paths.sort();

    let mut sums: BTreeMap<MaskKey, MaskVolume> = BTreeMap::new();
    let mut roi_count = 0;
    for path in paths {
        let Some(key) = parse_mask_key(&path) else {
            errors.report(ReconcileError::BadMaskName { path });
            continue;
        };
        let mask = match volume::read_nrrd(&path) {
            Ok(mask) => mask,
            Err(e) => {
                errors.report(format!("unreadable ROI mask {}: {}", path.display(), e));
                continue;
            }
        };

        roi_count += 1;
        match sums.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(mask);
            }
            Entry::Occupied(mut slot) => {
                let sum = slot.get_mut();
                if !sum.geometry.matches(&mask.geometry) {
                    return Err(ReconcileError::GeometryMismatch {
                        patient: patient.to_string(),
                        detail: format!(
                            "ROI masks of nodule {} disagree on the voxel grid",
                            key
                        ),
                    });
                }
                sum.accumulate(&mask);
            }
        }
    }

    // Validation pass: any voxel above 1 means two ROIs of the same nodule
    // claimed the same voxel.
    let mut masks = BTreeMap::new();
    let mut rejected = 0;
    for (key, sum) in sums {
        if sum.max_value() > 1 {
            errors.report(ReconcileError::OverlappingRoi {
                patient: patient.to_string(),
                session: key.session,
                raw_id: key.raw_id,
            });
            rejected += 1;
            continue;
        }
        masks.insert(key, sum);
    }

    Ok(LoadedMasks {
        masks,
        roi_count,
        rejected,
    })
}

/// Mask names are `<patient>_<session>_<raw id>_<roi>.nrrd`; the grouping
/// key is everything except the ROI index.
fn parse_mask_key(path: &Path) -> Option<MaskKey> {
    let stem = path.file_stem()?.to_str()?;
    let fields: Vec<&str> = stem.split('_').collect();
    if fields.len() < 4 {
        return None;
    }
    let session = fields[1].parse().ok()?;
    let raw_id = fields[2].parse().ok()?;
    Some(MaskKey { session, raw_id })
}
