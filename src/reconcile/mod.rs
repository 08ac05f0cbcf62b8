// src/reconcile/mod.rs
//
// Identity resolution across raters. Raters share no common id for "the
// same nodule", so after rasterization this module decides, from voxel
// overlap alone, which per-rater masks describe one physical lesion:
// load per-ROI masks, sum them per rater nodule, group nodules across
// raters by overlap, and write one canonical mask per lesion.

pub mod mask_store;
pub mod merge;
pub mod overlap;
pub mod resolve;
pub mod writer;

use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::error::ErrorLog;

/// Identity of one rater's nodule annotation within a patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaskKey {
    /// Reading-session index, unique per patient only.
    pub session: u32,
    /// Dataset-run-unique raw nodule id.
    pub raw_id: u64,
}

impl std::fmt::Display for MaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.session, self.raw_id)
    }
}

#[derive(Debug, Default)]
pub struct ReconcileStats {
    pub roi_masks: usize,
    pub nodule_masks: usize,
    pub groups_rejected: usize,
    pub canonical_nodules: usize,
    pub masks_written: usize,
    pub write_failures: usize,
}

/// Full reconciliation pass for one patient. Recoverable faults (corrupt
/// ROI groups, failed writes) are reported through `errors` and skipped; a
/// voxel-grid mismatch aborts the patient with Err and leaves other
/// patients unaffected.
pub fn reconcile_patient(
    volumes_dir: &Path,
    patient: &str,
    errors: &ErrorLog,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();

    let loaded = mask_store::load(volumes_dir, patient, errors)?;
    stats.roi_masks = loaded.roi_count;
    stats.groups_rejected = loaded.rejected;
    stats.nodule_masks = loaded.masks.len();
    if loaded.masks.is_empty() {
        info!("no nodule masks to reconcile for patient {}", patient);
        return Ok(stats);
    }

    let canonical_ids = resolve::resolve(patient, &loaded.masks)?;
    let canonical = merge::merge_canonical(&loaded.masks, &canonical_ids);
    stats.canonical_nodules = canonical.len();
    info!(
        "patient {}: {} rater nodule(s) resolved into {} canonical nodule(s)",
        patient,
        loaded.masks.len(),
        canonical.len()
    );

    let (written, failed) = writer::emit(volumes_dir, patient, &canonical, errors);
    stats.masks_written = written;
    stats.write_failures = failed;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::volume::MaskVolume;

    fn write_roi(dir: &Path, patient: &str, stem: &str, mask: &MaskVolume) {
        let path = mask_store::roi_mask_dir(dir, patient).join(format!("{}.nrrd", stem));
        testutil::write_nrrd(mask, &path);
    }

    // Two raters annotate the same lesion: rater 0 as raw id 5, rater 1 as
    // raw id 9, with an 80-voxel overlap. One canonical mask comes out,
    // tagged with the minimum raw id, containing both voxel sets.
    #[test]
    fn test_two_raters_one_lesion_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = dir.path();
        let geometry = testutil::unit_geometry([200, 1, 1]);

        let rater0 = testutil::block_mask(geometry.clone(), 0..100, 0..1, 0..1);
        let rater1 = testutil::block_mask(geometry.clone(), 20..120, 0..1, 0..1);
        write_roi(volumes, "0010a", "0010a_0_5_0", &rater0);
        write_roi(volumes, "0010a", "0010a_1_9_0", &rater1);

        let errors = ErrorLog::open(&volumes.join("errors.txt")).unwrap();
        let stats = reconcile_patient(volumes, "0010a", &errors).unwrap();

        assert_eq!(stats.roi_masks, 2);
        assert_eq!(stats.nodule_masks, 2);
        assert_eq!(stats.groups_rejected, 0);
        assert_eq!(stats.canonical_nodules, 1);
        assert_eq!(stats.masks_written, 1);
        assert_eq!(stats.write_failures, 0);

        let outputs: Vec<String> = std::fs::read_dir(volumes.join("0010a"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".nii.gz"))
            .collect();
        assert_eq!(outputs, vec!["0010a_0_5_00000005.nii.gz".to_string()]);

        let (dims, data) = testutil::read_nifti_gz(
            &volumes.join("0010a").join("0010a_0_5_00000005.nii.gz"),
        );
        assert_eq!(dims, [200, 1, 1]);
        // Union of x 0..100 and x 20..120.
        let nonzero = data.iter().filter(|&&v| v > 0).count();
        assert_eq!(nonzero, 120);
        assert_eq!(data[0], 1);
        assert_eq!(data[119], 1);
        assert_eq!(data[120], 0);
        assert!(data.iter().all(|&v| v <= 1));
    }

    // A corrupt ROI group is dropped and reported while the rest of the
    // patient still reconciles.
    #[test]
    fn test_corrupt_group_skipped_rest_written() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = dir.path();
        let geometry = testutil::unit_geometry([64, 1, 1]);

        // Raw id 3: two ROIs sharing a voxel (corrupt).
        let roi_a = testutil::block_mask(geometry.clone(), 0..20, 0..1, 0..1);
        let roi_b = testutil::block_mask(geometry.clone(), 19..40, 0..1, 0..1);
        write_roi(volumes, "0002a", "0002a_0_3_0", &roi_a);
        write_roi(volumes, "0002a", "0002a_0_3_1", &roi_b);

        // Raw id 4: a clean single-ROI nodule.
        let clean = testutil::block_mask(geometry.clone(), 40..60, 0..1, 0..1);
        write_roi(volumes, "0002a", "0002a_1_4_0", &clean);

        let errors = ErrorLog::open(&volumes.join("errors.txt")).unwrap();
        let stats = reconcile_patient(volumes, "0002a", &errors).unwrap();

        assert_eq!(stats.groups_rejected, 1);
        assert_eq!(stats.nodule_masks, 1);
        assert_eq!(stats.masks_written, 1);

        assert!(volumes.join("0002a").join("0002a_1_4_00000004.nii.gz").exists());
        let log = std::fs::read_to_string(volumes.join("errors.txt")).unwrap();
        assert!(log.contains("overlapping ROI segmentations for 0002a_0_3"));
    }

    // Masks on different grids cannot be compared; the patient pass aborts.
    #[test]
    fn test_geometry_mismatch_aborts_patient() {
        let dir = tempfile::tempdir().unwrap();
        let volumes = dir.path();

        let a = testutil::block_mask(testutil::unit_geometry([32, 1, 1]), 0..16, 0..1, 0..1);
        let b = testutil::block_mask(testutil::unit_geometry([48, 1, 1]), 0..16, 0..1, 0..1);
        write_roi(volumes, "0003a", "0003a_0_1_0", &a);
        write_roi(volumes, "0003a", "0003a_1_2_0", &b);

        let errors = ErrorLog::open(&volumes.join("errors.txt")).unwrap();
        let result = reconcile_patient(volumes, "0003a", &errors);
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("voxel grid mismatch"));
    }
}
