// src/reconcile/writer.rs
//
// Persists one NIfTI file per canonical lesion. A failed write is reported
// and the remaining lesions are still attempted.

use std::path::{Path, PathBuf};

use tracing::info;

use super::merge::CanonicalNodule;
use crate::error::{ErrorLog, ReconcileError};
use crate::volume;

/// Output path:
/// `<volumes>/<patient>/<patient>_<session>_<raw id>_<canonical id>.nii.gz`,
/// with session and raw id of the minimum-id member and the canonical id
/// zero-padded to 8 digits.
pub fn canonical_mask_path(
    volumes_dir: &Path,
    patient: &str,
    nodule: &CanonicalNodule,
) -> PathBuf {
    volumes_dir.join(patient).join(format!(
        "{}_{}_{}_{:08}.nii.gz",
        patient, nodule.representative.session, nodule.representative.raw_id, nodule.canonical_id
    ))
}

/// Writes every canonical mask; returns (written, failed).
pub fn emit(
    volumes_dir: &Path,
    patient: &str,
    nodules: &[CanonicalNodule],
    errors: &ErrorLog,
) -> (usize, usize) {
    if let Err(e) = std::fs::create_dir_all(volumes_dir.join(patient)) {
        errors.report(format!(
            "cannot create output directory for patient {}: {}",
            patient, e
        ));
        return (0, nodules.len());
    }

    let mut written = 0;
    let mut failed = 0;
    for nodule in nodules {
        let path = canonical_mask_path(volumes_dir, patient, nodule);
        match volume::write_nifti_gz(&nodule.mask, &path) {
            Ok(()) => {
                info!(
                    "  wrote {} ({} voxels from {} annotation(s))",
                    path.display(),
                    nodule.mask.count_nonzero(),
                    nodule.members.len()
                );
                written += 1;
            }
            Err(source) => {
                errors.report(ReconcileError::WriteFailure { path, source });
                failed += 1;
            }
        }
    }
    (written, failed)
}
