// src/error.rs
//
// Fault taxonomy for the conversion run plus the append-only error log.
// Faults are recovered at the smallest unit that leaves the rest of the
// batch independent: a ROI group, a single output file, a patient.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::error;

/// Faults raised while reconciling one patient's masks.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// ROI masks of one rater nodule are not voxel-disjoint.
    #[error("overlapping ROI segmentations for {patient}_{session}_{raw_id}: summed mask has voxels > 1")]
    OverlappingRoi {
        patient: String,
        session: u32,
        raw_id: u64,
    },

    /// Masks under comparison do not share a voxel grid.
    #[error("voxel grid mismatch for patient {patient}: {detail}")]
    GeometryMismatch { patient: String, detail: String },

    /// A canonical mask could not be persisted.
    #[error("failed to write canonical mask {}", .path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: crate::volume::VolumeError,
    },

    /// A mask file name does not carry the patient_session_nodule_roi fields.
    #[error("unparseable mask file name: {}", .path.display())]
    BadMaskName { path: PathBuf },
}

/// Process-wide append-only error log. One line per fault; every line also
/// goes to the tracing output.
pub struct ErrorLog {
    file: Mutex<File>,
}

impl ErrorLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open error log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one fault line. The log must never take the batch down, so a
    /// failed append degrades to a tracing message.
    pub fn report(&self, fault: impl Display) {
        error!("{}", fault);
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", fault) {
            error!("could not append to error log: {}", e);
        }
    }
}
