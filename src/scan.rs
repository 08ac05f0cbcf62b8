// src/scan.rs
//
// Locates the DICOM series referenced by an annotation and derives the
// output patient id.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use walkdir::WalkDir;

/// A series needs at least this many slices to be a usable scan.
pub const MIN_DICOM_SLICES: usize = 10;

#[derive(Debug)]
pub struct DicomSeries {
    /// One slice of the series; the converter finds its siblings.
    pub first_slice: PathBuf,
    pub slice_count: usize,
}

/// Finds DICOM files whose directory chain mentions the study UID (and the
/// series UID when given). Expected layout:
/// `<root>/<patient>/<study>/<series>/*.dcm`.
pub fn find_dicom_series(
    root: &Path,
    study_uid: &str,
    series_uid: Option<&str>,
) -> Option<DicomSeries> {
    let mut first_slice: Option<PathBuf> = None;
    let mut slice_count = 0;

    for entry in WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_dicom = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("dcm"));
        if !is_dicom || !path_mentions(path, study_uid) {
            continue;
        }
        if let Some(series) = series_uid {
            if !path_mentions(path, series) {
                continue;
            }
        }
        slice_count += 1;
        if first_slice.is_none() {
            first_slice = Some(path.to_path_buf());
        }
    }

    first_slice.map(|first_slice| DicomSeries {
        first_slice,
        slice_count,
    })
}

fn path_mentions(path: &Path, uid: &str) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy().contains(uid))
}

/// Patient code from the slice path. Slices live three levels below the
/// patient folder (`<patient>/<study>/<series>/<file>`), and the folder
/// carries a dataset prefix.
pub fn patient_code(slice_path: &Path) -> Result<String> {
    let folder = slice_path
        .ancestors()
        .nth(3)
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .with_context(|| format!("cannot derive patient folder from {}", slice_path.display()))?;
    Ok(folder.trim_start_matches("LIDC-IDRI-").to_string())
}

/// Appends the first unused appendix letter, so repeated scans of the same
/// subject (e.g. multiple time points) get distinct output ids.
pub fn assign_patient_id(volumes_dir: &Path, code: &str) -> Result<String> {
    for letter in 'a'..='z' {
        let candidate = format!("{}{}", code, letter);
        if !volumes_dir.join(&candidate).exists() {
            return Ok(candidate);
        }
    }
    bail!("all appendix letters taken for patient code {}", code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_series_by_study_and_series_uid() {
        let dir = tempfile::tempdir().unwrap();
        let series_dir = dir
            .path()
            .join("LIDC-IDRI-0001")
            .join("1.2.840.study.777")
            .join("1.2.840.series.888");
        std::fs::create_dir_all(&series_dir).unwrap();
        for i in 0..12 {
            std::fs::write(series_dir.join(format!("{:06}.dcm", i)), b"").unwrap();
        }
        // A second series under the same study must not be matched.
        let other_series = dir
            .path()
            .join("LIDC-IDRI-0001")
            .join("1.2.840.study.777")
            .join("1.2.840.series.999");
        std::fs::create_dir_all(&other_series).unwrap();
        std::fs::write(other_series.join("000000.dcm"), b"").unwrap();

        let series = find_dicom_series(dir.path(), "1.2.840.study.777", Some("1.2.840.series.888"))
            .expect("series not found");
        assert_eq!(series.slice_count, 12);
        assert_eq!(patient_code(&series.first_slice).unwrap(), "0001");

        assert!(find_dicom_series(dir.path(), "no.such.study", None).is_none());
    }

    #[test]
    fn test_appendix_skips_existing_conversions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(assign_patient_id(dir.path(), "0001").unwrap(), "0001a");

        std::fs::create_dir_all(dir.path().join("0001a")).unwrap();
        std::fs::create_dir_all(dir.path().join("0001b")).unwrap();
        assert_eq!(assign_patient_id(dir.path(), "0001").unwrap(), "0001c");
    }
}
