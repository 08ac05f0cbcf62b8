// src/characteristics.rs
//
// Global table of per-nodule descriptor scores, one row per rater nodule.
// The table outlives a single run: rows are appended, never rewritten.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result};

use crate::annotation::Characteristics;

const HEADER: [&str; 13] = [
    "Patient_ID",
    "Session_ID",
    "Radiologist",
    "Nodule_ID",
    "subtlety",
    "internalStructure",
    "calcification",
    "sphericity",
    "margin",
    "lobulation",
    "spiculation",
    "texture",
    "malignancy",
];

pub struct CharacteristicsWriter {
    writer: csv::Writer<File>,
}

impl CharacteristicsWriter {
    /// Opens the table in append mode; the header is written only when the
    /// file is created.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("cannot create {}", parent.display()))?;
            }
        }
        let new_file = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open characteristics table {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new().delimiter(b';').from_writer(file);
        if new_file {
            writer.write_record(HEADER).context("cannot write header")?;
        }
        Ok(Self { writer })
    }

    pub fn append(
        &mut self,
        patient: &str,
        session: u32,
        radiologist: &str,
        raw_id: u64,
        characteristics: &Characteristics,
    ) -> Result<()> {
        let mut record = vec![
            patient.to_string(),
            session.to_string(),
            radiologist.to_string(),
            format!("{:08}", raw_id),
        ];
        record.extend(characteristics.csv_fields().iter().map(|f| f.to_string()));
        self.writer
            .write_record(&record)
            .context("cannot append characteristics row")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("cannot flush characteristics table")
    }
}
