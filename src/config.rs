// src/config.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub tools: ToolsConfig,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory holding the MITK Phenotyping command-line tools.
    pub bin_dir: PathBuf,
    pub dicom_converter: String,
    pub rasterizer: String,
    /// Upper bound on any single external tool invocation.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the LIDC-IDRI DICOM tree.
    pub dicom_dir: PathBuf,
    /// Root of the annotation XML tree.
    pub xml_dir: PathBuf,
    /// Output root for converted scans and segmentations.
    pub volumes_dir: PathBuf,
    /// Output root for generated planar figures.
    pub planars_dir: PathBuf,
    /// Global nodule characteristics table (appended across runs).
    pub characteristics_csv: PathBuf,
    /// Append-only error log.
    pub error_log: PathBuf,
    /// Planar figure template with %%origin_*%% and %%points%% placeholders.
    pub planar_template: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("cannot parse config {}", path.display()))?;
        Ok(config)
    }
}
