// src/mitk.rs
//
// Wrappers around the external MITK Phenotyping command-line tools. Both
// are out-of-process collaborators that can hang on malformed input, so
// every invocation runs under a timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::config::ToolsConfig;

pub struct MitkTools {
    bin_dir: PathBuf,
    dicom_converter: String,
    rasterizer: String,
    timeout: Duration,
}

impl MitkTools {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            bin_dir: config.bin_dir.clone(),
            dicom_converter: config.dicom_converter.clone(),
            rasterizer: config.rasterizer.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Converts a DICOM series (identified by one slice) into a single
    /// NRRD volume.
    pub async fn dicom_to_volume(&self, slice: &Path, output: &Path) -> Result<()> {
        self.run(&self.dicom_converter, &[("-i", slice), ("-o", output)])
            .await
    }

    /// Rasterizes one planar figure against the reference scan.
    pub async fn rasterize(&self, reference: &Path, figure: &Path, output: &Path) -> Result<()> {
        self.run(
            &self.rasterizer,
            &[("-i", reference), ("-p", figure), ("-o", output)],
        )
        .await
    }

    async fn run(&self, tool: &str, args: &[(&str, &Path)]) -> Result<()> {
        let mut command = Command::new(self.bin_dir.join(tool));
        command.current_dir(&self.bin_dir);
        for (flag, value) in args {
            command.arg(flag).arg(value);
        }
        command
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("invoking {}", tool);
        let child = command
            .spawn()
            .with_context(|| format!("failed to launch {}", tool))?;

        // Dropping the future on timeout kills the child (kill_on_drop).
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.with_context(|| format!("{} did not run to completion", tool))?
            }
            Err(_) => bail!("{} timed out after {}s", tool, self.timeout.as_secs()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", tool, output.status, stderr.trim());
        }
        Ok(())
    }
}
