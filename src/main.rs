// src/main.rs

mod annotation;
mod characteristics;
mod config;
mod error;
mod mitk;
mod planar;
mod reconcile;
mod scan;
#[cfg(test)]
mod testutil;
mod volume;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use walkdir::WalkDir;

use annotation::NoduleIdAllocator;
use characteristics::CharacteristicsWriter;
use config::Config;
use error::ErrorLog;
use mitk::MitkTools;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(Path::new(&config_path))?;

    tracing_subscriber::fmt()
        .with_env_filter(config.logging.level.as_str())
        .init();

    info!("🫁 LIDC annotation reconciliation starting");
    info!("✓ Configuration loaded from {}", config_path);

    let errors = ErrorLog::open(&config.paths.error_log)?;
    let tools = MitkTools::new(&config.tools);
    let mut characteristics = CharacteristicsWriter::open(&config.paths.characteristics_csv)?;
    let mut ids = NoduleIdAllocator::new();

    let annotation_files = find_annotation_files(&config.paths.xml_dir);
    if annotation_files.is_empty() {
        error!(
            "No annotation XML files found in {}",
            config.paths.xml_dir.display()
        );
        return Ok(());
    }
    info!("Found {} annotation file(s) to process", annotation_files.len());

    let mut totals = RunTotals::default();

    for (idx, xml_path) in annotation_files.iter().enumerate() {
        info!("========================================");
        info!(
            "Processing annotation {}/{}: {}",
            idx + 1,
            annotation_files.len(),
            xml_path.display()
        );

        match process_study(
            xml_path,
            &config,
            &tools,
            &errors,
            &mut characteristics,
            &mut ids,
        )
        .await
        {
            Ok(Some(stats)) => {
                totals.converted += 1;
                totals.canonical_masks += stats.reconcile.masks_written;
                totals.groups_rejected += stats.reconcile.groups_rejected;
                totals.write_failures += stats.reconcile.write_failures;
                info!(
                    "✓ {} converted: {} session(s), {} rater nodule(s), {} contour(s) rasterized, {} canonical mask(s) written",
                    stats.patient_id,
                    stats.sessions,
                    stats.nodules,
                    stats.figures,
                    stats.reconcile.masks_written
                );
            }
            Ok(None) => {
                totals.skipped += 1;
            }
            Err(e) => {
                totals.failed += 1;
                errors.report(format!(
                    "unspecified failure for {}: {:#}",
                    xml_path.display(),
                    e
                ));
            }
        }
    }

    characteristics.flush()?;

    info!("========================================");
    info!("Run complete");
    info!("  Studies converted: {}", totals.converted);
    info!("  Studies skipped: {}", totals.skipped);
    info!("  Studies failed: {}", totals.failed);
    info!("  Canonical masks written: {}", totals.canonical_masks);
    if totals.groups_rejected > 0 {
        warn!("  ⚠️  Corrupt ROI groups rejected: {}", totals.groups_rejected);
    }
    if totals.write_failures > 0 {
        warn!("  ⚠️  Canonical mask write failures: {}", totals.write_failures);
    }

    Ok(())
}

#[derive(Default)]
struct RunTotals {
    converted: usize,
    skipped: usize,
    failed: usize,
    canonical_masks: usize,
    groups_rejected: usize,
    write_failures: usize,
}

struct StudyStats {
    patient_id: String,
    sessions: usize,
    nodules: usize,
    figures: usize,
    reconcile: reconcile::ReconcileStats,
}

fn find_annotation_files(xml_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(xml_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        let is_xml = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("xml"));
        if is_xml {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    files
}

/// Runs the full conversion for one annotation file: parse, locate the
/// scan, convert it, emit planar figures and characteristics, rasterize
/// every contour, then reconcile the masks. Returns None when the study
/// cannot be matched to a usable scan.
async fn process_study(
    xml_path: &Path,
    config: &Config,
    tools: &MitkTools,
    errors: &ErrorLog,
    characteristics: &mut CharacteristicsWriter,
    ids: &mut NoduleIdAllocator,
) -> Result<Option<StudyStats>> {
    let mut study = annotation::parse_annotation_file(xml_path)?;

    let Some(study_uid) = study.study_uid.clone() else {
        errors.report(format!("failed to find study UID: {}", xml_path.display()));
        return Ok(None);
    };

    let Some(series) = scan::find_dicom_series(
        &config.paths.dicom_dir,
        &study_uid,
        study.series_uid.as_deref(),
    ) else {
        warn!("no DICOMs found for {}", xml_path.display());
        return Ok(None);
    };
    if series.slice_count < scan::MIN_DICOM_SLICES {
        warn!(
            "only {} DICOM slice(s) for {}, skipping",
            series.slice_count,
            xml_path.display()
        );
        return Ok(None);
    }

    let code = scan::patient_code(&series.first_slice)?;
    let patient_id = scan::assign_patient_id(&config.paths.volumes_dir, &code)?;
    annotation::assign_raw_ids(&mut study, ids);
    info!(
        "Patient {} ({} reading session(s), {} DICOM slices)",
        patient_id,
        study.sessions.len(),
        series.slice_count
    );

    // Convert the scan first; its voxel grid drives contour scaling and
    // rasterization.
    let patient_dir = config.paths.volumes_dir.join(&patient_id);
    std::fs::create_dir_all(&patient_dir)
        .with_context(|| format!("cannot create {}", patient_dir.display()))?;
    let scan_path = patient_dir.join(format!("{}_ct_scan.nrrd", patient_id));
    tools
        .dicom_to_volume(&series.first_slice, &scan_path)
        .await?;
    let geometry = volume::read_nrrd_geometry(&scan_path)?;

    let template = std::fs::read_to_string(&config.paths.planar_template).with_context(|| {
        format!(
            "cannot read planar template {}",
            config.paths.planar_template.display()
        )
    })?;

    let planar_dir = config.paths.planars_dir.join(&patient_id);
    std::fs::create_dir_all(&planar_dir)
        .with_context(|| format!("cannot create {}", planar_dir.display()))?;
    let mask_dir = reconcile::mask_store::roi_mask_dir(&config.paths.volumes_dir, &patient_id);
    std::fs::create_dir_all(&mask_dir)
        .with_context(|| format!("cannot create {}", mask_dir.display()))?;

    let mut nodules = 0usize;
    let mut figures = 0usize;
    for (session_idx, session) in study.sessions.iter().enumerate() {
        for nodule in &session.nodules {
            nodules += 1;
            characteristics.append(
                &patient_id,
                session_idx as u32,
                &session.radiologist,
                nodule.raw_id,
                &nodule.characteristics,
            )?;

            for (roi_idx, roi) in nodule.rois.iter().enumerate() {
                let Some(figure) =
                    planar::render_planar_figure(&template, roi, geometry.spacing, geometry.origin)
                else {
                    // Too small to annotate spatially; descriptors were
                    // still recorded above.
                    continue;
                };
                let stem =
                    planar::roi_file_stem(&patient_id, session_idx as u32, nodule.raw_id, roi_idx);
                let figure_path = planar_dir.join(format!("{}.pf", stem));
                std::fs::write(&figure_path, figure)
                    .with_context(|| format!("cannot write {}", figure_path.display()))?;

                let mask_path = mask_dir.join(format!("{}.nrrd", stem));
                tools.rasterize(&scan_path, &figure_path, &mask_path).await?;
                figures += 1;
            }
        }
    }
    info!(
        "Rasterized {} contour(s) across {} rater nodule(s)",
        figures, nodules
    );

    // Merge per-rater masks and unify identities across raters. A grid
    // mismatch aborts this patient only.
    let stats = match reconcile::reconcile_patient(&config.paths.volumes_dir, &patient_id, errors) {
        Ok(stats) => stats,
        Err(e) => {
            errors.report(format!("{:#}", e));
            reconcile::ReconcileStats::default()
        }
    };

    Ok(Some(StudyStats {
        patient_id,
        sessions: study.sessions.len(),
        nodules,
        figures,
        reconcile: stats,
    }))
}
