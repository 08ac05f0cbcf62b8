// src/planar.rs
//
// Renders ROI contours into MITK planar-figure files via the user-supplied
// template. One figure per annotated slice.

use crate::annotation::RoiContour;

/// Contours with fewer vertices than this are not spatial annotations (the
/// lesion was too small to outline) and produce no figure.
pub const MIN_CONTOUR_POINTS: usize = 2;

/// Fills the planar-figure template for one contour, or returns None when
/// the contour has too few vertices. Vertex coordinates are scaled from
/// voxel to world units by the in-plane spacing; the slice position comes
/// from the contour itself.
pub fn render_planar_figure(
    template: &str,
    roi: &RoiContour,
    spacing: [f64; 3],
    origin: [f64; 3],
) -> Option<String> {
    if roi.points.len() < MIN_CONTOUR_POINTS {
        return None;
    }

    let mut vertices = String::new();
    for (id, (x, y)) in roi.points.iter().enumerate() {
        vertices.push_str(&format!(
            "        <Vertex id=\"{}\" x=\"{}\" y=\"{}\" />\n",
            id,
            x * spacing[0],
            y * spacing[1]
        ));
    }

    Some(
        template
            .replace("%%origin_x%%", &origin[0].to_string())
            .replace("%%origin_y%%", &origin[1].to_string())
            .replace("%%origin_z%%", &roi.z_position.to_string())
            .replace("%%points%%", &vertices),
    )
}

/// File stem shared by a contour's planar figure and its rasterized mask:
/// `<patient>_<session>_<raw id>_<roi index>`.
pub fn roi_file_stem(patient: &str, session: u32, raw_id: u64, roi_idx: usize) -> String {
    format!("{}_{}_{}_{}", patient, session, raw_id, roi_idx)
}
