// src/annotation.rs
//
// Parses one LIDC annotation XML: reading sessions, nodules, ROI contours
// and the categorical nodule characteristics. The dataset mixes XML
// namespaces between files, so all tag matching is on local names only.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use roxmltree::{Document, Node};

#[derive(Debug, Clone)]
pub struct StudyAnnotation {
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    /// Reading sessions in document order; the index is the session id,
    /// unique within this patient only.
    pub sessions: Vec<ReadingSession>,
}

#[derive(Debug, Clone)]
pub struct ReadingSession {
    /// Radiologist code with '_' replaced by '-' ('_' delimits fields in
    /// generated file names).
    pub radiologist: String,
    pub nodules: Vec<NoduleAnnotation>,
}

#[derive(Debug, Clone)]
pub struct NoduleAnnotation {
    /// Dataset-run-unique raw id, set by `assign_raw_ids`.
    pub raw_id: u64,
    pub characteristics: Characteristics,
    pub rois: Vec<RoiContour>,
}

/// Properties radiologists score per nodule. Missing entries become "-1".
#[derive(Debug, Clone)]
pub struct Characteristics {
    pub subtlety: String,
    pub internal_structure: String,
    pub calcification: String,
    pub sphericity: String,
    pub margin: String,
    pub lobulation: String,
    pub spiculation: String,
    pub texture: String,
    pub malignancy: String,
}

impl Characteristics {
    fn read(nodule: Node) -> Self {
        Self {
            subtlety: read_property(nodule, "subtlety"),
            internal_structure: read_property(nodule, "internalStructure"),
            calcification: read_property(nodule, "calcification"),
            sphericity: read_property(nodule, "sphericity"),
            margin: read_property(nodule, "margin"),
            lobulation: read_property(nodule, "lobulation"),
            spiculation: read_property(nodule, "spiculation"),
            texture: read_property(nodule, "texture"),
            malignancy: read_property(nodule, "malignancy"),
        }
    }

    pub fn csv_fields(&self) -> [&str; 9] {
        [
            &self.subtlety,
            &self.internal_structure,
            &self.calcification,
            &self.sphericity,
            &self.margin,
            &self.lobulation,
            &self.spiculation,
            &self.texture,
            &self.malignancy,
        ]
    }
}

/// One slice-wise polygon delineation.
#[derive(Debug, Clone)]
pub struct RoiContour {
    /// Slice position in world z (mm).
    pub z_position: f64,
    /// In-plane vertices in voxel coordinates, document order.
    pub points: Vec<(f64, f64)>,
}

/// Hands out raw nodule ids, monotonically across the whole run.
#[derive(Debug, Default)]
pub struct NoduleIdAllocator {
    next: u64,
}

impl NoduleIdAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

pub fn parse_annotation_file(path: &Path) -> Result<StudyAnnotation> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read annotation {}", path.display()))?;
    parse_annotation(&text).with_context(|| format!("malformed annotation {}", path.display()))
}

pub fn parse_annotation(text: &str) -> Result<StudyAnnotation> {
    let doc = Document::parse(text)?;
    let root = doc.root_element();

    let study_uid = descendant_text(root, "StudyInstanceUID");
    let series_uid = descendant_text(root, "SeriesInstanceUid");

    let mut sessions = Vec::new();
    for session in elements_named(root, "readingSession") {
        let radiologist = descendant_text(session, "servicingRadiologistID")
            .unwrap_or_else(|| "-1".to_string())
            .replace('_', "-");

        let mut nodules = Vec::new();
        for nodule in elements_named(session, "unblindedReadNodule") {
            let characteristics = Characteristics::read(nodule);
            let mut rois = Vec::new();
            for roi in elements_named(nodule, "roi") {
                rois.push(parse_roi(roi)?);
            }
            nodules.push(NoduleAnnotation {
                raw_id: 0,
                characteristics,
                rois,
            });
        }
        sessions.push(ReadingSession {
            radiologist,
            nodules,
        });
    }

    Ok(StudyAnnotation {
        study_uid,
        series_uid,
        sessions,
    })
}

/// Assigns raw ids in document order. Called once the study is known to be
/// convertible, so skipped studies consume no ids.
pub fn assign_raw_ids(study: &mut StudyAnnotation, ids: &mut NoduleIdAllocator) {
    for session in &mut study.sessions {
        for nodule in &mut session.nodules {
            nodule.raw_id = ids.next_id();
        }
    }
}

fn parse_roi(roi: Node) -> Result<RoiContour> {
    // All vertices of one ROI sit on a single slice.
    let z_position = descendant_text(roi, "imageZposition")
        .ok_or_else(|| anyhow!("roi without imageZposition"))?
        .parse::<f64>()
        .context("bad imageZposition")?;

    let mut points = Vec::new();
    for edge in elements_named(roi, "edgeMap") {
        let x = child_text(edge, "xCoord")
            .ok_or_else(|| anyhow!("edgeMap without xCoord"))?
            .parse::<f64>()
            .context("bad xCoord")?;
        let y = child_text(edge, "yCoord")
            .ok_or_else(|| anyhow!("edgeMap without yCoord"))?
            .parse::<f64>()
            .context("bad yCoord")?;
        points.push((x, y));
    }

    Ok(RoiContour { z_position, points })
}

/// Descendant elements with the given local name, ignoring namespaces.
fn elements_named<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.descendants()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn descendant_text(node: Node, name: &str) -> Option<String> {
    elements_named(node, name)
        .next()
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn child_text(node: Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn read_property(nodule: Node, tag: &str) -> String {
    descendant_text(nodule, tag).unwrap_or_else(|| "-1".to_string())
}
