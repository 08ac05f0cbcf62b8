// src/testutil.rs
//
// Helpers shared by test modules: synthetic mask files on disk and a
// minimal reader for the NIfTI output.

use std::io::Read;
use std::path::Path;

use crate::volume::{GridGeometry, MaskVolume};

pub fn unit_geometry(dims: [usize; 3]) -> GridGeometry {
    GridGeometry {
        dims,
        spacing: [1.0, 1.0, 1.0],
        origin: [0.0, 0.0, 0.0],
    }
}

/// A binary mask covering the given half-open voxel ranges.
pub fn block_mask(
    geometry: GridGeometry,
    xs: std::ops::Range<usize>,
    ys: std::ops::Range<usize>,
    zs: std::ops::Range<usize>,
) -> MaskVolume {
    let mut mask = MaskVolume::zeros(geometry);
    for z in zs {
        for y in ys.clone() {
            for x in xs.clone() {
                mask.set(x, y, z, 1);
            }
        }
    }
    mask
}

/// Writes a raw-encoded unsigned-short NRRD, the way the rasterizer's
/// output looks to the mask store.
pub fn write_nrrd(volume: &MaskVolume, path: &Path) {
    let g = &volume.geometry;
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"NRRD0004\n");
    bytes.extend_from_slice(b"# synthetic test mask\n");
    bytes.extend_from_slice(b"type: unsigned short\n");
    bytes.extend_from_slice(b"dimension: 3\n");
    bytes.extend_from_slice(format!("sizes: {} {} {}\n", g.dims[0], g.dims[1], g.dims[2]).as_bytes());
    bytes.extend_from_slice(b"encoding: raw\n");
    bytes.extend_from_slice(b"endian: little\n");
    bytes.extend_from_slice(
        format!(
            "space directions: ({},0,0) (0,{},0) (0,0,{})\n",
            g.spacing[0], g.spacing[1], g.spacing[2]
        )
        .as_bytes(),
    );
    bytes.extend_from_slice(
        format!("space origin: ({},{},{})\n", g.origin[0], g.origin[1], g.origin[2]).as_bytes(),
    );
    bytes.extend_from_slice(b"\n");
    for value in &volume.data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, bytes).unwrap();
}

/// Decodes a .nii.gz written by the canonical writer: returns dims and the
/// uint16 payload.
pub fn read_nifti_gz(path: &Path) -> ([usize; 3], Vec<u16>) {
    let file = std::fs::File::open(path).unwrap();
    let mut bytes = Vec::new();
    flate2::read::GzDecoder::new(file)
        .read_to_end(&mut bytes)
        .unwrap();

    assert_eq!(&bytes[344..348], b"n+1\0", "not a NIfTI-1 single file");
    let dim0 = i16::from_le_bytes([bytes[40], bytes[41]]);
    assert_eq!(dim0, 3);
    let dim = |axis: usize| i16::from_le_bytes([bytes[42 + axis * 2], bytes[43 + axis * 2]]) as usize;
    let dims = [dim(0), dim(1), dim(2)];

    let count = dims[0] * dims[1] * dims[2];
    let data = bytes[352..352 + count * 2]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    (dims, data)
}
