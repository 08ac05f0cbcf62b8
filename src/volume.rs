// src/volume.rs
//
// In-memory voxel volumes plus the two on-disk formats the pipeline
// touches: NRRD masks coming back from the external rasterizer (read) and
// gzipped NIfTI-1 canonical segmentations (write). Volume data is a flat
// buffer, x fastest.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Tolerance when comparing spacing/origin between grids. Values are read
/// back from text headers, so bit-exact equality is too strict.
pub const GEOMETRY_EPS: f64 = 1e-3;

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("{path}: {message}")]
    Malformed { path: String, message: String },

    #[error("{path}: unsupported {feature}")]
    Unsupported { path: String, feature: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn malformed(path: &Path, message: impl Into<String>) -> VolumeError {
    VolumeError::Malformed {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn unsupported(path: &Path, feature: impl Into<String>) -> VolumeError {
    VolumeError::Unsupported {
        path: path.display().to_string(),
        feature: feature.into(),
    }
}

fn io_err(path: &Path, source: std::io::Error) -> VolumeError {
    VolumeError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Voxel grid shared by a scan and every mask derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    /// Dimensions [nx, ny, nz].
    pub dims: [usize; 3],
    /// Voxel spacing in mm.
    pub spacing: [f64; 3],
    /// World position of the first voxel in mm.
    pub origin: [f64; 3],
}

impl GridGeometry {
    pub fn voxel_count(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Whether two grids can be compared or merged voxel-for-voxel.
    pub fn matches(&self, other: &GridGeometry) -> bool {
        self.dims == other.dims
            && approx_eq(&self.spacing, &other.spacing)
            && approx_eq(&self.origin, &other.origin)
    }
}

fn approx_eq(a: &[f64; 3], b: &[f64; 3]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= GEOMETRY_EPS)
}

/// A voxel mask or mask sum. Values are small counts: 0/1 for a valid
/// binary mask, larger after intra-rater summation.
#[derive(Debug, Clone)]
pub struct MaskVolume {
    pub geometry: GridGeometry,
    /// data[z * ny * nx + y * nx + x]
    pub data: Vec<u16>,
}

impl MaskVolume {
    /// Zero-initialized volume on the given grid.
    pub fn zeros(geometry: GridGeometry) -> Self {
        let len = geometry.voxel_count();
        Self {
            geometry,
            data: vec![0; len],
        }
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        let [nx, ny, _] = self.geometry.dims;
        z * ny * nx + y * nx + x
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: u16) {
        let idx = self.index(x, y, z);
        self.data[idx] = value;
    }

    /// Voxel-wise sum of another mask into this one (intra-rater merge).
    pub fn accumulate(&mut self, other: &MaskVolume) {
        debug_assert!(self.geometry.matches(&other.geometry));
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst = dst.saturating_add(*src);
        }
    }

    /// Marks every voxel set in `other` (inter-rater union).
    pub fn union_with(&mut self, other: &MaskVolume) {
        debug_assert!(self.geometry.matches(&other.geometry));
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            if *src > 0 {
                *dst = 1;
            }
        }
    }

    pub fn count_nonzero(&self) -> usize {
        self.data.iter().filter(|&&v| v > 0).count()
    }

    pub fn max_value(&self) -> u16 {
        self.data.iter().copied().max().unwrap_or(0)
    }
}

// =============================================================================
// NRRD reading
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum NrrdType {
    U8,
    I16,
    U16,
    I32,
    U32,
}

impl NrrdType {
    fn sample_bytes(self) -> usize {
        match self {
            NrrdType::U8 => 1,
            NrrdType::I16 | NrrdType::U16 => 2,
            NrrdType::I32 | NrrdType::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum NrrdEncoding {
    Raw,
    Gzip,
}

struct NrrdHeader {
    geometry: GridGeometry,
    ty: NrrdType,
    encoding: NrrdEncoding,
    big_endian: bool,
}

/// Reads a full NRRD mask into memory.
pub fn read_nrrd(path: &Path) -> Result<MaskVolume, VolumeError> {
    let bytes = std::fs::read(path).map_err(|e| io_err(path, e))?;
    let (lines, data_start) = split_header(&bytes);
    let header = parse_header(&lines, path)?;

    let payload = match header.encoding {
        NrrdEncoding::Raw => bytes[data_start..].to_vec(),
        NrrdEncoding::Gzip => {
            let mut decoded = Vec::new();
            GzDecoder::new(&bytes[data_start..])
                .read_to_end(&mut decoded)
                .map_err(|e| io_err(path, e))?;
            decoded
        }
    };

    let count = header.geometry.voxel_count();
    let data = convert_samples(&payload, header.ty, header.big_endian, count, path)?;
    Ok(MaskVolume {
        geometry: header.geometry,
        data,
    })
}

/// Reads only the grid geometry of an NRRD file, leaving the payload on
/// disk. Used for the (potentially large) reference scan.
pub fn read_nrrd_geometry(path: &Path) -> Result<GridGeometry, VolumeError> {
    let file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    loop {
        let mut raw = Vec::new();
        let n = reader.read_until(b'\n', &mut raw).map_err(|e| io_err(path, e))?;
        if n == 0 {
            break;
        }
        let line = trim_line(&raw);
        if line.is_empty() {
            break;
        }
        lines.push(String::from_utf8_lossy(line).into_owned());
    }
    let header = parse_header(&lines, path)?;
    Ok(header.geometry)
}

/// Splits raw file bytes into header lines and the offset of the payload.
/// The header ends at the first empty line.
fn split_header(bytes: &[u8]) -> (Vec<String>, usize) {
    let mut lines = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let nl = bytes[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i)
            .unwrap_or(bytes.len());
        let line = trim_line(&bytes[pos..nl]);
        pos = nl.saturating_add(1).min(bytes.len().saturating_add(1));
        if line.is_empty() {
            break;
        }
        lines.push(String::from_utf8_lossy(line).into_owned());
        if nl == bytes.len() {
            break;
        }
    }
    (lines, pos.min(bytes.len()))
}

fn trim_line(raw: &[u8]) -> &[u8] {
    let mut line = raw;
    while let Some((&last, rest)) = line.split_last() {
        if last == b'\n' || last == b'\r' {
            line = rest;
        } else {
            break;
        }
    }
    line
}

fn parse_header(lines: &[String], path: &Path) -> Result<NrrdHeader, VolumeError> {
    if !lines.first().map_or(false, |l| l.starts_with("NRRD")) {
        return Err(malformed(path, "missing NRRD magic"));
    }

    let mut dimension: Option<usize> = None;
    let mut sizes: Option<Vec<usize>> = None;
    let mut spacing: Option<[f64; 3]> = None;
    let mut origin = [0.0; 3];
    let mut ty: Option<NrrdType> = None;
    let mut encoding: Option<NrrdEncoding> = None;
    let mut big_endian = false;

    for line in &lines[1..] {
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        // "key:=value" pairs are free-form metadata, not header fields.
        if value.starts_with('=') {
            continue;
        }
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "dimension" => {
                dimension = Some(
                    value
                        .parse()
                        .map_err(|_| malformed(path, format!("bad dimension '{}'", value)))?,
                );
            }
            "sizes" => {
                let parsed: Result<Vec<usize>, _> =
                    value.split_whitespace().map(|t| t.parse()).collect();
                sizes =
                    Some(parsed.map_err(|_| malformed(path, format!("bad sizes '{}'", value)))?);
            }
            "type" => ty = Some(parse_type(value, path)?),
            "encoding" => {
                encoding = Some(match value {
                    "raw" => NrrdEncoding::Raw,
                    "gzip" | "gz" => NrrdEncoding::Gzip,
                    other => return Err(unsupported(path, format!("encoding '{}'", other))),
                });
            }
            "endian" => big_endian = value.eq_ignore_ascii_case("big"),
            "spacings" => {
                let parsed: Result<Vec<f64>, _> =
                    value.split_whitespace().map(|t| t.parse()).collect();
                let parsed =
                    parsed.map_err(|_| malformed(path, format!("bad spacings '{}'", value)))?;
                if parsed.len() == 3 {
                    spacing = Some([parsed[0], parsed[1], parsed[2]]);
                }
            }
            "space directions" => spacing = Some(parse_directions(value, path)?),
            "space origin" => origin = parse_vector(value, path)?,
            _ => {}
        }
    }

    if dimension != Some(3) {
        return Err(unsupported(
            path,
            format!("{}-dimensional data", dimension.unwrap_or(0)),
        ));
    }
    let sizes = sizes.ok_or_else(|| malformed(path, "missing sizes"))?;
    if sizes.len() != 3 {
        return Err(malformed(path, "sizes do not match dimension"));
    }

    Ok(NrrdHeader {
        geometry: GridGeometry {
            dims: [sizes[0], sizes[1], sizes[2]],
            spacing: spacing.unwrap_or([1.0, 1.0, 1.0]),
            origin,
        },
        ty: ty.ok_or_else(|| malformed(path, "missing type"))?,
        encoding: encoding.ok_or_else(|| malformed(path, "missing encoding"))?,
        big_endian,
    })
}

fn parse_type(value: &str, path: &Path) -> Result<NrrdType, VolumeError> {
    match value {
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => Ok(NrrdType::U8),
        "short" | "short int" | "signed short" | "int16" | "int16_t" => Ok(NrrdType::I16),
        "ushort" | "unsigned short" | "uint16" | "uint16_t" => Ok(NrrdType::U16),
        "int" | "signed int" | "int32" | "int32_t" => Ok(NrrdType::I32),
        "uint" | "unsigned int" | "uint32" | "uint32_t" => Ok(NrrdType::U32),
        other => Err(unsupported(path, format!("sample type '{}'", other))),
    }
}

/// "space directions: (a,b,c) (d,e,f) (g,h,i)" — per-axis spacing is the
/// norm of each direction vector. "none" entries (non-spatial axes) are
/// skipped.
fn parse_directions(value: &str, path: &Path) -> Result<[f64; 3], VolumeError> {
    let mut norms = Vec::new();
    for chunk in value.split(')') {
        let Some(start) = chunk.find('(') else {
            continue;
        };
        let components = parse_components(&chunk[start + 1..], path)?;
        let norm = components.iter().map(|c| c * c).sum::<f64>().sqrt();
        norms.push(norm);
    }
    if norms.len() != 3 {
        return Err(malformed(path, "expected 3 space directions"));
    }
    Ok([norms[0], norms[1], norms[2]])
}

fn parse_vector(value: &str, path: &Path) -> Result<[f64; 3], VolumeError> {
    let Some(start) = value.find('(') else {
        return Err(malformed(path, format!("bad vector '{}'", value)));
    };
    let end = value.rfind(')').unwrap_or(value.len());
    let components = parse_components(&value[start + 1..end], path)?;
    if components.len() != 3 {
        return Err(malformed(path, format!("bad vector '{}'", value)));
    }
    Ok([components[0], components[1], components[2]])
}

fn parse_components(text: &str, path: &Path) -> Result<Vec<f64>, VolumeError> {
    text.trim_end_matches(')')
        .split(',')
        .map(|t| {
            t.trim()
                .parse()
                .map_err(|_| malformed(path, format!("bad number '{}'", t.trim())))
        })
        .collect()
}

fn convert_samples(
    payload: &[u8],
    ty: NrrdType,
    big_endian: bool,
    count: usize,
    path: &Path,
) -> Result<Vec<u16>, VolumeError> {
    let need = count * ty.sample_bytes();
    if payload.len() < need {
        return Err(malformed(
            path,
            format!("payload truncated: {} bytes, need {}", payload.len(), need),
        ));
    }
    let payload = &payload[..need];

    let data = match ty {
        NrrdType::U8 => payload.iter().map(|&b| b as u16).collect(),
        NrrdType::U16 => payload
            .chunks_exact(2)
            .map(|c| {
                let raw = [c[0], c[1]];
                if big_endian {
                    u16::from_be_bytes(raw)
                } else {
                    u16::from_le_bytes(raw)
                }
            })
            .collect(),
        NrrdType::I16 => payload
            .chunks_exact(2)
            .map(|c| {
                let raw = [c[0], c[1]];
                let v = if big_endian {
                    i16::from_be_bytes(raw)
                } else {
                    i16::from_le_bytes(raw)
                };
                v.max(0) as u16
            })
            .collect(),
        NrrdType::U32 => payload
            .chunks_exact(4)
            .map(|c| {
                let raw = [c[0], c[1], c[2], c[3]];
                let v = if big_endian {
                    u32::from_be_bytes(raw)
                } else {
                    u32::from_le_bytes(raw)
                };
                v.min(u16::MAX as u32) as u16
            })
            .collect(),
        NrrdType::I32 => payload
            .chunks_exact(4)
            .map(|c| {
                let raw = [c[0], c[1], c[2], c[3]];
                let v = if big_endian {
                    i32::from_be_bytes(raw)
                } else {
                    i32::from_le_bytes(raw)
                };
                v.clamp(0, u16::MAX as i32) as u16
            })
            .collect(),
    };
    Ok(data)
}

// =============================================================================
// NIfTI-1 writing
// =============================================================================

const NIFTI_HEADER_LEN: usize = 348;
const NIFTI_DT_UINT16: i16 = 512;

/// Writes a volume as a gzipped NIfTI-1 file with uint16 samples.
pub fn write_nifti_gz(volume: &MaskVolume, path: &Path) -> Result<(), VolumeError> {
    let header = nifti1_header(&volume.geometry, path)?;

    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    encoder.write_all(&header).map_err(|e| io_err(path, e))?;
    // Empty extension block; voxels start at byte 352.
    encoder.write_all(&[0u8; 4]).map_err(|e| io_err(path, e))?;

    let mut payload = Vec::with_capacity(volume.data.len() * 2);
    for value in &volume.data {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    encoder.write_all(&payload).map_err(|e| io_err(path, e))?;

    let mut inner = encoder.finish().map_err(|e| io_err(path, e))?;
    inner.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn nifti1_header(geometry: &GridGeometry, path: &Path) -> Result<[u8; NIFTI_HEADER_LEN], VolumeError> {
    for &dim in &geometry.dims {
        if dim > i16::MAX as usize {
            return Err(malformed(path, format!("dimension {} exceeds NIfTI-1 limits", dim)));
        }
    }

    let mut h = [0u8; NIFTI_HEADER_LEN];
    put_i32(&mut h, 0, NIFTI_HEADER_LEN as i32); // sizeof_hdr
    h[38] = b'r'; // regular

    put_i16(&mut h, 40, 3); // dim[0]
    for (axis, &dim) in geometry.dims.iter().enumerate() {
        put_i16(&mut h, 42 + axis * 2, dim as i16);
    }
    for axis in 3..7 {
        put_i16(&mut h, 42 + axis * 2, 1);
    }

    put_i16(&mut h, 70, NIFTI_DT_UINT16); // datatype
    put_i16(&mut h, 72, 16); // bitpix

    put_f32(&mut h, 76, 1.0); // pixdim[0] (qfac)
    for (axis, &s) in geometry.spacing.iter().enumerate() {
        put_f32(&mut h, 80 + axis * 4, s as f32);
    }

    put_f32(&mut h, 108, 352.0); // vox_offset
    put_f32(&mut h, 112, 1.0); // scl_slope
    h[123] = 2; // xyzt_units: millimetres

    let descrip = b"lidc-reconcile canonical segmentation";
    h[148..148 + descrip.len()].copy_from_slice(descrip);

    put_i16(&mut h, 254, 1); // sform_code
    put_f32(&mut h, 280, geometry.spacing[0] as f32); // srow_x
    put_f32(&mut h, 292, geometry.origin[0] as f32);
    put_f32(&mut h, 300, geometry.spacing[1] as f32); // srow_y
    put_f32(&mut h, 308, geometry.origin[1] as f32);
    put_f32(&mut h, 320, geometry.spacing[2] as f32); // srow_z
    put_f32(&mut h, 324, geometry.origin[2] as f32);

    h[344..348].copy_from_slice(b"n+1\0");
    Ok(h)
}

fn put_i16(buf: &mut [u8], offset: usize, value: i16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
