//! NIfTI-1 single-file (`.nii` / `.nii.gz`) reader and writer.
//!
//! Only the first 3D frame of a volume is read. Data is returned as `f32`
//! with `scl_slope` / `scl_inter` applied. The voxel-to-world transform comes
//! from the sform when present, then the qform, then the pixdim diagonal.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

/// Size of the fixed NIfTI-1 header.
pub const HEADER_SIZE: usize = 348;

/// Header plus the 4-byte extension flag; start of data in written files.
const DATA_OFFSET: usize = 352;

const MAGIC_SINGLE_FILE: &[u8; 4] = b"n+1\0";

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

/// NIfTI parsing errors.
#[derive(Error, Debug)]
pub enum NiftiError {
    #[error("truncated NIfTI data: {0}")]
    Truncated(String),

    #[error("not a NIfTI-1 image: {0}")]
    BadHeader(String),

    #[error("unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    #[error("image needs {needed} bytes, limit is {limit}")]
    TooLarge { needed: usize, limit: usize },

    #[error("volume has {actual} values, grid needs {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<NiftiError> for nsweb_core::Error {
    fn from(e: NiftiError) -> Self {
        match e {
            NiftiError::Io(io) => nsweb_core::Error::Io(io),
            other => nsweb_core::Error::Validation(other.to_string()),
        }
    }
}

/// Row-major 3x4 voxel-to-world transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub [[f64; 4]; 3]);

impl Affine {
    /// Scaling-only transform with the origin at voxel (0, 0, 0).
    pub fn diagonal(sx: f64, sy: f64, sz: f64) -> Self {
        Affine([
            [sx, 0.0, 0.0, 0.0],
            [0.0, sy, 0.0, 0.0],
            [0.0, 0.0, sz, 0.0],
        ])
    }

    pub fn apply(&self, i: f64, j: f64, k: f64) -> [f64; 3] {
        let m = &self.0;
        [
            m[0][0] * i + m[0][1] * j + m[0][2] * k + m[0][3],
            m[1][0] * i + m[1][1] * j + m[1][2] * k + m[1][3],
            m[2][0] * i + m[2][1] * j + m[2][2] * k + m[2][3],
        ]
    }

    /// Inverse transform, or `None` when the linear part is singular.
    pub fn inverse(&self) -> Option<Affine> {
        let m = &self.0;
        let (a, b, c) = (m[0][0], m[0][1], m[0][2]);
        let (d, e, f) = (m[1][0], m[1][1], m[1][2]);
        let (g, h, i) = (m[2][0], m[2][1], m[2][2]);

        let det = a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g);
        if det.abs() < 1e-12 || !det.is_finite() {
            return None;
        }
        let inv = [
            [(e * i - f * h) / det, (c * h - b * i) / det, (b * f - c * e) / det],
            [(f * g - d * i) / det, (a * i - c * g) / det, (c * d - a * f) / det],
            [(d * h - e * g) / det, (b * g - a * h) / det, (a * e - b * d) / det],
        ];
        let t = [m[0][3], m[1][3], m[2][3]];
        let mut out = [[0.0; 4]; 3];
        for r in 0..3 {
            out[r][..3].copy_from_slice(&inv[r]);
            out[r][3] = -(inv[r][0] * t[0] + inv[r][1] * t[1] + inv[r][2] * t[2]);
        }
        Some(Affine(out))
    }

    /// Length of each voxel axis in world units.
    fn voxel_sizes(&self) -> [f64; 3] {
        let m = &self.0;
        let mut out = [0.0; 3];
        for (c, size) in out.iter_mut().enumerate() {
            *size = (m[0][c].powi(2) + m[1][c].powi(2) + m[2][c].powi(2)).sqrt();
        }
        out
    }
}

/// Voxel grid: dimensions plus placement in world space.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub dims: [usize; 3],
    pub affine: Affine,
}

impl Grid {
    pub fn new(dims: [usize; 3], affine: Affine) -> Self {
        Self { dims, affine }
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear index with `i` varying fastest.
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.dims[0] * (j + self.dims[1] * k)
    }

    /// Linear index of the voxel nearest a world coordinate.
    pub fn world_to_index(&self, x: f64, y: f64, z: f64) -> Option<usize> {
        let inv = self.affine.inverse()?;
        self.rounded_index(inv.apply(x, y, z))
    }

    fn rounded_index(&self, v: [f64; 3]) -> Option<usize> {
        let mut ijk = [0usize; 3];
        for axis in 0..3 {
            let r = v[axis].round();
            if !r.is_finite() || r < 0.0 || r >= self.dims[axis] as f64 {
                return None;
            }
            ijk[axis] = r as usize;
        }
        Some(self.index(ijk[0], ijk[1], ijk[2]))
    }
}

/// A 3D scalar volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub grid: Grid,
    pub data: Vec<f32>,
}

impl Volume {
    pub fn new(grid: Grid, data: Vec<f32>) -> Result<Self, NiftiError> {
        if data.len() != grid.len() {
            return Err(NiftiError::ShapeMismatch {
                expected: grid.len(),
                actual: data.len(),
            });
        }
        Ok(Self { grid, data })
    }

    /// Nearest-neighbour resample onto `target`. Voxels that fall outside
    /// this volume are NaN.
    pub fn resample_to(&self, target: &Grid) -> Vec<f32> {
        if &self.grid == target {
            return self.data.clone();
        }
        let Some(inv) = self.grid.affine.inverse() else {
            return vec![f32::NAN; target.len()];
        };

        let mut out = Vec::with_capacity(target.len());
        for k in 0..target.dims[2] {
            for j in 0..target.dims[1] {
                for i in 0..target.dims[0] {
                    let [x, y, z] = target.affine.apply(i as f64, j as f64, k as f64);
                    let value = self
                        .grid
                        .rounded_index(inv.apply(x, y, z))
                        .map_or(f32::NAN, |idx| self.data[idx]);
                    out.push(value);
                }
            }
        }
        out
    }
}

// =============================================================================
// READING
// =============================================================================

struct HeaderReader<'a> {
    buf: &'a [u8],
    little_endian: bool,
}

impl HeaderReader<'_> {
    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[offset..offset + N]);
        out
    }

    fn i16(&self, offset: usize) -> i16 {
        let b = self.bytes::<2>(offset);
        if self.little_endian {
            i16::from_le_bytes(b)
        } else {
            i16::from_be_bytes(b)
        }
    }

    fn f32(&self, offset: usize) -> f32 {
        let b = self.bytes::<4>(offset);
        if self.little_endian {
            f32::from_le_bytes(b)
        } else {
            f32::from_be_bytes(b)
        }
    }
}

fn datatype_size(datatype: i16) -> Result<usize, NiftiError> {
    match datatype {
        DT_UINT8 | DT_INT8 => Ok(1),
        DT_INT16 | DT_UINT16 => Ok(2),
        DT_INT32 | DT_UINT32 | DT_FLOAT32 => Ok(4),
        DT_FLOAT64 => Ok(8),
        other => Err(NiftiError::UnsupportedDatatype(other)),
    }
}

fn decode_value(datatype: i16, b: &[u8], le: bool) -> f32 {
    macro_rules! num {
        ($t:ty, $n:expr) => {{
            let mut arr = [0u8; $n];
            arr.copy_from_slice(&b[..$n]);
            if le {
                <$t>::from_le_bytes(arr)
            } else {
                <$t>::from_be_bytes(arr)
            }
        }};
    }
    match datatype {
        DT_UINT8 => b[0] as f32,
        DT_INT8 => b[0] as i8 as f32,
        DT_INT16 => num!(i16, 2) as f32,
        DT_UINT16 => num!(u16, 2) as f32,
        DT_INT32 => num!(i32, 4) as f32,
        DT_UINT32 => num!(u32, 4) as f32,
        DT_FLOAT32 => num!(f32, 4),
        DT_FLOAT64 => num!(f64, 8) as f32,
        _ => f32::NAN,
    }
}

fn qform_affine(r: &HeaderReader<'_>, pixdim: &[f64; 8]) -> Affine {
    let b = r.f32(256) as f64;
    let c = r.f32(260) as f64;
    let d = r.f32(264) as f64;
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let rot = [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
    ];
    let offsets = [r.f32(268) as f64, r.f32(272) as f64, r.f32(276) as f64];
    let scale = [pixdim[1], pixdim[2], pixdim[3] * qfac];
    let mut m = [[0.0; 4]; 3];
    for row in 0..3 {
        for col in 0..3 {
            m[row][col] = rot[row][col] * scale[col];
        }
        m[row][3] = offsets[row];
    }
    Affine(m)
}

/// Fields of a parsed header needed to decode the first frame.
struct Header {
    little_endian: bool,
    datatype: i16,
    value_size: usize,
    vox_offset: usize,
    slope: f32,
    inter: f32,
    grid: Grid,
    /// Byte offset just past the first frame.
    data_end: usize,
}

impl Header {
    fn parse(buf: &[u8]) -> Result<Self, NiftiError> {
        if buf.len() < HEADER_SIZE {
            return Err(NiftiError::Truncated(format!(
                "{} bytes, header needs {}",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let size_bytes = [buf[0], buf[1], buf[2], buf[3]];
        let little_endian = if i32::from_le_bytes(size_bytes) == HEADER_SIZE as i32 {
            true
        } else if i32::from_be_bytes(size_bytes) == HEADER_SIZE as i32 {
            false
        } else {
            return Err(NiftiError::BadHeader("sizeof_hdr is not 348".to_string()));
        };
        let r = HeaderReader { buf, little_endian };

        if &buf[344..348] != MAGIC_SINGLE_FILE {
            return Err(NiftiError::BadHeader(
                "only single-file n+1 images are supported".to_string(),
            ));
        }

        let ndim = r.i16(40);
        if !(1..=7).contains(&ndim) {
            return Err(NiftiError::BadHeader(format!("dim[0] = {}", ndim)));
        }
        let mut dims = [1usize; 3];
        for (axis, dim) in dims.iter_mut().enumerate() {
            if (axis as i16) < ndim {
                let n = r.i16(42 + 2 * axis);
                if n < 1 {
                    return Err(NiftiError::BadHeader(format!("dim[{}] = {}", axis + 1, n)));
                }
                *dim = n as usize;
            }
        }

        let datatype = r.i16(70);
        let value_size = datatype_size(datatype)?;

        let mut pixdim = [0.0f64; 8];
        for (n, p) in pixdim.iter_mut().enumerate() {
            *p = r.f32(76 + 4 * n) as f64;
        }
        for p in pixdim.iter_mut().take(4).skip(1) {
            if *p <= 0.0 || !p.is_finite() {
                *p = 1.0;
            }
        }

        let vox_offset = r.f32(108);
        if !vox_offset.is_finite() || vox_offset < HEADER_SIZE as f32 {
            return Err(NiftiError::BadHeader(format!("vox_offset = {}", vox_offset)));
        }
        let vox_offset = vox_offset as usize;

        let qform_code = r.i16(252);
        let sform_code = r.i16(254);
        let affine = if sform_code > 0 {
            let mut m = [[0.0; 4]; 3];
            for (row, base) in [280usize, 296, 312].iter().enumerate() {
                for col in 0..4 {
                    m[row][col] = r.f32(base + 4 * col) as f64;
                }
            }
            Affine(m)
        } else if qform_code > 0 {
            qform_affine(&r, &pixdim)
        } else {
            Affine::diagonal(pixdim[1], pixdim[2], pixdim[3])
        };

        let data_end = dims
            .iter()
            .try_fold(value_size, |acc, &d| acc.checked_mul(d))
            .and_then(|data_len| vox_offset.checked_add(data_len))
            .ok_or_else(|| {
                NiftiError::BadHeader(format!(
                    "dims {:?} at offset {} overflow the address space",
                    dims, vox_offset
                ))
            })?;

        Ok(Self {
            little_endian,
            datatype,
            value_size,
            vox_offset,
            slope: r.f32(112),
            inter: r.f32(116),
            grid: Grid::new(dims, affine),
            data_end,
        })
    }

    fn check_limit(&self, limit: usize) -> Result<(), NiftiError> {
        if self.data_end > limit {
            return Err(NiftiError::TooLarge {
                needed: self.data_end,
                limit,
            });
        }
        Ok(())
    }

    fn decode(self, buf: &[u8]) -> Result<Volume, NiftiError> {
        if buf.len() < self.data_end {
            return Err(NiftiError::Truncated(format!(
                "data ends at byte {}, image needs {}",
                buf.len(),
                self.data_end
            )));
        }

        let apply_scale = self.slope != 0.0 && self.slope.is_finite() && self.inter.is_finite();
        let data = buf[self.vox_offset..self.data_end]
            .chunks_exact(self.value_size)
            .map(|chunk| {
                let v = decode_value(self.datatype, chunk, self.little_endian);
                if apply_scale {
                    v * self.slope + self.inter
                } else {
                    v
                }
            })
            .collect();

        Volume::new(self.grid, data)
    }
}

/// Parse a NIfTI-1 image from raw or gzip-compressed bytes.
pub fn parse(bytes: &[u8]) -> Result<Volume, NiftiError> {
    parse_with_limit(bytes, nsweb_core::defaults::MAX_DECODED_IMAGE_BYTES)
}

/// Parse with an upper bound on header plus first-frame size.
///
/// Compressed input is inflated only up to the end of the first frame, so a
/// small archive cannot expand into an unbounded buffer.
pub fn parse_with_limit(bytes: &[u8], limit: usize) -> Result<Volume, NiftiError> {
    if !bytes.starts_with(&[0x1f, 0x8b]) {
        let header = Header::parse(bytes)?;
        header.check_limit(limit)?;
        return header.decode(bytes);
    }

    let mut decoder = GzDecoder::new(bytes);
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    (&mut decoder)
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut buf)?;
    let header = Header::parse(&buf)?;
    header.check_limit(limit)?;

    buf.reserve(header.data_end - HEADER_SIZE);
    (&mut decoder)
        .take((header.data_end - HEADER_SIZE) as u64)
        .read_to_end(&mut buf)?;
    header.decode(&buf)
}

/// Read a `.nii` or `.nii.gz` file.
pub fn read_file(path: &Path) -> Result<Volume, NiftiError> {
    parse(&std::fs::read(path)?)
}

// =============================================================================
// WRITING
// =============================================================================

/// Encode a float32 little-endian single-file image (uncompressed).
pub fn encode(volume: &Volume) -> Vec<u8> {
    let mut out = vec![0u8; DATA_OFFSET];
    let put_i16 = |buf: &mut Vec<u8>, offset: usize, v: i16| {
        buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    };
    let put_f32 = |buf: &mut Vec<u8>, offset: usize, v: f32| {
        buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    };

    out[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());
    let [nx, ny, nz] = volume.grid.dims;
    let dim = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (n, v) in dim.iter().enumerate() {
        put_i16(&mut out, 40 + 2 * n, *v);
    }
    put_i16(&mut out, 70, DT_FLOAT32);
    put_i16(&mut out, 72, 32);

    let sizes = volume.grid.affine.voxel_sizes();
    let pixdim = [1.0, sizes[0], sizes[1], sizes[2], 1.0, 1.0, 1.0, 1.0];
    for (n, v) in pixdim.iter().enumerate() {
        put_f32(&mut out, 76 + 4 * n, *v as f32);
    }
    put_f32(&mut out, 108, DATA_OFFSET as f32);
    put_f32(&mut out, 112, 1.0);
    put_f32(&mut out, 116, 0.0);
    // xyzt_units: millimetres
    out[123] = 2;
    put_i16(&mut out, 254, 1);
    for (row, base) in [280usize, 296, 312].iter().enumerate() {
        for col in 0..4 {
            put_f32(&mut out, base + 4 * col, volume.grid.affine.0[row][col] as f32);
        }
    }
    out[344..348].copy_from_slice(MAGIC_SINGLE_FILE);

    out.reserve(volume.data.len() * 4);
    for v in &volume.data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Encode and gzip.
pub fn encode_gz(volume: &Volume) -> Result<Vec<u8>, NiftiError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&encode(volume))?;
    Ok(encoder.finish()?)
}

/// Write a volume, gzip-compressed when the path ends in `.gz`.
pub fn write_file(path: &Path, volume: &Volume) -> Result<(), NiftiError> {
    let gz = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("gz"));
    let bytes = if gz { encode_gz(volume)? } else { encode(volume) };
    std::fs::write(path, bytes)?;
    Ok(())
}
