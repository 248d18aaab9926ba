//! NIfTI-1 single-file images (`.nii`, `.nii.gz`)
//!
//! Header and voxel I/O go through the `nifti` crate; this module only maps
//! between its header and [`Volume`]. NIfTI stores geometry in RAS; it is
//! converted to LPS on read and back on write. The sform is preferred over
//! the qform when both are set because it carries the affine verbatim.

use super::{identity, swap_bytes, PixelType, Volume};
use crate::error::ImageError;
use byteorder::{ByteOrder, LittleEndian};
use ndarray::{Array, IxDyn, ShapeBuilder};
use nifti::writer::WriterOptions;
use nifti::{Endianness, NiftiHeader, NiftiObject, ReaderOptions};
use std::path::Path;

const XFORM_SCANNER_ANAT: i16 = 1;
const UNITS_MM: u8 = 2;

// RAS <-> LPS flips the first two physical axes
const LPS_SIGNS: [f64; 3] = [-1.0, -1.0, 1.0];

pub fn read(path: &Path) -> Result<Volume, ImageError> {
    let object = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| nifti_error(path, e))?;
    let header = object.header().clone();
    let data = object.into_volume().into_raw_data();
    from_parts(&header, data, path)
}

/// Build a volume from a parsed header and the raw voxel bytes that follow it
fn from_parts(header: &NiftiHeader, mut data: Vec<u8>, path: &Path) -> Result<Volume, ImageError> {
    let p = path.display().to_string();

    let pixel = pixel_type(header.datatype).ok_or_else(|| ImageError::Unsupported {
        path: p.clone(),
        what: "datatype",
        value: header.datatype.to_string(),
    })?;

    let ndim = usize::from(header.dim[0]);
    if !(1..=7).contains(&ndim) {
        return Err(ImageError::Header {
            path: p,
            reason: format!("dim[0] = {ndim} out of range"),
        });
    }
    let dims: Vec<usize> = header.dim[1..=ndim].iter().map(|d| usize::from(*d)).collect();

    if header.scl_slope != 0.0 && !(header.scl_slope == 1.0 && header.scl_inter == 0.0) {
        tracing::warn!(
            "{}: scl_slope {} / scl_inter {} not applied; voxel values are kept raw",
            p,
            header.scl_slope,
            header.scl_inter
        );
    }

    let expected = dims.iter().product::<usize>() * pixel.size();
    if data.len() < expected {
        return Err(ImageError::Truncated {
            path: p,
            expected,
            found: data.len(),
        });
    }
    data.truncate(expected);
    if matches!(header.endianness, Endianness::Big) {
        swap_bytes(&mut data, pixel.size());
    }

    let (spacing, origin, direction) = geometry(header, dims.len());
    Ok(Volume {
        dims,
        pixel,
        spacing,
        origin,
        direction,
        data,
    })
}

/// Spacing, LPS origin and LPS direction for `n` axes
///
/// Axes past the third have no place in the affine; they get their pixdim
/// as spacing and an identity direction.
fn geometry(h: &NiftiHeader, n: usize) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    // 3x4 RAS affine: columns are axis vectors, last column the origin
    let affine: [[f64; 4]; 3] = if h.sform_code > 0 {
        [h.srow_x, h.srow_y, h.srow_z].map(|row| row.map(f64::from))
    } else if h.qform_code > 0 {
        qform_affine(h)
    } else {
        let mut a = [[0.0; 4]; 3];
        for (i, row) in a.iter_mut().enumerate() {
            row[i] = pixdim_or_one(h, i + 1);
        }
        a
    };

    let spatial = n.min(3);
    let mut spacing = Vec::with_capacity(n);
    let mut origin = vec![0.0; n];
    let mut direction = identity(n);
    for c in 0..spatial {
        let norm = (0..3).map(|r| affine[r][c] * affine[r][c]).sum::<f64>().sqrt();
        let norm = if norm > 0.0 { norm } else { 1.0 };
        for r in 0..spatial {
            direction[r * n + c] = LPS_SIGNS[r] * affine[r][c] / norm;
        }
        spacing.push(norm);
    }
    for c in spatial..n {
        spacing.push(pixdim_or_one(h, c + 1));
    }
    for (r, o) in origin.iter_mut().enumerate().take(spatial) {
        *o = LPS_SIGNS[r] * affine[r][3];
    }

    (spacing, origin, direction)
}

fn pixdim_or_one(h: &NiftiHeader, i: usize) -> f64 {
    let s = f64::from(h.pixdim[i].abs());
    if s > 0.0 {
        s
    } else {
        1.0
    }
}

fn qform_affine(h: &NiftiHeader) -> [[f64; 4]; 3] {
    let [b, c, d] = [h.quatern_b, h.quatern_c, h.quatern_d].map(f64::from);
    let a2 = 1.0 - (b * b + c * c + d * d);
    let (a, b, c, d) = if a2 < 1e-7 {
        let norm = (b * b + c * c + d * d).sqrt();
        (0.0, b / norm, c / norm, d / norm)
    } else {
        (a2.sqrt(), b, c, d)
    };

    let rot = [
        [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
        [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
        [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
    ];
    let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let scale = [
        f64::from(h.pixdim[1]).abs(),
        f64::from(h.pixdim[2]).abs(),
        f64::from(h.pixdim[3]).abs() * qfac,
    ];
    let offset = [h.quatern_x, h.quatern_y, h.quatern_z].map(f64::from);

    let mut affine = [[0.0; 4]; 3];
    for r in 0..3 {
        for c in 0..3 {
            affine[r][c] = rot[r][c] * scale[c];
        }
        affine[r][3] = offset[r];
    }
    affine
}

/// Quaternion (b, c, d) and qfac for a rotation, as nifti1_io computes it
fn quaternion(m: &[[f64; 3]; 3]) -> ([f64; 3], f64) {
    let mut r = *m;
    let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
        - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
        + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
    let qfac = if det < 0.0 {
        for row in &mut r {
            row[2] = -row[2];
        }
        -1.0
    } else {
        1.0
    };

    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    if trace > 0.5 {
        let a = 0.5 * trace.sqrt();
        let b = 0.25 * (r[2][1] - r[1][2]) / a;
        let c = 0.25 * (r[0][2] - r[2][0]) / a;
        let d = 0.25 * (r[1][0] - r[0][1]) / a;
        return ([b, c, d], qfac);
    }

    let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
    let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
    let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
    let (a, bcd) = if xd > 1.0 {
        let b = 0.5 * xd.sqrt();
        (
            0.25 * (r[2][1] - r[1][2]) / b,
            [b, 0.25 * (r[0][1] + r[1][0]) / b, 0.25 * (r[0][2] + r[2][0]) / b],
        )
    } else if yd > 1.0 {
        let c = 0.5 * yd.sqrt();
        (
            0.25 * (r[0][2] - r[2][0]) / c,
            [0.25 * (r[0][1] + r[1][0]) / c, c, 0.25 * (r[1][2] + r[2][1]) / c],
        )
    } else {
        let d = 0.5 * zd.sqrt();
        (
            0.25 * (r[1][0] - r[0][1]) / d,
            [0.25 * (r[0][2] + r[2][0]) / d, 0.25 * (r[1][2] + r[2][1]) / d, d],
        )
    };
    // Keep the scalar part non-negative so it can be recovered from (b, c, d)
    if a < 0.0 {
        (bcd.map(|v| -v), qfac)
    } else {
        (bcd, qfac)
    }
}

pub fn write(volume: &Volume, path: &Path) -> Result<(), ImageError> {
    let header = header_for(volume, path)?;
    let options = WriterOptions::new(path).reference_header(&header);
    let data = &volume.data;

    // Fortran order keeps axis 0 fastest on disk, matching `Volume::data`
    macro_rules! write_as {
        ($values:expr) => {{
            let array = Array::from_shape_vec(IxDyn(&volume.dims).f(), $values).map_err(|e| {
                ImageError::Header {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            options.write_nifti(&array)
        }};
    }

    let written = match volume.pixel {
        PixelType::U8 => write_as!(data.clone()),
        PixelType::I8 => write_as!(data.iter().map(|b| i8::from_le_bytes([*b])).collect::<Vec<_>>()),
        PixelType::U16 => write_as!(decode(data, LittleEndian::read_u16_into)),
        PixelType::I16 => write_as!(decode(data, LittleEndian::read_i16_into)),
        PixelType::U32 => write_as!(decode(data, LittleEndian::read_u32_into)),
        PixelType::I32 => write_as!(decode(data, LittleEndian::read_i32_into)),
        PixelType::U64 => write_as!(decode(data, LittleEndian::read_u64_into)),
        PixelType::I64 => write_as!(decode(data, LittleEndian::read_i64_into)),
        PixelType::F32 => write_as!(decode(data, LittleEndian::read_f32_into)),
        PixelType::F64 => write_as!(decode(data, LittleEndian::read_f64_into)),
    };
    written.map_err(|e| nifti_error(path, e))
}

/// Header carrying the volume's geometry as both sform and qform
fn header_for(volume: &Volume, path: &Path) -> Result<NiftiHeader, ImageError> {
    if let Some(d) = volume.dims.iter().find(|d| **d > i16::MAX as usize) {
        return Err(ImageError::Unsupported {
            path: path.display().to_string(),
            what: "axis length for NIfTI-1",
            value: d.to_string(),
        });
    }

    // Embed in 3-D and build the RAS affine
    let n = volume.ndim().min(3);
    let mut spacing3 = [1.0f64; 3];
    let mut origin3 = [0.0f64; 3];
    let mut dir3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    for r in 0..n {
        spacing3[r] = volume.spacing[r];
        origin3[r] = volume.origin[r];
        for c in 0..n {
            dir3[r][c] = volume.direction_at(r, c);
        }
    }
    let mut rot = [[0.0f64; 3]; 3];
    for r in 0..3 {
        for c in 0..3 {
            rot[r][c] = LPS_SIGNS[r] * dir3[r][c];
        }
    }
    let (quatern, qfac) = quaternion(&rot);
    let offset = [0, 1, 2].map(|r| (LPS_SIGNS[r] * origin3[r]) as f32);
    let srow = |r: usize| -> [f32; 4] {
        [
            (rot[r][0] * spacing3[0]) as f32,
            (rot[r][1] * spacing3[1]) as f32,
            (rot[r][2] * spacing3[2]) as f32,
            offset[r],
        ]
    };

    let mut pixdim = [1.0f32; 8];
    pixdim[0] = qfac as f32;
    for (p, s) in pixdim[1..4].iter_mut().zip(spacing3) {
        *p = s as f32;
    }

    Ok(NiftiHeader {
        pixdim,
        scl_slope: 1.0,
        scl_inter: 0.0,
        xyzt_units: UNITS_MM,
        qform_code: XFORM_SCANNER_ANAT,
        sform_code: XFORM_SCANNER_ANAT,
        quatern_b: quatern[0] as f32,
        quatern_c: quatern[1] as f32,
        quatern_d: quatern[2] as f32,
        quatern_x: offset[0],
        quatern_y: offset[1],
        quatern_z: offset[2],
        srow_x: srow(0),
        srow_y: srow(1),
        srow_z: srow(2),
        endianness: Endianness::Little,
        ..NiftiHeader::default()
    })
}

/// Little-endian voxel bytes as typed values
fn decode<T: Copy + Default>(data: &[u8], read_into: fn(&[u8], &mut [T])) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    let mut values = vec![T::default(); data.len() / size];
    read_into(&data[..values.len() * size], &mut values);
    values
}

fn nifti_error(path: &Path, error: nifti::NiftiError) -> ImageError {
    ImageError::Nifti {
        path: path.display().to_string(),
        reason: error.to_string(),
    }
}

const fn pixel_type(code: i16) -> Option<PixelType> {
    match code {
        2 => Some(PixelType::U8),
        4 => Some(PixelType::I16),
        8 => Some(PixelType::I32),
        16 => Some(PixelType::F32),
        64 => Some(PixelType::F64),
        256 => Some(PixelType::I8),
        512 => Some(PixelType::U16),
        768 => Some(PixelType::U32),
        1024 => Some(PixelType::I64),
        1280 => Some(PixelType::U64),
        _ => None,
    }
}
