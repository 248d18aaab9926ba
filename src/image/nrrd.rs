//! NRRD with attached data (`NRRD0001`..`NRRD0005`)

use super::{fmt_f64, identity, io_error, swap_bytes, PixelType, Volume};
use crate::error::ImageError;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

pub fn read(path: &Path) -> Result<Volume, ImageError> {
    let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
    parse(&bytes, path)
}

fn parse(bytes: &[u8], path: &Path) -> Result<Volume, ImageError> {
    let p = path.display().to_string();
    let header_err = |reason: String| ImageError::Header {
        path: p.clone(),
        reason,
    };
    let unsupported = |what: &'static str, value: &str| ImageError::Unsupported {
        path: p.clone(),
        what,
        value: value.to_string(),
    };

    let (fields, data_start) = split_header(bytes).ok_or_else(|| {
        header_err("missing NRRD magic or blank line after header".to_string())
    })?;

    let get = |key: &str| fields.get(key).map(String::as_str);
    let require = |key: &str| get(key).ok_or_else(|| header_err(format!("missing field '{key}'")));

    let kind = require("type")?;
    let pixel = pixel_type(kind).ok_or_else(|| unsupported("type", kind))?;
    let ndim: usize = require("dimension")?
        .trim()
        .parse()
        .map_err(|_| header_err("bad dimension".to_string()))?;
    let mut dims = parse_list::<usize>(require("sizes")?)
        .filter(|d| d.len() == ndim)
        .ok_or_else(|| header_err("sizes do not match dimension".to_string()))?;

    for key in ["data file", "datafile"] {
        if let Some(file) = get(key) {
            return Err(unsupported("detached data file", file));
        }
    }
    for key in ["line skip", "lineskip", "byte skip", "byteskip"] {
        if let Some(skip) = get(key) {
            if skip.trim() != "0" {
                return Err(unsupported(key_name(key), skip));
            }
        }
    }

    let encoding = get("encoding").unwrap_or("raw").trim().to_ascii_lowercase();
    let big_endian = match get("endian").map(|e| e.trim().to_ascii_lowercase()) {
        Some(e) if e == "big" => true,
        Some(e) if e == "little" => false,
        None if pixel.size() == 1 => false,
        None => return Err(header_err("missing field 'endian'".to_string())),
        Some(e) => return Err(unsupported("endian", &e)),
    };

    let (spacing, direction) = match get("space directions") {
        Some(value) => {
            let vectors = parse_vectors(value)
                .ok_or_else(|| header_err(format!("bad space directions '{value}'")))?;
            if vectors.len() != ndim {
                return Err(header_err("space directions do not match dimension".to_string()));
            }
            // Trailing size-1 axes without a direction (`kinds: list`) carry no geometry
            let mut spatial = ndim;
            while spatial > 0 && vectors[spatial - 1].is_none() && dims[spatial - 1] == 1 {
                spatial -= 1;
            }
            dims.truncate(spatial);
            let vectors = vectors
                .into_iter()
                .take(spatial)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| unsupported("non-spatial axis", value))?;
            directions_from_vectors(&vectors, spatial)
                .ok_or_else(|| header_err(format!("degenerate space directions '{value}'")))?
        }
        None => {
            let spacing = get("spacings")
                .and_then(parse_list::<f64>)
                .filter(|s| s.len() == ndim && s.iter().all(|v| v.is_finite() && *v > 0.0))
                .unwrap_or_else(|| vec![1.0; ndim]);
            (spacing, identity(ndim))
        }
    };

    let ndim = dims.len();
    let mut origin = match get("space origin") {
        Some(value) => parse_vectors(value)
            .and_then(|v| v.into_iter().next().flatten())
            .filter(|o| o.len() == ndim)
            .ok_or_else(|| header_err(format!("bad space origin '{value}'")))?,
        None => vec![0.0; ndim],
    };

    let mut direction = direction;
    if let Some(space) = get("space") {
        let signs = space_signs(space).ok_or_else(|| unsupported("space", space))?;
        for (r, sign) in signs.iter().enumerate().take(ndim) {
            origin[r] *= sign;
            for c in 0..ndim {
                direction[r * ndim + c] *= sign;
            }
        }
    }

    let payload = &bytes[data_start..];
    let mut data = match encoding.as_str() {
        "raw" => payload.to_vec(),
        "gzip" | "gz" => {
            let mut out = Vec::new();
            MultiGzDecoder::new(payload)
                .read_to_end(&mut out)
                .map_err(|e| io_error(path, e))?;
            out
        }
        other => return Err(unsupported("encoding", other)),
    };

    let expected = dims.iter().product::<usize>() * pixel.size();
    if data.len() < expected {
        return Err(ImageError::Truncated {
            path: p.clone(),
            expected,
            found: data.len(),
        });
    }
    data.truncate(expected);
    if big_endian {
        swap_bytes(&mut data, pixel.size());
    }

    Ok(Volume {
        dims,
        pixel,
        spacing,
        origin,
        direction,
        data,
    })
}

pub fn write(volume: &Volume, path: &Path) -> Result<(), ImageError> {
    let n = volume.ndim();
    let mut header = String::from("NRRD0004\n# Complete NRRD file format specification at:\n# http://teem.sourceforge.net/nrrd/format.html\n");
    // Writing to a String cannot fail
    let _ = writeln!(header, "type: {}", type_name(volume.pixel));
    let _ = writeln!(header, "dimension: {n}");
    if n == 3 {
        header.push_str("space: left-posterior-superior\n");
    } else {
        let _ = writeln!(header, "space dimension: {n}");
    }
    let sizes: Vec<String> = volume.dims.iter().map(ToString::to_string).collect();
    let _ = writeln!(header, "sizes: {}", sizes.join(" "));

    let vectors: Vec<String> = (0..n)
        .map(|c| {
            let v: Vec<String> = (0..n)
                .map(|r| fmt_f64(volume.direction_at(r, c) * volume.spacing[c]))
                .collect();
            format!("({})", v.join(","))
        })
        .collect();
    let _ = writeln!(header, "space directions: {}", vectors.join(" "));
    let _ = writeln!(header, "kinds: {}", vec!["domain"; n].join(" "));
    header.push_str("endian: little\nencoding: gzip\n");
    let origin: Vec<String> = volume.origin.iter().map(|v| fmt_f64(*v)).collect();
    let _ = writeln!(header, "space origin: ({})", origin.join(","));
    header.push('\n');

    let file = fs::File::create(path).map_err(|e| io_error(path, e))?;
    let mut writer = std::io::BufWriter::new(file);
    writer
        .write_all(header.as_bytes())
        .map_err(|e| io_error(path, e))?;
    let mut encoder = GzEncoder::new(writer, Compression::default());
    encoder
        .write_all(&volume.data)
        .map_err(|e| io_error(path, e))?;
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| io_error(path, e))
}

/// Header fields (lowercased keys) and the offset where data begins
fn split_header(bytes: &[u8]) -> Option<(HashMap<String, String>, usize)> {
    if !bytes.starts_with(b"NRRD") {
        return None;
    }

    let mut fields = HashMap::new();
    let mut pos = 0;
    let mut first = true;
    loop {
        let rel = bytes[pos..].iter().position(|b| *b == b'\n')?;
        let line = String::from_utf8_lossy(&bytes[pos..pos + rel]);
        let line = line.trim_end_matches('\r');
        pos += rel + 1;

        if first {
            first = false;
            continue;
        }
        if line.is_empty() {
            return Some((fields, pos));
        }
        if line.starts_with('#') || line.contains(":=") {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
}

fn key_name(key: &str) -> &'static str {
    if key.starts_with("line") {
        "line skip"
    } else {
        "byte skip"
    }
}

fn parse_list<T: std::str::FromStr>(value: &str) -> Option<Vec<T>> {
    value.split_whitespace().map(|t| t.parse().ok()).collect()
}

/// Parse `(a,b,c) none (d,e,f)`; `none` becomes `None`
fn parse_vectors(value: &str) -> Option<Vec<Option<Vec<f64>>>> {
    let mut out = Vec::new();
    let mut rest = value.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("none") {
            out.push(None);
            rest = after.trim_start();
        } else if rest.starts_with('(') {
            let close = rest.find(')')?;
            let inner = &rest[1..close];
            let values: Option<Vec<f64>> = inner.split(',').map(|t| t.trim().parse().ok()).collect();
            out.push(Some(values?));
            rest = rest[close + 1..].trim_start();
        } else {
            return None;
        }
    }
    Some(out)
}

/// Split axis vectors into spacing (norms) and unit direction columns
fn directions_from_vectors(vectors: &[Vec<f64>], n: usize) -> Option<(Vec<f64>, Vec<f64>)> {
    let mut spacing = Vec::with_capacity(n);
    let mut direction = vec![0.0; n * n];
    for (c, v) in vectors.iter().enumerate() {
        if v.len() != n {
            return None;
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return None;
        }
        for (r, x) in v.iter().enumerate() {
            direction[r * n + c] = x / norm;
        }
        spacing.push(norm);
    }
    Some((spacing, direction))
}

/// Per-row sign flips taking a NRRD space to LPS
fn space_signs(space: &str) -> Option<[f64; 3]> {
    match space.trim().to_ascii_lowercase().as_str() {
        "left-posterior-superior" | "lps" | "scanner-xyz" | "3d-right-handed" => {
            Some([1.0, 1.0, 1.0])
        }
        "right-anterior-superior" | "ras" => Some([-1.0, -1.0, 1.0]),
        "left-anterior-superior" | "las" => Some([1.0, -1.0, 1.0]),
        _ => None,
    }
}

fn pixel_type(name: &str) -> Option<PixelType> {
    let t = match name.trim() {
        "uchar" | "unsigned char" | "uint8" | "uint8_t" => PixelType::U8,
        "signed char" | "int8" | "int8_t" => PixelType::I8,
        "short" | "short int" | "signed short" | "signed short int" | "int16" | "int16_t" => {
            PixelType::I16
        }
        "ushort" | "unsigned short" | "unsigned short int" | "uint16" | "uint16_t" => {
            PixelType::U16
        }
        "int" | "signed int" | "int32" | "int32_t" => PixelType::I32,
        "uint" | "unsigned int" | "uint32" | "uint32_t" => PixelType::U32,
        "longlong" | "long long" | "long long int" | "signed long long"
        | "signed long long int" | "int64" | "int64_t" => PixelType::I64,
        "ulonglong" | "unsigned long long" | "unsigned long long int" | "uint64"
        | "uint64_t" => PixelType::U64,
        "float" => PixelType::F32,
        "double" => PixelType::F64,
        _ => return None,
    };
    Some(t)
}

const fn type_name(pixel: PixelType) -> &'static str {
    match pixel {
        PixelType::U8 => "unsigned char",
        PixelType::I8 => "signed char",
        PixelType::U16 => "unsigned short",
        PixelType::I16 => "short",
        PixelType::U32 => "unsigned int",
        PixelType::I32 => "int",
        PixelType::U64 => "unsigned long long int",
        PixelType::I64 => "long long int",
        PixelType::F32 => "float",
        PixelType::F64 => "double",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::testing::{assert_close, random_volume};
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read_preserves_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ct.nrrd");
        let volume = random_volume([7, 5, 3], PixelType::I16);

        write(&volume, &path).unwrap();
        let loaded = read(&path).unwrap();

        assert_eq!(loaded.dims, volume.dims);
        assert_eq!(loaded.pixel, volume.pixel);
        assert_eq!(loaded.data, volume.data);
        assert_close(&loaded.spacing, &volume.spacing, 1e-12);
        assert_close(&loaded.origin, &volume.origin, 0.0);
        assert_close(&loaded.direction, &volume.direction, 1e-12);
    }

    #[test]
    fn test_writer_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let volume = random_volume([4, 4, 4], PixelType::F32);
        write(&volume, &dir.path().join("a.nrrd")).unwrap();
        write(&volume, &dir.path().join("b.nrrd")).unwrap();
        assert_eq!(
            fs::read(dir.path().join("a.nrrd")).unwrap(),
            fs::read(dir.path().join("b.nrrd")).unwrap()
        );
    }

    #[test]
    fn test_read_raw_big_endian_ras() {
        let mut bytes = b"NRRD0004\n# comment\ntype: short\ndimension: 3\nspace: right-anterior-superior\n\
sizes: 2 1 1\nspace directions: (0.5,0,0) (0,0.5,0) (0,0,2)\nkinds: domain domain domain\n\
endian: big\nencoding: raw\nspace origin: (10,20,30)\nmeta:=ignored\n\n"
            .to_vec();
        bytes.extend_from_slice(&[0x01, 0x02, 0xFF, 0xFE]);

        let volume = parse(&bytes, Path::new("t.nrrd")).unwrap();
        assert_eq!(volume.dims, vec![2, 1, 1]);
        assert_eq!(volume.pixel, PixelType::I16);
        assert_eq!(volume.data, vec![0x02, 0x01, 0xFE, 0xFF]);
        assert_close(&volume.spacing, &[0.5, 0.5, 2.0], 0.0);
        assert_close(&volume.origin, &[-10.0, -20.0, 30.0], 0.0);
        assert_close(
            &volume.direction,
            &[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0],
            0.0,
        );
    }

    #[test]
    fn test_read_spacings_without_space() {
        let mut bytes =
            b"NRRD0001\ntype: uchar\ndimension: 2\nsizes: 2 2\nspacings: 0.3 0.6\nencoding: raw\n\n"
                .to_vec();
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        let volume = parse(&bytes, Path::new("t.nrrd")).unwrap();
        assert_close(&volume.spacing, &[0.3, 0.6], 0.0);
        assert_eq!(volume.direction, identity(2));
        assert_eq!(volume.origin, vec![0.0, 0.0]);
    }

    #[test]
    fn test_rejects_detached_and_truncated() {
        let detached = b"NRRD0004\ntype: uchar\ndimension: 1\nsizes: 4\ndata file: x.raw\n\n";
        assert!(matches!(
            parse(detached, Path::new("t.nrrd")),
            Err(ImageError::Unsupported { .. })
        ));

        let mut truncated =
            b"NRRD0004\ntype: uchar\ndimension: 2\nsizes: 4 4\nencoding: raw\n\n".to_vec();
        truncated.extend_from_slice(&[0; 3]);
        assert!(matches!(
            parse(&truncated, Path::new("t.nrrd")),
            Err(ImageError::Truncated { expected: 16, found: 3, .. })
        ));
    }

    #[test]
    fn test_read_4d_with_trailing_singleton() {
        let mut bytes =
            b"NRRD0004\ntype: uchar\ndimension: 4\nsizes: 2 2 2 1\nencoding: raw\n\n".to_vec();
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.nrrd");
        fs::write(&path, &bytes).unwrap();

        let volume = crate::image::read(&path).unwrap();
        assert_eq!(volume.dims, vec![2, 2, 2]);
        assert_eq!(volume.direction, identity(3));
        assert_eq!(volume.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_read_list_axis_without_direction() {
        let mut bytes = b"NRRD0004\ntype: uchar\ndimension: 4\nspace: left-posterior-superior\n\
sizes: 2 1 1 1\nspace directions: (0.5,0,0) (0,0.5,0) (0,0,2) none\nkinds: domain domain domain list\n\
encoding: raw\nspace origin: (1,2,3)\n\n"
            .to_vec();
        bytes.extend_from_slice(&[9, 8]);

        let volume = parse(&bytes, Path::new("t.nrrd")).unwrap();
        assert_eq!(volume.dims, vec![2, 1, 1]);
        assert_close(&volume.spacing, &[0.5, 0.5, 2.0], 0.0);
        assert_close(&volume.origin, &[1.0, 2.0, 3.0], 0.0);
        assert_eq!(volume.data, vec![9, 8]);
    }

    #[test]
    fn test_parse_vectors() {
        let v = parse_vectors("none (1, 0,0) (0,1,0)").unwrap();
        assert_eq!(v.len(), 3);
        assert!(v[0].is_none());
        assert_eq!(v[1].as_deref(), Some(&[1.0, 0.0, 0.0][..]));
        assert!(parse_vectors("(1,0").is_none());
        assert!(parse_vectors("(a,b,c)").is_none());
    }
}
