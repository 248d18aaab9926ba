//! Single-file MetaImage (`.mha`)

use super::{fmt_f64, identity, io_error, swap_bytes, PixelType, Volume};
use crate::error::ImageError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
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

    let (fields, data_start) = split_header(bytes)
        .ok_or_else(|| header_err("no ElementDataFile line".to_string()))?;
    let get = |key: &str| fields.get(key).map(String::as_str);
    let require = |key: &str| get(key).ok_or_else(|| header_err(format!("missing {key}")));

    let data_file = require("elementdatafile")?;
    if !data_file.eq_ignore_ascii_case("LOCAL") {
        return Err(unsupported("detached data file", data_file));
    }
    if let Some(object) = get("objecttype") {
        if !object.eq_ignore_ascii_case("Image") {
            return Err(unsupported("ObjectType", object));
        }
    }
    if let Some(channels) = get("elementnumberofchannels") {
        if channels.trim() != "1" {
            return Err(unsupported("ElementNumberOfChannels", channels));
        }
    }
    if let Some(size) = get("headersize") {
        if size.trim() != "0" {
            return Err(unsupported("HeaderSize", size));
        }
    }

    let kind = require("elementtype")?;
    let pixel = pixel_type(kind).ok_or_else(|| unsupported("ElementType", kind))?;

    let dims = parse_list::<usize>(require("dimsize")?)
        .ok_or_else(|| header_err("bad DimSize".to_string()))?;
    let ndim = match get("ndims") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| header_err("bad NDims".to_string()))?,
        None => dims.len(),
    };
    if dims.len() != ndim {
        return Err(header_err("DimSize does not match NDims".to_string()));
    }

    let spacing = get("elementspacing")
        .or_else(|| get("elementsize"))
        .map(|v| {
            parse_list::<f64>(v)
                .filter(|s| s.len() == ndim)
                .ok_or_else(|| header_err(format!("bad ElementSpacing '{v}'")))
        })
        .transpose()?
        .unwrap_or_else(|| vec![1.0; ndim]);

    let origin = get("offset")
        .or_else(|| get("origin"))
        .or_else(|| get("position"))
        .map(|v| {
            parse_list::<f64>(v)
                .filter(|o| o.len() == ndim)
                .ok_or_else(|| header_err(format!("bad Offset '{v}'")))
        })
        .transpose()?
        .unwrap_or_else(|| vec![0.0; ndim]);

    // Row i of TransformMatrix is the direction of axis i
    let direction = match get("transformmatrix")
        .or_else(|| get("rotation"))
        .or_else(|| get("orientation"))
    {
        Some(v) => {
            let m = parse_list::<f64>(v)
                .filter(|m| m.len() == ndim * ndim)
                .ok_or_else(|| header_err(format!("bad TransformMatrix '{v}'")))?;
            transpose(&m, ndim)
        }
        None => identity(ndim),
    };

    let big_endian = get("binarydatabyteordermsb")
        .or_else(|| get("elementbyteordermsb"))
        .is_some_and(is_true);
    let compressed = get("compresseddata").is_some_and(is_true);

    let payload = &bytes[data_start..];
    let mut data = if compressed {
        let mut out = Vec::new();
        ZlibDecoder::new(payload)
            .read_to_end(&mut out)
            .map_err(|e| io_error(path, e))?;
        out
    } else {
        payload.to_vec()
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

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&volume.data)
        .map_err(|e| io_error(path, e))?;
    let compressed = encoder.finish().map_err(|e| io_error(path, e))?;

    let join = |values: &[f64]| {
        values
            .iter()
            .map(|v| fmt_f64(*v))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let mut header = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(header, "ObjectType = Image");
    let _ = writeln!(header, "NDims = {n}");
    let _ = writeln!(header, "BinaryData = True");
    let _ = writeln!(header, "BinaryDataByteOrderMSB = False");
    let _ = writeln!(header, "CompressedData = True");
    let _ = writeln!(header, "CompressedDataSize = {}", compressed.len());
    let _ = writeln!(header, "TransformMatrix = {}", join(&transpose(&volume.direction, n)));
    let _ = writeln!(header, "Offset = {}", join(&volume.origin));
    let _ = writeln!(header, "CenterOfRotation = {}", join(&vec![0.0; n]));
    let _ = writeln!(header, "ElementSpacing = {}", join(&volume.spacing));
    let sizes: Vec<String> = volume.dims.iter().map(ToString::to_string).collect();
    let _ = writeln!(header, "DimSize = {}", sizes.join(" "));
    let _ = writeln!(header, "ElementType = {}", type_name(volume.pixel));
    let _ = writeln!(header, "ElementDataFile = LOCAL");

    let mut file = fs::File::create(path).map_err(|e| io_error(path, e))?;
    file.write_all(header.as_bytes())
        .and_then(|()| file.write_all(&compressed))
        .map_err(|e| io_error(path, e))
}

/// Header fields (lowercased keys) and the offset where data begins
///
/// `ElementDataFile` is always the last header line.
fn split_header(bytes: &[u8]) -> Option<(HashMap<String, String>, usize)> {
    let mut fields = HashMap::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let rel = bytes[pos..].iter().position(|b| *b == b'\n')?;
        let line = String::from_utf8_lossy(&bytes[pos..pos + rel]);
        pos += rel + 1;

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let done = key == "elementdatafile";
        fields.insert(key, value.trim().to_string());
        if done {
            return Some((fields, pos));
        }
    }
    None
}

fn parse_list<T: std::str::FromStr>(value: &str) -> Option<Vec<T>> {
    value.split_whitespace().map(|t| t.parse().ok()).collect()
}

fn is_true(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

fn transpose(m: &[f64], n: usize) -> Vec<f64> {
    let mut t = vec![0.0; n * n];
    for r in 0..n {
        for c in 0..n {
            t[c * n + r] = m[r * n + c];
        }
    }
    t
}

fn pixel_type(name: &str) -> Option<PixelType> {
    let t = match name.trim().to_ascii_uppercase().as_str() {
        "MET_UCHAR" => PixelType::U8,
        "MET_CHAR" => PixelType::I8,
        "MET_USHORT" => PixelType::U16,
        "MET_SHORT" => PixelType::I16,
        "MET_UINT" | "MET_ULONG" => PixelType::U32,
        "MET_INT" | "MET_LONG" => PixelType::I32,
        "MET_ULONG_LONG" => PixelType::U64,
        "MET_LONG_LONG" => PixelType::I64,
        "MET_FLOAT" => PixelType::F32,
        "MET_DOUBLE" => PixelType::F64,
        _ => return None,
    };
    Some(t)
}

const fn type_name(pixel: PixelType) -> &'static str {
    match pixel {
        PixelType::U8 => "MET_UCHAR",
        PixelType::I8 => "MET_CHAR",
        PixelType::U16 => "MET_USHORT",
        PixelType::I16 => "MET_SHORT",
        PixelType::U32 => "MET_UINT",
        PixelType::I32 => "MET_INT",
        PixelType::U64 => "MET_ULONG_LONG",
        PixelType::I64 => "MET_LONG_LONG",
        PixelType::F32 => "MET_FLOAT",
        PixelType::F64 => "MET_DOUBLE",
    }
}
