//! Minimal reader and writer for NumPy `.npy` files.
//!
//! Only little-endian, C-ordered numeric arrays are read. Writing covers plain
//! numeric arrays and the labelled probability table produced by a run.

use super::Result;
use ndarray::{ArrayD, IxDyn};
use std::io::{Read, Write};

const MAGIC: &[u8; 6] = b"\x93NUMPY";
const HEADER_ALIGNMENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F4,
    F8,
    I4,
    I8,
    U4,
    U8,
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self> {
        match descr {
            "<f4" => Ok(Dtype::F4),
            "<f8" => Ok(Dtype::F8),
            "<i4" => Ok(Dtype::I4),
            "<i8" => Ok(Dtype::I8),
            "<u4" => Ok(Dtype::U4),
            "<u8" => Ok(Dtype::U8),
            _ => Err(format!("Unsupported npy dtype: {}", descr)),
        }
    }

    fn size(self) -> usize {
        match self {
            Dtype::F4 | Dtype::I4 | Dtype::U4 => 4,
            Dtype::F8 | Dtype::I8 | Dtype::U8 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Dtype::F4 | Dtype::F8)
    }
}

#[derive(Debug, PartialEq)]
struct Header {
    dtype: Dtype,
    fortran_order: bool,
    shape: Vec<usize>,
}

impl Header {
    fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

pub fn read_f32<R: Read>(mut reader: R) -> Result<ArrayD<f32>> {
    let header = read_header(&mut reader)?;
    if !header.dtype.is_float() {
        return Err(format!(
            "Expected a floating point array, found {:?}",
            header.dtype
        ));
    }
    let bytes = read_payload(&mut reader, &header)?;
    let data = match header.dtype {
        Dtype::F4 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(le_bytes(c)))
            .collect(),
        _ => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(le_bytes(c)) as f32)
            .collect(),
    };
    into_array(header.shape, data)
}

pub fn read_i64<R: Read>(mut reader: R) -> Result<ArrayD<i64>> {
    let header = read_header(&mut reader)?;
    if header.dtype.is_float() {
        return Err(format!(
            "Expected an integer array, found {:?}",
            header.dtype
        ));
    }
    let bytes = read_payload(&mut reader, &header)?;
    let data = match header.dtype {
        Dtype::I4 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(le_bytes(c)) as i64)
            .collect(),
        Dtype::U4 => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(le_bytes(c)) as i64)
            .collect(),
        Dtype::I8 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(le_bytes(c)))
            .collect(),
        _ => bytes
            .chunks_exact(8)
            .map(|c| {
                let value = u64::from_le_bytes(le_bytes(c));
                i64::try_from(value).map_err(|_| format!("Value {} overflows i64", value))
            })
            .collect::<Result<Vec<i64>>>()?,
    };
    into_array(header.shape, data)
}

pub fn write_f32<W: Write>(writer: &mut W, shape: &[usize], data: &[f32]) -> Result<()> {
    check_element_count(shape, data.len())?;
    write_header(writer, "'<f4'", shape)?;
    let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
    write_bytes(writer, &bytes)
}

pub fn write_f64<W: Write>(writer: &mut W, shape: &[usize], data: &[f64]) -> Result<()> {
    check_element_count(shape, data.len())?;
    write_header(writer, "'<f8'", shape)?;
    let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
    write_bytes(writer, &bytes)
}

pub fn write_i64<W: Write>(writer: &mut W, shape: &[usize], data: &[i64]) -> Result<()> {
    check_element_count(shape, data.len())?;
    write_header(writer, "'<i8'", shape)?;
    let bytes = data.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>();
    write_bytes(writer, &bytes)
}

/// Writes rows of `(label, values)` as a structured array with the fields
/// `sample_id` (fixed-width unicode) and `probabilities` (`<f8` sub-array).
///
/// Every row must carry the same number of values.
pub fn write_labelled_rows<W: Write>(writer: &mut W, rows: &[(&str, &[f64])]) -> Result<()> {
    let width = rows
        .iter()
        .map(|(label, _)| label.chars().count())
        .max()
        .unwrap_or(0)
        .max(1);
    let num_values = rows.first().map_or(0, |(_, values)| values.len());
    if let Some((label, values)) = rows.iter().find(|(_, v)| v.len() != num_values) {
        return Err(format!(
            "Row {} has {} values, expected {}",
            label,
            values.len(),
            num_values
        ));
    }

    let descr = format!(
        "[('sample_id', '<U{}'), ('probabilities', '<f8', ({},))]",
        width, num_values
    );
    write_header(writer, &descr, &[rows.len()])?;

    let mut bytes = Vec::with_capacity(rows.len() * (4 * width + 8 * num_values));
    for (label, values) in rows {
        let mut chars = 0;
        for c in label.chars() {
            bytes.extend_from_slice(&(c as u32).to_le_bytes());
            chars += 1;
        }
        bytes.resize(bytes.len() + 4 * (width - chars), 0);
        for value in values.iter() {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }
    write_bytes(writer, &bytes)
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    let mut magic = [0u8; 6];
    reader
        .read_exact(&mut magic)
        .map_err(|e| format!("Failed to read npy magic string: {}", e))?;
    if &magic != MAGIC {
        return Err("Not an npy file (invalid magic string)".to_string());
    }

    let mut version = [0u8; 2];
    reader
        .read_exact(&mut version)
        .map_err(|e| format!("Failed to read npy version: {}", e))?;
    let header_len = match version[0] {
        1 => {
            let mut len = [0u8; 2];
            reader
                .read_exact(&mut len)
                .map_err(|e| format!("Failed to read npy header length: {}", e))?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader
                .read_exact(&mut len)
                .map_err(|e| format!("Failed to read npy header length: {}", e))?;
            u32::from_le_bytes(len) as usize
        }
        major => {
            return Err(format!(
                "Unsupported npy format version {}.{}",
                major, version[1]
            ))
        }
    };

    let mut text = vec![0u8; header_len];
    reader
        .read_exact(&mut text)
        .map_err(|e| format!("Truncated npy header: {}", e))?;
    let text = String::from_utf8(text).map_err(|e| format!("Invalid npy header: {}", e))?;
    parse_header(&text)
}

fn parse_header(text: &str) -> Result<Header> {
    let descr = dict_value(text, "descr")?;
    let descr = descr.trim_matches(|c| c == '\'' || c == '"');
    let dtype = Dtype::parse(descr)?;

    let fortran_order = match dict_value(text, "fortran_order")? {
        "False" => false,
        "True" => true,
        other => return Err(format!("Invalid fortran_order value: {}", other)),
    };

    let shape = parse_shape(dict_value(text, "shape")?)?;

    Ok(Header {
        dtype,
        fortran_order,
        shape,
    })
}

fn dict_value<'a>(text: &'a str, key: &str) -> Result<&'a str> {
    let pattern = format!("'{}':", key);
    let start = text
        .find(&pattern)
        .ok_or_else(|| format!("npy header is missing the '{}' key", key))?
        + pattern.len();
    let rest = &text[start..];
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' | '}' if depth == 0 => return Ok(rest[..i].trim()),
            _ => {}
        }
    }
    Err(format!("Malformed npy header: {}", text.trim()))
}

fn parse_shape(value: &str) -> Result<Vec<usize>> {
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.strip_suffix(')'))
        .ok_or_else(|| format!("Invalid npy shape: {}", value))?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|_| format!("Invalid npy shape: {}", value))
        })
        .collect()
}

fn read_payload<R: Read>(reader: &mut R, header: &Header) -> Result<Vec<u8>> {
    if header.fortran_order {
        return Err("Fortran-ordered npy arrays are not supported".to_string());
    }
    let mut bytes = vec![0u8; header.num_elements() * header.dtype.size()];
    reader.read_exact(&mut bytes).map_err(|e| {
        format!(
            "Truncated npy payload, expected {} bytes: {}",
            bytes.len(),
            e
        )
    })?;
    Ok(bytes)
}

fn into_array<T>(shape: Vec<usize>, data: Vec<T>) -> Result<ArrayD<T>> {
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|e| e.to_string())
}

fn le_bytes<const N: usize>(chunk: &[u8]) -> [u8; N] {
    let mut bytes = [0u8; N];
    bytes.copy_from_slice(chunk);
    bytes
}

fn check_element_count(shape: &[usize], len: usize) -> Result<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(format!(
            "Shape {:?} requires {} elements, got {}",
            shape, expected, len
        ));
    }
    Ok(())
}

fn format_shape(shape: &[usize]) -> String {
    match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn write_header<W: Write>(writer: &mut W, descr: &str, shape: &[usize]) -> Result<()> {
    let dict = format!(
        "{{'descr': {}, 'fortran_order': False, 'shape': {}, }}",
        descr,
        format_shape(shape)
    );

    // Preamble is magic + version + header length; the header ends with '\n'.
    let padded_len = |preamble: usize| {
        let unpadded = preamble + dict.len() + 1;
        dict.len() + 1 + (HEADER_ALIGNMENT - unpadded % HEADER_ALIGNMENT) % HEADER_ALIGNMENT
    };

    let mut preamble = Vec::with_capacity(12);
    preamble.extend_from_slice(MAGIC);
    let header_len = padded_len(10);
    let header_len = if let Ok(len) = u16::try_from(header_len) {
        preamble.extend_from_slice(&[1, 0]);
        preamble.extend_from_slice(&len.to_le_bytes());
        header_len
    } else {
        let header_len = padded_len(12);
        let len = u32::try_from(header_len).map_err(|_| "npy header too large".to_string())?;
        preamble.extend_from_slice(&[2, 0]);
        preamble.extend_from_slice(&len.to_le_bytes());
        header_len
    };

    let mut header = dict.into_bytes();
    header.resize(header_len - 1, b' ');
    header.push(b'\n');

    write_bytes(writer, &preamble)?;
    write_bytes(writer, &header)
}

fn write_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| format!("Failed to write npy data: {}", e))
}
