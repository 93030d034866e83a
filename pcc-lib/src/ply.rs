//! PLY file collaborator: reads a [`PointCloud`] from an ascii or
//! binary-little-endian PLY file and writes one back.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::str;

use foldhash::HashMap;
use foldhash::HashMapExt;

use crate::cloud::PointCloud;
use crate::error::Error;

#[derive(Debug, Clone)]
pub struct PropertyNameMap {
    pub position: [String; 3],
    pub color: [String; 3],
}

impl Default for PropertyNameMap {
    fn default() -> Self {
        PropertyNameMap {
            position: ["x".to_string(), "y".to_string(), "z".to_string()],
            color: ["red".to_string(), "green".to_string(), "blue".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlyFormat {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl ScalarType {
    fn parse(name: &[u8]) -> Option<Self> {
        match name {
            b"char" | b"int8" => Some(ScalarType::I8),
            b"uchar" | b"uint8" => Some(ScalarType::U8),
            b"short" | b"int16" => Some(ScalarType::I16),
            b"ushort" | b"uint16" => Some(ScalarType::U16),
            b"int" | b"int32" => Some(ScalarType::I32),
            b"uint" | b"uint32" => Some(ScalarType::U32),
            b"float" | b"float32" => Some(ScalarType::F32),
            b"double" | b"float64" => Some(ScalarType::F64),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::F64 => 8,
        }
    }
}

#[inline]
fn next_line<'b>(buffer: &'b [u8], offset: &mut usize) -> Option<&'b [u8]> {
    if *offset >= buffer.len() {
        return None;
    }
    let start = *offset;

    let line = match memchr::memchr(b'\n', &buffer[*offset..]) {
        Some(pos) => {
            *offset = start + pos + 1;
            &buffer[start..start + pos]
        }
        None => {
            *offset = buffer.len();
            &buffer[start..]
        }
    };

    // Tolerate CRLF line endings.
    match line.last() {
        Some(b'\r') => Some(&line[..line.len() - 1]),
        _ => Some(line),
    }
}

#[inline(always)]
fn idx_of(map: &HashMap<&str, usize>, name: &str) -> Result<usize, Error> {
    map.get(name)
        .cloned()
        .ok_or_else(|| Error::PlyParse(format!("Missing required property: {}", name)))
}

fn le_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes.try_into().map_err(|_| {
        Error::PlyParse("Binary field is shorter than its declared type".to_string())
    })
}

fn scalar_to_f64(ty: ScalarType, bytes: &[u8]) -> Result<f64, Error> {
    let value = match ty {
        ScalarType::I8 => bytes[0] as i8 as f64,
        ScalarType::U8 => bytes[0] as f64,
        ScalarType::I16 => i16::from_le_bytes(le_array(bytes)?) as f64,
        ScalarType::U16 => u16::from_le_bytes(le_array(bytes)?) as f64,
        ScalarType::I32 => i32::from_le_bytes(le_array(bytes)?) as f64,
        ScalarType::U32 => u32::from_le_bytes(le_array(bytes)?) as f64,
        ScalarType::F32 => f32::from_le_bytes(le_array(bytes)?) as f64,
        ScalarType::F64 => f64::from_le_bytes(le_array(bytes)?),
    };
    Ok(value)
}

fn parse_count(bytes: &[u8]) -> Result<usize, Error> {
    let s = str::from_utf8(bytes)
        .map_err(|e| Error::PlyParse(format!("UTF-8 error: {}", e)))?
        .trim();
    s.parse()
        .map_err(|e| Error::PlyParse(format!("Parse error: {}", e)))
}

/// Reads one point cloud from a PLY file, multiplying every position by
/// `scale`.
pub fn read(path: &Path, names: &PropertyNameMap, scale: f64) -> Result<PointCloud, Error> {
    let data = fs::read(path).map_err(Error::Io)?;
    parse(&data, names, scale)
}

fn parse(data: &[u8], names: &PropertyNameMap, scale: f64) -> Result<PointCloud, Error> {
    let mut offset = 0;

    let line1 = next_line(data, &mut offset)
        .ok_or_else(|| Error::PlyParse("No 'ply' line".to_string()))?;
    if line1 != b"ply" {
        return Err(Error::PlyParse(
            "Not a .ply file (missing 'ply' header)".to_string(),
        ));
    }

    let line2 = next_line(data, &mut offset)
        .ok_or_else(|| Error::PlyParse("Missing format line".to_string()))?;
    let format = match line2 {
        b"format ascii 1.0" => PlyFormat::Ascii,
        b"format binary_little_endian 1.0" => PlyFormat::BinaryLittleEndian,
        _ => {
            return Err(Error::PlyParse(
                "Unsupported .ply format (only ascii 1.0 and binary_little_endian 1.0)".to_string(),
            ))
        }
    };

    let mut vertex_count: Option<usize> = None;
    let mut properties: Vec<(&str, ScalarType)> = Vec::new();
    let mut in_vertex_element = false;
    loop {
        let line = next_line(data, &mut offset)
            .ok_or_else(|| Error::PlyParse("No 'end_header' found before EOF".to_string()))?;

        if line.starts_with(b"end_header") {
            break;
        }
        if line.starts_with(b"comment") || line.starts_with(b"obj_info") {
            continue;
        }

        if let Some(rest) = line.strip_prefix(b"element ") {
            if let Some(count) = rest.strip_prefix(b"vertex ") {
                if vertex_count.is_some() {
                    return Err(Error::PlyParse(
                        "Duplicate 'element vertex' definition".to_string(),
                    ));
                }
                vertex_count = Some(parse_count(count)?);
                in_vertex_element = true;
            } else {
                if vertex_count.is_none() {
                    return Err(Error::PlyParse(
                        "The first element must be 'vertex'".to_string(),
                    ));
                }
                // Rows of later elements follow the vertex data; their
                // declarations are irrelevant here.
                in_vertex_element = false;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix(b"property ") {
            if !in_vertex_element {
                if vertex_count.is_none() {
                    return Err(Error::PlyParse(
                        "Property declared before any element".to_string(),
                    ));
                }
                continue;
            }
            if rest.starts_with(b"list") {
                return Err(Error::PlyParse(
                    "List properties are not supported on the vertex element".to_string(),
                ));
            }
            let space = memchr::memchr(b' ', rest).ok_or_else(|| {
                Error::PlyParse(format!(
                    "Unsupported property line: {}",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let ty = ScalarType::parse(&rest[..space]).ok_or_else(|| {
                Error::PlyParse(format!(
                    "Unsupported property type: {}",
                    String::from_utf8_lossy(&rest[..space])
                ))
            })?;
            let name = str::from_utf8(&rest[space + 1..])
                .map_err(|e| Error::PlyParse(format!("UTF-8 error in property name: {}", e)))?
                .trim();
            properties.push((name, ty));
            continue;
        }

        return Err(Error::PlyParse(format!(
            "Unsupported header line: {}",
            String::from_utf8_lossy(line)
        )));
    }

    let vertex_count = vertex_count
        .ok_or_else(|| Error::PlyParse("Missing 'element vertex' definition".to_string()))?;
    if vertex_count == 0 {
        return Ok(PointCloud::default());
    }

    let mut field_map: HashMap<&str, usize> = HashMap::with_capacity(properties.len());
    for (i, &(name, _)) in properties.iter().enumerate() {
        field_map.insert(name, i);
    }

    let position = [
        idx_of(&field_map, &names.position[0])?,
        idx_of(&field_map, &names.position[1])?,
        idx_of(&field_map, &names.position[2])?,
    ];

    let present: Vec<usize> = names
        .color
        .iter()
        .filter_map(|n| field_map.get(n.as_str()).cloned())
        .collect();
    let color = match present.len() {
        0 => None,
        3 => {
            for &idx in &present {
                if properties[idx].1 != ScalarType::U8 {
                    return Err(Error::PlyParse(format!(
                        "Colour property '{}' must be of type uchar",
                        properties[idx].0
                    )));
                }
            }
            Some([present[0], present[1], present[2]])
        }
        _ => {
            return Err(Error::PlyParse(
                "Colour properties must be either all present or all absent".to_string(),
            ))
        }
    };

    let body = &data[offset..];
    match format {
        PlyFormat::Ascii => parse_ascii(body, vertex_count, &properties, position, color, scale),
        PlyFormat::BinaryLittleEndian => {
            parse_binary(body, vertex_count, &properties, position, color, scale)
        }
    }
}

fn parse_binary(
    body: &[u8],
    vertex_count: usize,
    properties: &[(&str, ScalarType)],
    position: [usize; 3],
    color: Option<[usize; 3]>,
    scale: f64,
) -> Result<PointCloud, Error> {
    let mut field_offsets = Vec::with_capacity(properties.len());
    let mut stride = 0;
    for (_, ty) in properties {
        field_offsets.push(stride);
        stride += ty.size();
    }

    let expected = vertex_count
        .checked_mul(stride)
        .ok_or_else(|| Error::PlyParse("Overflow in byte calculation".to_string()))?;
    if body.len() < expected {
        return Err(Error::PlyParse(format!(
            "Binary data is too short, need {} bytes, have {}",
            expected,
            body.len()
        )));
    }

    let mut positions = Vec::with_capacity(vertex_count);
    let mut colors = color.map(|_| Vec::with_capacity(vertex_count));
    let mut cursor = 0;
    for _ in 0..vertex_count {
        let row = &body[cursor..cursor + stride];

        let mut p = [0f64; 3];
        for (axis, value) in p.iter_mut().enumerate() {
            let idx = position[axis];
            let ty = properties[idx].1;
            let start = field_offsets[idx];
            *value = scalar_to_f64(ty, &row[start..start + ty.size()])? * scale;
        }
        positions.push(p);

        if let (Some(out), Some(indices)) = (colors.as_mut(), color.as_ref()) {
            out.push([
                row[field_offsets[indices[0]]],
                row[field_offsets[indices[1]]],
                row[field_offsets[indices[2]]],
            ]);
        }

        cursor += stride;
    }

    Ok(PointCloud { positions, colors })
}

fn parse_ascii(
    body: &[u8],
    vertex_count: usize,
    properties: &[(&str, ScalarType)],
    position: [usize; 3],
    color: Option<[usize; 3]>,
    scale: f64,
) -> Result<PointCloud, Error> {
    // Every row consumes at least one byte of the body, which bounds the
    // declared count before anything is allocated from it.
    if vertex_count > body.len() {
        return Err(Error::PlyParse(format!(
            "Ascii data is too short, {} rows declared, have {} bytes",
            vertex_count,
            body.len()
        )));
    }

    let mut offset = 0;
    let mut positions = Vec::with_capacity(vertex_count);
    let mut colors = color.map(|_| Vec::with_capacity(vertex_count));

    for row_index in 0..vertex_count {
        let line = next_line(body, &mut offset).ok_or_else(|| {
            Error::PlyParse(format!("Ascii data ended early at row {}", row_index))
        })?;
        let text = str::from_utf8(line)
            .map_err(|e| Error::PlyParse(format!("UTF-8 error in row {}: {}", row_index, e)))?;
        let fields: Vec<&str> = text.split_ascii_whitespace().collect();
        if fields.len() < properties.len() {
            return Err(Error::PlyParse(format!(
                "Ascii row {} has {} fields, expected {}",
                row_index,
                fields.len(),
                properties.len()
            )));
        }

        let mut p = [0f64; 3];
        for (axis, value) in p.iter_mut().enumerate() {
            *value = fields[position[axis]]
                .parse::<f64>()
                .map_err(|e| Error::PlyParse(format!("Parse error in row {}: {}", row_index, e)))?
                * scale;
        }
        positions.push(p);

        if let (Some(out), Some(indices)) = (colors.as_mut(), color.as_ref()) {
            let mut c = [0u8; 3];
            for (channel, value) in c.iter_mut().enumerate() {
                *value = fields[indices[channel]].parse::<u8>().map_err(|e| {
                    Error::PlyParse(format!("Parse error in row {}: {}", row_index, e))
                })?;
            }
            out.push(c);
        }
    }

    Ok(PointCloud { positions, colors })
}

/// Writes `cloud` to a PLY file. Every position is emitted as
/// `p * scale + origin`.
pub fn write(
    cloud: &PointCloud,
    names: &PropertyNameMap,
    scale: f64,
    origin: [f64; 3],
    path: &Path,
    format: PlyFormat,
) -> Result<(), Error> {
    let out = emit(cloud, names, scale, origin, format)?;
    fs::write(path, out).map_err(Error::Io)
}

fn emit(
    cloud: &PointCloud,
    names: &PropertyNameMap,
    scale: f64,
    origin: [f64; 3],
    format: PlyFormat,
) -> Result<Vec<u8>, Error> {
    if let Some(colors) = &cloud.colors {
        if colors.len() != cloud.positions.len() {
            return Err(Error::Config(format!(
                "{} points but {} colours",
                cloud.positions.len(),
                colors.len()
            )));
        }
    }

    let mut output = Vec::new();
    output.extend_from_slice(b"ply\n");
    output.extend_from_slice(match format {
        PlyFormat::Ascii => b"format ascii 1.0\n".as_slice(),
        PlyFormat::BinaryLittleEndian => b"format binary_little_endian 1.0\n".as_slice(),
    });
    writeln!(output, "element vertex {}", cloud.point_count()).map_err(Error::Io)?;
    for name in &names.position {
        writeln!(output, "property float {}", name).map_err(Error::Io)?;
    }
    if cloud.has_colors() {
        for name in &names.color {
            writeln!(output, "property uchar {}", name).map_err(Error::Io)?;
        }
    }
    output.extend_from_slice(b"end_header\n");

    let point_size = 3 * 4 + if cloud.has_colors() { 3 } else { 0 };
    output.reserve(cloud.point_count() * point_size);

    for (i, position) in cloud.positions.iter().enumerate() {
        let transformed = [
            position[0] * scale + origin[0],
            position[1] * scale + origin[1],
            position[2] * scale + origin[2],
        ];
        match format {
            PlyFormat::Ascii => {
                write!(output, "{} {} {}", transformed[0], transformed[1], transformed[2])
                    .map_err(Error::Io)?;
                if let Some(colors) = &cloud.colors {
                    let c = colors[i];
                    write!(output, " {} {} {}", c[0], c[1], c[2]).map_err(Error::Io)?;
                }
                output.push(b'\n');
            }
            PlyFormat::BinaryLittleEndian => {
                for value in transformed {
                    output.extend_from_slice(&(value as f32).to_le_bytes());
                }
                if let Some(colors) = &cloud.colors {
                    output.extend_from_slice(&colors[i]);
                }
            }
        }
    }

    Ok(output)
}
