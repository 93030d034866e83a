//! The built-in codec: produces and consumes the payload units framed by
//! [`crate::tlv`].
//!
//! Geometry is coded by scalar quantisation against the sequence bounding
//! box (`q = round((p - min) * scale)` per axis, i32 symbols packed
//! little-endian) with a zstd entropy stage; attributes are either raw or
//! step-quantised bytes, also zstd-coded. The pipelines treat both halves as
//! opaque state machines behind the sink traits.

use std::io::{self, Read};
use std::mem::size_of;

use foldhash::{HashSet, HashSetExt};
use zerocopy::byteorder::little_endian::{F64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::cloud::PointCloud;
use crate::common::{
    attribute_step, dequantize_coord, dequantize_u8, quantize_coord, quantize_u8, PREALLOC_LIMIT,
    ZSTD_COMPRESSION_LVL,
};
use crate::error::Error;
use crate::params::{
    AttributeDescription, AttributeEncoding, AttributeLabel, AttributeParameterSet, ParameterSet,
};
use crate::sink::{EmissionSink, ReconstructionSink};
use crate::tlv::{PayloadBuffer, PayloadType};

const GPS_FLAG_MERGE_DUPLICATES: u8 = 0x1;

// Unit bodies are fixed headers followed by variable payload, all
// little-endian and alignment-free so they can be cast straight off the
// stream.

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct SpsHeader {
    seq_parameter_set_id: u8,
    attr_count: u8,
    seq_geom_scale: F64,
    bbox_min: [F64; 3],
    bbox_max: [F64; 3],
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct SpsAttributeEntry {
    label: u8,
    num_dimensions: u8,
    bitdepth: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct GpsHeader {
    geom_parameter_set_id: u8,
    seq_parameter_set_id: u8,
    flags: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct ApsHeader {
    attr_index: u8,
    encoding: u8,
    init_qp: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct GeometryDataHeader {
    point_count: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct AttributeDataHeader {
    attr_index: u8,
    point_count: U32,
}

/// Compresses one cloud at a time into a stream of payload units.
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Encoder
    }

    /// Codes `cloud` under `params` and hands every produced unit to `sink`
    /// in stream order: sequence and geometry parameter sets, one attribute
    /// parameter set per attribute, geometry data, then one attribute data
    /// unit per attribute.
    ///
    /// `params` must already be validated and derived; a missing bounding
    /// box, an attribute the cloud cannot supply, or an attribute shape this
    /// encoder does not support is [`Error::Config`].
    pub fn compress<S: EmissionSink>(
        &mut self,
        cloud: &PointCloud,
        params: &ParameterSet,
        sink: &mut S,
    ) -> Result<(), Error> {
        params.validate()?;
        let bbox = params.seq_bounding_box.ok_or_else(|| {
            Error::Config("The parameter set has no bounding box; derive it first".to_string())
        })?;
        if u8::try_from(params.attributes.len()).is_err() {
            return Err(Error::Config(
                "At most 255 attributes fit a sequence parameter set".to_string(),
            ));
        }
        if u32::try_from(cloud.point_count()).is_err() {
            return Err(Error::Config(
                "The cloud exceeds the 32-bit point-count limit".to_string(),
            ));
        }
        if let Some(colors) = &cloud.colors {
            if colors.len() != cloud.positions.len() {
                return Err(Error::Config(format!(
                    "{} points but {} colours",
                    cloud.positions.len(),
                    colors.len()
                )));
            }
        }
        for attr in &params.attributes {
            if attr.label != AttributeLabel::Colour {
                return Err(Error::Config(format!(
                    "Attribute label {:?} is not supported by this encoder",
                    attr.label
                )));
            }
            if attr.bitdepth != 8 {
                return Err(Error::Config(format!(
                    "Only 8-bit attributes are supported, got bitdepth {}",
                    attr.bitdepth
                )));
            }
            if cloud.colors.is_none() {
                return Err(Error::Config(
                    "A colour attribute is declared but the cloud has no colours".to_string(),
                ));
            }
        }

        sink.on_unit_produced(&PayloadBuffer::new(
            PayloadType::SequenceParameterSet,
            build_sps(params, &bbox.min, &bbox.max),
        ));
        sink.on_unit_produced(&PayloadBuffer::new(
            PayloadType::GeometryParameterSet,
            build_gps(params),
        ));
        for (index, settings) in params.attr_params.iter().enumerate() {
            sink.on_unit_produced(&PayloadBuffer::new(
                PayloadType::AttributeParameterSet,
                build_aps(index as u8, settings),
            ));
        }

        let scale = params.seq_geom_scale;
        let mut quantized = Vec::with_capacity(cloud.point_count());
        for p in &cloud.positions {
            quantized.push([
                quantize_coord(p[0], bbox.min[0], scale),
                quantize_coord(p[1], bbox.min[1], scale),
                quantize_coord(p[2], bbox.min[2], scale),
            ]);
        }

        // First occurrence wins; attributes follow their surviving points.
        let kept: Vec<usize> = if params.merge_duplicate_points {
            let mut seen = HashSet::with_capacity(quantized.len());
            let mut kept = Vec::with_capacity(quantized.len());
            for (i, q) in quantized.iter().enumerate() {
                if seen.insert(*q) {
                    kept.push(i);
                }
            }
            kept
        } else {
            (0..quantized.len()).collect()
        };

        let mut packed = Vec::with_capacity(kept.len() * 12);
        for &i in &kept {
            for symbol in quantized[i] {
                packed.extend_from_slice(&symbol.to_le_bytes());
            }
        }
        let blob = zstd::encode_all(packed.as_slice(), ZSTD_COMPRESSION_LVL)
            .map_err(|e| Error::Compress(format!("Geometry blob: {}", e)))?;
        let header = GeometryDataHeader {
            point_count: U32::new(kept.len() as u32),
        };
        let mut body = Vec::with_capacity(size_of::<GeometryDataHeader>() + blob.len());
        body.extend_from_slice(header.as_bytes());
        body.extend_from_slice(&blob);
        sink.on_unit_produced(&PayloadBuffer::new(PayloadType::GeometryData, body));

        let mut snapped = PointCloud {
            positions: Vec::with_capacity(kept.len()),
            colors: cloud
                .colors
                .as_ref()
                .map(|colors| kept.iter().map(|&i| colors[i]).collect()),
        };
        for &i in &kept {
            snapped.positions.push([
                dequantize_coord(quantized[i][0], bbox.min[0], scale),
                dequantize_coord(quantized[i][1], bbox.min[1], scale),
                dequantize_coord(quantized[i][2], bbox.min[2], scale),
            ]);
        }
        sink.on_intermediate_cloud(&snapped);

        for (index, (attr, settings)) in params
            .attributes
            .iter()
            .zip(&params.attr_params)
            .enumerate()
        {
            // Only colour survives the pre-checks above.
            let colors = match &cloud.colors {
                Some(colors) => colors,
                None => continue,
            };
            let step = attribute_step(settings.init_qp);
            let mut values = Vec::with_capacity(kept.len() * attr.num_dimensions as usize);
            for &i in &kept {
                for channel in colors[i] {
                    values.push(match settings.encoding {
                        AttributeEncoding::Quantized => quantize_u8(channel, step),
                        AttributeEncoding::Raw => channel,
                    });
                }
            }
            let blob = zstd::encode_all(values.as_slice(), ZSTD_COMPRESSION_LVL)
                .map_err(|e| Error::Compress(format!("Attribute blob {}: {}", index, e)))?;
            let header = AttributeDataHeader {
                attr_index: index as u8,
                point_count: U32::new(kept.len() as u32),
            };
            let mut body = Vec::with_capacity(size_of::<AttributeDataHeader>() + blob.len());
            body.extend_from_slice(header.as_bytes());
            body.extend_from_slice(&blob);
            sink.on_unit_produced(&PayloadBuffer::new(PayloadType::AttributeData, body));
        }

        Ok(())
    }
}

fn build_sps(params: &ParameterSet, bbox_min: &[f64; 3], bbox_max: &[f64; 3]) -> Vec<u8> {
    let header = SpsHeader {
        seq_parameter_set_id: params.seq_parameter_set_id,
        attr_count: params.attributes.len() as u8,
        seq_geom_scale: F64::new(params.seq_geom_scale),
        bbox_min: bbox_min.map(F64::new),
        bbox_max: bbox_max.map(F64::new),
    };
    let mut body = Vec::with_capacity(
        size_of::<SpsHeader>() + params.attributes.len() * size_of::<SpsAttributeEntry>(),
    );
    body.extend_from_slice(header.as_bytes());
    for attr in &params.attributes {
        let entry = SpsAttributeEntry {
            label: attr.label as u8,
            num_dimensions: attr.num_dimensions,
            bitdepth: attr.bitdepth,
        };
        body.extend_from_slice(entry.as_bytes());
    }
    body
}

fn build_gps(params: &ParameterSet) -> Vec<u8> {
    let mut flags = 0u8;
    if params.merge_duplicate_points {
        flags |= GPS_FLAG_MERGE_DUPLICATES;
    }
    let header = GpsHeader {
        geom_parameter_set_id: params.geom_parameter_set_id,
        seq_parameter_set_id: params.seq_parameter_set_id,
        flags,
    };
    header.as_bytes().to_vec()
}

fn build_aps(attr_index: u8, settings: &AttributeParameterSet) -> Vec<u8> {
    let header = ApsHeader {
        attr_index,
        encoding: settings.encoding as u8,
        init_qp: settings.init_qp,
    };
    header.as_bytes().to_vec()
}

/// Streaming zstd decode that reads at most one byte past `expected`; a blob
/// inflating beyond its declared size surfaces as a length mismatch at the
/// caller.
fn decode_blob(blob: &[u8], expected: usize) -> io::Result<Vec<u8>> {
    let mut raw = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
    zstd::stream::read::Decoder::new(blob)?
        .take(expected as u64 + 1)
        .read_to_end(&mut raw)?;
    Ok(raw)
}

struct ActiveSps {
    id: u8,
    scale: f64,
    bbox_min: [f64; 3],
    attributes: Vec<AttributeDescription>,
}

/// Reconstructs clouds from payload units, in stream order.
///
/// Parameter sets persist across clouds; geometry and attribute data
/// accumulate until every declared attribute has arrived, at which point the
/// finished cloud goes to the sink and the per-cloud state clears.
#[derive(Default)]
pub struct Decoder {
    sps: Option<ActiveSps>,
    gps_seen: bool,
    aps: Vec<Option<AttributeParameterSet>>,
    geometry: Option<Vec<[f64; 3]>>,
    attributes: Vec<Option<Vec<[u8; 3]>>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one payload unit. Structural violations are all
    /// [`Error::StreamCorruption`]: data units before the parameter sets
    /// they depend on, short bodies, unknown labels or encodings, corrupt
    /// or mis-sized blobs.
    pub fn decompress<S: ReconstructionSink>(
        &mut self,
        unit: &PayloadBuffer,
        sink: &mut S,
    ) -> Result<(), Error> {
        match unit.payload_type {
            PayloadType::SequenceParameterSet => self.take_sps(&unit.data),
            PayloadType::GeometryParameterSet => self.take_gps(&unit.data),
            PayloadType::AttributeParameterSet => self.take_aps(&unit.data),
            PayloadType::GeometryData => {
                self.take_geometry(&unit.data)?;
                self.emit_if_complete(sink);
                Ok(())
            }
            PayloadType::AttributeData => {
                self.take_attribute(&unit.data)?;
                self.emit_if_complete(sink);
                Ok(())
            }
        }
    }

    fn take_sps(&mut self, data: &[u8]) -> Result<(), Error> {
        let (header, mut rest) = SpsHeader::ref_from_prefix(data).map_err(|_| {
            Error::StreamCorruption("Sequence parameter set body is too short".to_string())
        })?;
        let scale = header.seq_geom_scale.get();
        if !scale.is_finite() || scale <= 0.0 {
            return Err(Error::StreamCorruption(format!(
                "Sequence parameter set carries a bad geometry scale: {}",
                scale
            )));
        }

        let attr_count = header.attr_count as usize;
        let mut attributes = Vec::with_capacity(attr_count);
        for _ in 0..attr_count {
            let (entry, tail) = SpsAttributeEntry::ref_from_prefix(rest).map_err(|_| {
                Error::StreamCorruption(
                    "Sequence parameter set attribute table is too short".to_string(),
                )
            })?;
            let label = AttributeLabel::from_u8(entry.label).ok_or_else(|| {
                Error::StreamCorruption(format!("Unknown attribute label: {}", entry.label))
            })?;
            attributes.push(AttributeDescription {
                label,
                num_dimensions: entry.num_dimensions,
                bitdepth: entry.bitdepth,
            });
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(Error::StreamCorruption(
                "Trailing bytes after the attribute table".to_string(),
            ));
        }

        // A new sequence invalidates everything that referenced the old one.
        self.sps = Some(ActiveSps {
            id: header.seq_parameter_set_id,
            scale,
            bbox_min: header.bbox_min.map(|v| v.get()),
            attributes,
        });
        self.gps_seen = false;
        self.aps = vec![None; attr_count];
        self.geometry = None;
        self.attributes = vec![None; attr_count];
        Ok(())
    }

    fn take_gps(&mut self, data: &[u8]) -> Result<(), Error> {
        let sps = self.sps.as_ref().ok_or_else(|| {
            Error::StreamCorruption(
                "Geometry parameter set arrived before a sequence parameter set".to_string(),
            )
        })?;
        let (header, rest) = GpsHeader::ref_from_prefix(data).map_err(|_| {
            Error::StreamCorruption("Geometry parameter set body is too short".to_string())
        })?;
        if !rest.is_empty() {
            return Err(Error::StreamCorruption(
                "Trailing bytes after the geometry parameter set".to_string(),
            ));
        }
        if header.seq_parameter_set_id != sps.id {
            return Err(Error::StreamCorruption(format!(
                "Geometry parameter set references sequence parameter set {} but {} is active",
                header.seq_parameter_set_id, sps.id
            )));
        }
        self.gps_seen = true;
        Ok(())
    }

    fn take_aps(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.sps.is_none() {
            return Err(Error::StreamCorruption(
                "Attribute parameter set arrived before a sequence parameter set".to_string(),
            ));
        }
        let (header, rest) = ApsHeader::ref_from_prefix(data).map_err(|_| {
            Error::StreamCorruption("Attribute parameter set body is too short".to_string())
        })?;
        if !rest.is_empty() {
            return Err(Error::StreamCorruption(
                "Trailing bytes after the attribute parameter set".to_string(),
            ));
        }
        let index = header.attr_index as usize;
        let slot = self.aps.get_mut(index).ok_or_else(|| {
            Error::StreamCorruption(format!(
                "Attribute parameter set for unknown attribute {}",
                index
            ))
        })?;
        let encoding = AttributeEncoding::from_u8(header.encoding).ok_or_else(|| {
            Error::StreamCorruption(format!("Unknown attribute encoding: {}", header.encoding))
        })?;
        *slot = Some(AttributeParameterSet {
            encoding,
            init_qp: header.init_qp,
        });
        Ok(())
    }

    fn take_geometry(&mut self, data: &[u8]) -> Result<(), Error> {
        let sps = self.sps.as_ref().ok_or_else(|| {
            Error::StreamCorruption("Geometry data arrived before its parameter sets".to_string())
        })?;
        if !self.gps_seen {
            return Err(Error::StreamCorruption(
                "Geometry data arrived before its parameter sets".to_string(),
            ));
        }
        let (header, blob) = GeometryDataHeader::ref_from_prefix(data).map_err(|_| {
            Error::StreamCorruption("Geometry data body is too short".to_string())
        })?;
        let count = header.point_count.get() as usize;

        let expected = count.checked_mul(12).ok_or_else(|| {
            Error::StreamCorruption("Overflow in geometry byte calculation".to_string())
        })?;
        let raw = decode_blob(blob, expected)
            .map_err(|e| Error::StreamCorruption(format!("Corrupt geometry blob: {}", e)))?;
        if raw.len() != expected {
            return Err(Error::StreamCorruption(format!(
                "Geometry blob length mismatch, need {} bytes, have {}",
                expected,
                raw.len()
            )));
        }

        let mut positions = Vec::with_capacity(count);
        for point in raw.chunks_exact(12) {
            let mut p = [0f64; 3];
            for (axis, value) in p.iter_mut().enumerate() {
                let start = axis * 4;
                let symbol = i32::from_le_bytes([
                    point[start],
                    point[start + 1],
                    point[start + 2],
                    point[start + 3],
                ]);
                *value = dequantize_coord(symbol, sps.bbox_min[axis], sps.scale);
            }
            positions.push(p);
        }
        self.geometry = Some(positions);
        Ok(())
    }

    fn take_attribute(&mut self, data: &[u8]) -> Result<(), Error> {
        let sps = self.sps.as_ref().ok_or_else(|| {
            Error::StreamCorruption("Attribute data arrived before its parameter sets".to_string())
        })?;
        let geometry_count = match &self.geometry {
            Some(positions) => positions.len(),
            None => {
                return Err(Error::StreamCorruption(
                    "Attribute data arrived before geometry data".to_string(),
                ))
            }
        };
        let (header, blob) = AttributeDataHeader::ref_from_prefix(data).map_err(|_| {
            Error::StreamCorruption("Attribute data body is too short".to_string())
        })?;
        let index = header.attr_index as usize;
        let desc = *sps.attributes.get(index).ok_or_else(|| {
            Error::StreamCorruption(format!("Attribute data for unknown attribute {}", index))
        })?;
        let settings = self.aps.get(index).and_then(|s| *s).ok_or_else(|| {
            Error::StreamCorruption(format!(
                "Attribute data for attribute {} arrived before its parameter set",
                index
            ))
        })?;
        if desc.label != AttributeLabel::Colour || desc.num_dimensions != 3 {
            return Err(Error::StreamCorruption(format!(
                "Attribute {} cannot be reconstructed as colours",
                index
            )));
        }

        let count = header.point_count.get() as usize;
        if count != geometry_count {
            return Err(Error::StreamCorruption(format!(
                "Attribute point count {} does not match geometry point count {}",
                count, geometry_count
            )));
        }

        let expected = count.checked_mul(desc.num_dimensions as usize).ok_or_else(|| {
            Error::StreamCorruption("Overflow in attribute byte calculation".to_string())
        })?;
        let raw = decode_blob(blob, expected)
            .map_err(|e| Error::StreamCorruption(format!("Corrupt attribute blob: {}", e)))?;
        if raw.len() != expected {
            return Err(Error::StreamCorruption(format!(
                "Attribute blob length mismatch, need {} bytes, have {}",
                expected,
                raw.len()
            )));
        }

        let step = attribute_step(settings.init_qp);
        let mut values = Vec::with_capacity(count);
        for chunk in raw.chunks_exact(3) {
            let mut c = [0u8; 3];
            for (channel, value) in c.iter_mut().enumerate() {
                *value = match settings.encoding {
                    AttributeEncoding::Quantized => dequantize_u8(chunk[channel], step),
                    AttributeEncoding::Raw => chunk[channel],
                };
            }
            values.push(c);
        }

        self.attributes[index] = Some(values);
        Ok(())
    }

    fn emit_if_complete<S: ReconstructionSink>(&mut self, sink: &mut S) {
        if self.geometry.is_none() || self.attributes.iter().any(|slot| slot.is_none()) {
            return;
        }
        let positions = self.geometry.take().unwrap_or_default();
        let mut colors = None;
        if let Some(sps) = &self.sps {
            for (desc, slot) in sps.attributes.iter().zip(self.attributes.iter_mut()) {
                if desc.label == AttributeLabel::Colour && colors.is_none() {
                    colors = slot.take();
                }
            }
        }
        for slot in &mut self.attributes {
            *slot = None;
        }
        sink.on_cloud_ready(PointCloud { positions, colors });
    }
}
