pub mod cloud;
pub mod codec;
mod common;
pub mod error;
pub mod params;
pub mod ply;
pub mod sink;
pub mod tlv;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use cloud::PointCloud;
use codec::Decoder;
use codec::Encoder;
use error::Error;
use params::ParameterSet;
use ply::PlyFormat;
use ply::PropertyNameMap;
use sink::CloudCollector;
use sink::ContainerWriter;
use sink::EncodeStats;

/// Compresses `cloud` under `params` into `out` as a stream of TLV records.
///
/// The parameter set is validated and derived here; an empty cloud is
/// rejected before anything is written.
pub fn encode<W: Write>(
    cloud: &PointCloud,
    params: &ParameterSet,
    out: W,
) -> Result<EncodeStats, Error> {
    params.validate()?;
    if cloud.is_empty() {
        return Err(Error::EmptyInput);
    }
    let derived = params.derive(cloud);

    let mut writer = ContainerWriter::new(out);
    Encoder::new().compress(cloud, &derived, &mut writer)?;
    writer.finish()
}

/// Reads TLV records from `input` until end of stream and reconstructs the
/// cloud they carry. A stream that yields no points is [`Error::EmptyResult`].
pub fn decode<R: Read>(mut input: R) -> Result<PointCloud, Error> {
    let mut decoder = Decoder::new();
    let mut collector = CloudCollector::new();
    while let Some(unit) = tlv::read_tlv(&mut input)? {
        decoder.decompress(&unit, &mut collector)?;
    }
    match collector.take() {
        Some(cloud) if !cloud.is_empty() => Ok(cloud),
        _ => Err(Error::EmptyResult),
    }
}

/// Reads `input` as PLY and compresses it into the container file at
/// `container` under the default parameter set for that cloud.
pub fn encode_file(input: &Path, container: &Path) -> Result<EncodeStats, Error> {
    let cloud = ply::read(input, &PropertyNameMap::default(), 1.0)?;
    if cloud.is_empty() {
        return Err(Error::EmptyInput);
    }
    let params = ParameterSet::for_cloud(&cloud);

    let file = File::create(container).map_err(Error::Io)?;
    encode(&cloud, &params, BufWriter::new(file))
}

/// Decompresses the container file at `container` and writes the
/// reconstructed cloud to `output` as binary PLY. Returns the point count.
pub fn decode_file(container: &Path, output: &Path) -> Result<usize, Error> {
    let file = File::open(container).map_err(Error::Io)?;
    let cloud = decode(BufReader::new(file))?;
    ply::write(
        &cloud,
        &PropertyNameMap::default(),
        1.0,
        [0.0; 3],
        output,
        PlyFormat::BinaryLittleEndian,
    )?;
    Ok(cloud.point_count())
}
