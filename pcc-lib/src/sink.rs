//! Sink capabilities connecting the codec to the pipelines.

use std::io::Write;

use crate::cloud::PointCloud;
use crate::error::Error;
use crate::tlv::{self, PayloadBuffer, TLV_HEADER_SIZE};

/// Receiver for the payload units an encoder produces. Invoked synchronously,
/// once per unit, in stream order.
pub trait EmissionSink {
    fn on_unit_produced(&mut self, unit: &PayloadBuffer);

    /// Diagnostic hook: the grid-snapped cloud the decoder will reconstruct,
    /// available once geometry coding is done. Default no-op.
    fn on_intermediate_cloud(&mut self, _cloud: &PointCloud) {}
}

/// Receiver for reconstructed clouds on the decode side.
pub trait ReconstructionSink {
    fn on_cloud_ready(&mut self, cloud: PointCloud);
}

/// Totals for one container-writing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeStats {
    pub units: usize,
    pub bytes: u64,
}

/// Frames every produced unit as a TLV record and writes it straight to the
/// underlying sink; nothing is buffered beyond the unit being written.
///
/// The emission hooks have no way to report failure, so the first write error
/// is latched: later units are skipped and the error surfaces from
/// [`ContainerWriter::finish`].
pub struct ContainerWriter<W: Write> {
    sink: W,
    units: usize,
    bytes: u64,
    failure: Option<Error>,
}

impl<W: Write> ContainerWriter<W> {
    pub fn new(sink: W) -> Self {
        ContainerWriter {
            sink,
            units: 0,
            bytes: 0,
            failure: None,
        }
    }

    /// Flushes the sink and reports the session totals, or the first write
    /// error if one was latched.
    pub fn finish(mut self) -> Result<EncodeStats, Error> {
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        self.sink.flush().map_err(Error::Io)?;
        Ok(EncodeStats {
            units: self.units,
            bytes: self.bytes,
        })
    }
}

impl<W: Write> EmissionSink for ContainerWriter<W> {
    fn on_unit_produced(&mut self, unit: &PayloadBuffer) {
        if self.failure.is_some() {
            return;
        }
        match tlv::write_tlv(unit, &mut self.sink) {
            Ok(()) => {
                self.units += 1;
                self.bytes += (TLV_HEADER_SIZE + unit.data.len()) as u64;
            }
            Err(e) => self.failure = Some(Error::Io(e)),
        }
    }
}

/// Keeps the most recent reconstructed cloud.
#[derive(Debug, Default)]
pub struct CloudCollector {
    cloud: Option<PointCloud>,
}

impl CloudCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Option<PointCloud> {
        self.cloud.take()
    }
}

impl ReconstructionSink for CloudCollector {
    fn on_cloud_ready(&mut self, cloud: PointCloud) {
        self.cloud = Some(cloud);
    }
}

/// Buffers cloned units in memory, in production order.
#[derive(Debug, Default)]
pub struct UnitCollector {
    pub units: Vec<PayloadBuffer>,
}

impl UnitCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmissionSink for UnitCollector {
    fn on_unit_produced(&mut self, unit: &PayloadBuffer) {
        self.units.push(unit.clone());
    }
}
