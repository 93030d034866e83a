//! TLV framing for the payload container.
//!
//! Each record is `[tag: u8][length: u32 big-endian][length body bytes]`.
//! The container has no header, footer or index; end-of-file is the only
//! terminator, so reading distinguishes a clean end of stream from a record
//! cut off mid-way.

use std::io::{self, ErrorKind, Read, Write};

use crate::common::PREALLOC_LIMIT;
use crate::error::Error;

/// Tag byte plus the big-endian u32 length word.
pub const TLV_HEADER_SIZE: usize = 5;

/// Payload unit types. Tags start at 1 so a zero byte is never a valid tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    SequenceParameterSet = 1,
    GeometryParameterSet = 2,
    AttributeParameterSet = 3,
    GeometryData = 4,
    AttributeData = 5,
}

impl PayloadType {
    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PayloadType::SequenceParameterSet),
            2 => Some(PayloadType::GeometryParameterSet),
            3 => Some(PayloadType::AttributeParameterSet),
            4 => Some(PayloadType::GeometryData),
            5 => Some(PayloadType::AttributeData),
            _ => None,
        }
    }
}

/// One typed payload unit: a tag plus its raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBuffer {
    pub payload_type: PayloadType,
    pub data: Vec<u8>,
}

impl PayloadBuffer {
    pub fn new(payload_type: PayloadType, data: Vec<u8>) -> Self {
        PayloadBuffer { payload_type, data }
    }
}

/// Frames `unit` and writes it to `sink`, advancing it by
/// `TLV_HEADER_SIZE + unit.data.len()` bytes.
pub fn write_tlv<W: Write>(unit: &PayloadBuffer, sink: &mut W) -> io::Result<()> {
    let length = u32::try_from(unit.data.len()).map_err(|_| {
        io::Error::new(
            ErrorKind::InvalidInput,
            "payload body exceeds the u32 length field",
        )
    })?;
    sink.write_all(&[unit.payload_type as u8])?;
    sink.write_all(&length.to_be_bytes())?;
    sink.write_all(&unit.data)?;
    Ok(())
}

/// Reads the next record from `source`.
///
/// `Ok(None)` means a clean end of stream: zero bytes were available before
/// the tag byte. Once a tag byte has been consumed the whole record must
/// follow; a truncated length word or body, or an unknown tag value, is
/// [`Error::StreamCorruption`]. Underlying non-EOF I/O failures are
/// [`Error::Io`].
pub fn read_tlv<R: Read>(source: &mut R) -> Result<Option<PayloadBuffer>, Error> {
    let tag = match read_first_byte(source).map_err(Error::Io)? {
        Some(tag) => tag,
        None => return Ok(None),
    };
    let payload_type = PayloadType::from_u8(tag)
        .ok_or_else(|| Error::StreamCorruption(format!("Unknown payload tag: {}", tag)))?;

    let mut length_bytes = [0u8; 4];
    source.read_exact(&mut length_bytes).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => {
            Error::StreamCorruption("Stream ended inside a record length".to_string())
        }
        _ => Error::Io(e),
    })?;
    let length = u32::from_be_bytes(length_bytes) as usize;

    let mut data = Vec::with_capacity(length.min(PREALLOC_LIMIT));
    let got = source
        .take(length as u64)
        .read_to_end(&mut data)
        .map_err(Error::Io)?;
    if got != length {
        return Err(Error::StreamCorruption(format!(
            "Stream ended inside a record body, need {} bytes, have {}",
            length, got
        )));
    }

    Ok(Some(PayloadBuffer { payload_type, data }))
}

fn read_first_byte<R: Read>(source: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match source.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(ErrorKind::Other, "refused"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct InterruptedOnce<R> {
        inner: R,
        fired: bool,
    }

    impl<R: Read> Read for InterruptedOnce<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.fired {
                self.fired = true;
                return Err(io::Error::new(ErrorKind::Interrupted, "again"));
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn round_trip_preserves_tag_and_body() {
        let units = [
            PayloadBuffer::new(PayloadType::SequenceParameterSet, vec![1, 2, 3]),
            PayloadBuffer::new(PayloadType::GeometryData, vec![0xAB; 64]),
        ];
        let mut buffer = Vec::new();
        for unit in &units {
            write_tlv(unit, &mut buffer).expect("write failed");
        }
        assert_eq!(
            buffer.len(),
            2 * TLV_HEADER_SIZE + units[0].data.len() + units[1].data.len()
        );

        let mut source = Cursor::new(buffer);
        for unit in &units {
            let read = read_tlv(&mut source).expect("read failed").expect("no record");
            assert_eq!(&read, unit);
        }
        assert!(read_tlv(&mut source).expect("read failed").is_none());
    }

    #[test]
    fn empty_source_is_end_of_stream() {
        let mut source = Cursor::new(Vec::new());
        assert!(read_tlv(&mut source).expect("read failed").is_none());
    }

    #[test]
    fn zero_length_body_round_trips() {
        let unit = PayloadBuffer::new(PayloadType::GeometryParameterSet, Vec::new());
        let mut buffer = Vec::new();
        write_tlv(&unit, &mut buffer).expect("write failed");
        assert_eq!(buffer.len(), TLV_HEADER_SIZE);

        let mut source = Cursor::new(buffer);
        let read = read_tlv(&mut source).expect("read failed").expect("no record");
        assert_eq!(read, unit);
    }

    #[test]
    fn lone_tag_is_corruption() {
        let mut source = Cursor::new(vec![4u8]);
        let err = read_tlv(&mut source).unwrap_err();
        assert!(matches!(err, Error::StreamCorruption(_)), "got {:?}", err);
    }

    #[test]
    fn truncated_length_is_corruption() {
        let mut source = Cursor::new(vec![1u8, 0, 0]);
        let err = read_tlv(&mut source).unwrap_err();
        assert!(matches!(err, Error::StreamCorruption(_)), "got {:?}", err);
    }

    #[test]
    fn truncated_body_is_corruption() {
        let unit = PayloadBuffer::new(PayloadType::AttributeData, vec![7; 10]);
        let mut buffer = Vec::new();
        write_tlv(&unit, &mut buffer).expect("write failed");
        buffer.truncate(buffer.len() - 4);

        let mut source = Cursor::new(buffer);
        let err = read_tlv(&mut source).unwrap_err();
        match err {
            Error::StreamCorruption(msg) => {
                assert!(msg.contains("record body"), "got {}", msg)
            }
            other => panic!("expected StreamCorruption, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_corruption() {
        for tag in [0u8, 6, 0xFF] {
            let mut source = Cursor::new(vec![tag, 0, 0, 0, 0]);
            let err = read_tlv(&mut source).unwrap_err();
            assert!(matches!(err, Error::StreamCorruption(_)), "tag {}", tag);
        }
    }

    #[test]
    fn write_failure_propagates() {
        let unit = PayloadBuffer::new(PayloadType::SequenceParameterSet, vec![1]);
        assert!(write_tlv(&unit, &mut FailingWriter).is_err());
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let unit = PayloadBuffer::new(PayloadType::GeometryData, vec![9, 9]);
        let mut buffer = Vec::new();
        write_tlv(&unit, &mut buffer).expect("write failed");

        let mut source = InterruptedOnce {
            inner: Cursor::new(buffer),
            fired: false,
        };
        let read = read_tlv(&mut source).expect("read failed").expect("no record");
        assert_eq!(read, unit);
    }

    #[test]
    fn order_preserved_across_records() {
        let sequence = [
            PayloadType::SequenceParameterSet,
            PayloadType::GeometryParameterSet,
            PayloadType::AttributeParameterSet,
            PayloadType::GeometryData,
            PayloadType::AttributeData,
        ];
        let mut buffer = Vec::new();
        for (i, &payload_type) in sequence.iter().enumerate() {
            write_tlv(&PayloadBuffer::new(payload_type, vec![i as u8]), &mut buffer)
                .expect("write failed");
        }

        let mut source = Cursor::new(buffer);
        let mut seen = Vec::new();
        while let Some(unit) = read_tlv(&mut source).expect("read failed") {
            seen.push(unit.payload_type);
        }
        assert_eq!(seen, sequence);
    }
}
