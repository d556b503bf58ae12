//! Tagged binary fields for persisting and replicating timer metadata.
//!
//! Every field is prefixed by a varint key `index << 3 | wire type`. Writers
//! omit fields holding their default value and readers skip indexes they do not
//! know, so newer writers can add fields without breaking older readers.

pub mod entry;
pub mod expression;
pub mod identity;

use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, TimeDelta, Utc};
use prost::encoding::{decode_varint, encode_varint, WireType};

use crate::error::Result;

pub use self::entry::{
    BytesContextMarshaller, ContextMarshaller, EntryMarshaller, IntervalEntryMarshaller,
    JsonContextMarshaller, ScheduleEntryMarshaller,
};
pub use self::identity::TimerIndexMarshaller;

pub type WireResult<T> = std::result::Result<T, WireError>;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Malformed record: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Unsupported wire type {0:?}")]
    UnsupportedWireType(WireType),

    #[error("Field {index} has wire type {actual:?}, expected {expected:?}")]
    UnexpectedWireType {
        index: u32,
        expected: WireType,
        actual: WireType,
    },

    #[error("Field index {0} out of range")]
    FieldIndex(u64),

    #[error("Truncated record: {needed} bytes needed, {remaining} remaining")]
    Truncated { needed: u64, remaining: usize },

    #[error("Field {index} is not valid UTF-8: {source}")]
    Utf8 {
        index: u32,
        #[source]
        source: std::str::Utf8Error,
    },

    #[error("Field {index} value {value} out of range")]
    OutOfRange { index: u32, value: i64 },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    fn key(&mut self, index: u32, wire_type: WireType) {
        encode_varint((u64::from(index) << 3) | wire_type as u64, &mut self.buf);
    }

    pub fn write_uint64(&mut self, index: u32, value: u64) {
        self.key(index, WireType::Varint);
        encode_varint(value, &mut self.buf);
    }

    pub fn write_uint32(&mut self, index: u32, value: u32) {
        self.write_uint64(index, u64::from(value));
    }

    pub fn write_sint64(&mut self, index: u32, value: i64) {
        self.key(index, WireType::Varint);
        encode_varint(((value << 1) ^ (value >> 63)) as u64, &mut self.buf);
    }

    pub fn write_bytes(&mut self, index: u32, value: &[u8]) {
        self.key(index, WireType::LengthDelimited);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
    }

    pub fn write_string(&mut self, index: u32, value: &str) {
        self.write_bytes(index, value.as_bytes());
    }

    /// Epoch milliseconds.
    pub fn write_instant(&mut self, index: u32, value: DateTime<Utc>) {
        self.write_sint64(index, value.timestamp_millis());
    }

    /// Milliseconds.
    pub fn write_duration(&mut self, index: u32, value: TimeDelta) {
        self.write_sint64(index, value.num_milliseconds());
    }

    /// Writes a nested record as a length-delimited field.
    pub fn write_record<F>(&mut self, index: u32, write: F) -> Result<()>
    where
        F: FnOnce(&mut FieldWriter) -> Result<()>,
    {
        let mut nested = FieldWriter::new();
        write(&mut nested)?;
        self.write_bytes(index, &nested.buf);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    /// Index and wire type of the next field, or `None` at the end of the record.
    pub fn next_field(&mut self) -> WireResult<Option<(u32, WireType)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = decode_varint(&mut self.buf)?;
        let wire_type = WireType::try_from(key & 0x7)?;
        let index = u32::try_from(key >> 3).map_err(|_| WireError::FieldIndex(key >> 3))?;
        Ok(Some((index, wire_type)))
    }

    fn expect(index: u32, expected: WireType, actual: WireType) -> WireResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(WireError::UnexpectedWireType {
                index,
                expected,
                actual,
            })
        }
    }

    pub fn read_uint64(&mut self, index: u32, wire_type: WireType) -> WireResult<u64> {
        Self::expect(index, WireType::Varint, wire_type)?;
        Ok(decode_varint(&mut self.buf)?)
    }

    pub fn read_uint32(&mut self, index: u32, wire_type: WireType) -> WireResult<u32> {
        let value = self.read_uint64(index, wire_type)?;
        u32::try_from(value).map_err(|_| WireError::OutOfRange {
            index,
            value: i64::try_from(value).unwrap_or(i64::MAX),
        })
    }

    pub fn read_sint64(&mut self, index: u32, wire_type: WireType) -> WireResult<i64> {
        let raw = self.read_uint64(index, wire_type)?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn read_bytes(&mut self, index: u32, wire_type: WireType) -> WireResult<&'a [u8]> {
        Self::expect(index, WireType::LengthDelimited, wire_type)?;
        let len = decode_varint(&mut self.buf)?;
        self.take(len)
    }

    pub fn read_string(&mut self, index: u32, wire_type: WireType) -> WireResult<String> {
        let bytes = self.read_bytes(index, wire_type)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|source| WireError::Utf8 { index, source })
    }

    pub fn read_instant(
        &mut self,
        index: u32,
        wire_type: WireType,
    ) -> WireResult<DateTime<Utc>> {
        let millis = self.read_sint64(index, wire_type)?;
        DateTime::from_timestamp_millis(millis).ok_or(WireError::OutOfRange {
            index,
            value: millis,
        })
    }

    pub fn read_duration(
        &mut self,
        index: u32,
        wire_type: WireType,
    ) -> WireResult<TimeDelta> {
        let millis = self.read_sint64(index, wire_type)?;
        TimeDelta::try_milliseconds(millis).ok_or(WireError::OutOfRange {
            index,
            value: millis,
        })
    }

    pub fn read_record(
        &mut self,
        index: u32,
        wire_type: WireType,
    ) -> WireResult<FieldReader<'a>> {
        self.read_bytes(index, wire_type).map(FieldReader::new)
    }

    /// Consumes the value of a field nobody claimed.
    pub fn skip(&mut self, wire_type: WireType) -> WireResult<()> {
        match wire_type {
            WireType::Varint => decode_varint(&mut self.buf).map(drop).map_err(Into::into),
            WireType::SixtyFourBit => self.take(8).map(drop),
            WireType::ThirtyTwoBit => self.take(4).map(drop),
            WireType::LengthDelimited => {
                let len = decode_varint(&mut self.buf)?;
                self.take(len).map(drop)
            }
            other => Err(WireError::UnsupportedWireType(other)),
        }
    }

    fn take(&mut self, len: u64) -> WireResult<&'a [u8]> {
        let remaining = self.buf.len();
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= remaining)
            .ok_or(WireError::Truncated {
                needed: len,
                remaining,
            })?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

/// A group of fields embedded in a parent record at a caller-chosen start index.
///
/// The set occupies `FIELD_COUNT` consecutive indexes; the parent must not use
/// any of them for its own fields.
pub trait FieldSet: Sized {
    const FIELD_COUNT: u32;

    /// The value a reader starts from. Fields equal to it are not written.
    fn initial() -> Self;

    fn write_fields(&self, writer: &mut FieldWriter, start: u32);

    /// Reads the field at `start + offset`; unknown offsets are skipped.
    fn read_field(
        &mut self,
        reader: &mut FieldReader<'_>,
        offset: u32,
        wire_type: WireType,
    ) -> WireResult<()>;

    fn owns(start: u32, index: u32) -> bool {
        index >= start && index - start < Self::FIELD_COUNT
    }
}

/// Encodes and decodes a complete record.
pub trait Marshaller<T> {
    fn write(&self, writer: &mut FieldWriter, value: &T) -> Result<()>;

    fn read(&self, reader: FieldReader<'_>) -> Result<T>;

    fn encode(&self, value: &T) -> Result<Bytes> {
        let mut writer = FieldWriter::new();
        self.write(&mut writer, value)?;
        Ok(writer.freeze())
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self.read(FieldReader::new(bytes))
    }
}

/// Marshals a [`FieldSet`] as a standalone record starting at index 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct FieldSetMarshaller;

impl<T: FieldSet> Marshaller<T> for FieldSetMarshaller {
    fn write(&self, writer: &mut FieldWriter, value: &T) -> Result<()> {
        value.write_fields(writer, 0);
        Ok(())
    }

    fn read(&self, mut reader: FieldReader<'_>) -> Result<T> {
        let mut value = T::initial();
        while let Some((index, wire_type)) = reader.next_field()? {
            if T::owns(0, index) {
                value.read_field(&mut reader, index, wire_type)?;
            } else {
                reader.skip(wire_type)?;
            }
        }
        Ok(value)
    }
}
