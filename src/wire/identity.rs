use prost::encoding::WireType;

use super::{FieldReader, FieldSet, FieldWriter, Marshaller, WireError, WireResult};
use crate::error::Result;
use crate::identity::{TimeoutDescriptor, TimerIndex, DEFAULT_TIMEOUT_METHOD_NAME};

const METHOD_NAME: u32 = 0;
const PARAMETER_COUNT: u32 = 1;

impl FieldSet for TimeoutDescriptor {
    const FIELD_COUNT: u32 = 2;

    fn initial() -> Self {
        TimeoutDescriptor::new(DEFAULT_TIMEOUT_METHOD_NAME, 0)
    }

    fn write_fields(&self, writer: &mut FieldWriter, start: u32) {
        if self.method_name() != DEFAULT_TIMEOUT_METHOD_NAME {
            writer.write_string(start + METHOD_NAME, self.method_name());
        }
        if self.parameter_count() != 0 {
            writer.write_uint32(start + PARAMETER_COUNT, self.parameter_count());
        }
    }

    fn read_field(
        &mut self,
        reader: &mut FieldReader<'_>,
        offset: u32,
        wire_type: WireType,
    ) -> WireResult<()> {
        match offset {
            METHOD_NAME => {
                *self = TimeoutDescriptor::new(
                    reader.read_string(offset, wire_type)?,
                    self.parameter_count(),
                )
            }
            PARAMETER_COUNT => {
                *self = TimeoutDescriptor::new(
                    self.method_name().to_owned(),
                    reader.read_uint32(offset, wire_type)?,
                )
            }
            _ => reader.skip(wire_type)?,
        }
        Ok(())
    }
}

const CLASS_NAME: u32 = 1;
const DESCRIPTOR: u32 = 2;
const ORDINAL: u32 = DESCRIPTOR + TimeoutDescriptor::FIELD_COUNT;

/// Marshals the dedup key of automatic timers; its bytes double as a store key.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimerIndexMarshaller;

impl Marshaller<TimerIndex> for TimerIndexMarshaller {
    fn write(&self, writer: &mut FieldWriter, value: &TimerIndex) -> Result<()> {
        writer.write_string(CLASS_NAME, value.declaring_class_name());
        value.descriptor().write_fields(writer, DESCRIPTOR);
        if value.index() != 0 {
            writer.write_uint32(ORDINAL, value.index());
        }
        Ok(())
    }

    fn read(&self, mut reader: FieldReader<'_>) -> Result<TimerIndex> {
        let mut class_name = None;
        let mut descriptor = TimeoutDescriptor::initial();
        let mut ordinal = 0;
        while let Some((index, wire_type)) = reader.next_field()? {
            match index {
                CLASS_NAME => class_name = Some(reader.read_string(index, wire_type)?),
                ORDINAL => ordinal = reader.read_uint32(index, wire_type)?,
                _ if TimeoutDescriptor::owns(DESCRIPTOR, index) => {
                    descriptor.read_field(&mut reader, index - DESCRIPTOR, wire_type)?
                }
                _ => reader.skip(wire_type)?,
            }
        }
        let class_name = class_name.ok_or(WireError::MissingField("declaringClassName"))?;
        Ok(TimerIndex::new(class_name, descriptor, ordinal))
    }
}
