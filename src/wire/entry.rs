use std::marker::PhantomData;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use prost::encoding::WireType;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    FieldReader, FieldSet, FieldSetMarshaller, FieldWriter, Marshaller, WireError, WireResult,
};
use crate::entry::{TimerMetaDataEntry, TimerSchedule, TimerType};
use crate::error::{BoxError, Result, TimerError};
use crate::identity::TimeoutDescriptor;
use crate::schedule::{ScheduleExpression, ScheduleTimeoutFactory};

/// Converts the application payload of a timer to and from bytes.
///
/// `None` stands for a null payload, which is not written at all.
pub trait ContextMarshaller<C>: Send + Sync {
    fn write(&self, context: &C) -> std::result::Result<Option<Vec<u8>>, BoxError>;

    fn read(&self, bytes: Option<&[u8]>) -> std::result::Result<C, BoxError>;
}

/// JSON payloads; a payload serializing to `null` is omitted.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonContextMarshaller;

impl<C: Serialize + DeserializeOwned> ContextMarshaller<C> for JsonContextMarshaller {
    fn write(&self, context: &C) -> std::result::Result<Option<Vec<u8>>, BoxError> {
        let bytes = serde_json::to_vec(context)?;
        Ok((bytes != b"null").then_some(bytes))
    }

    fn read(&self, bytes: Option<&[u8]>) -> std::result::Result<C, BoxError> {
        Ok(serde_json::from_slice(bytes.unwrap_or(b"null"))?)
    }
}

/// Raw payloads; the empty payload is the null payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesContextMarshaller;

impl ContextMarshaller<Bytes> for BytesContextMarshaller {
    fn write(&self, context: &Bytes) -> std::result::Result<Option<Vec<u8>>, BoxError> {
        Ok((!context.is_empty()).then(|| context.to_vec()))
    }

    fn read(&self, bytes: Option<&[u8]>) -> std::result::Result<Bytes, BoxError> {
        Ok(bytes.map(Bytes::copy_from_slice).unwrap_or_default())
    }
}

const CONTEXT: u32 = 1;
const START: u32 = 2;
const LAST_TIMEOUT: u32 = 3;
const INTERVAL: u32 = 4;
const TIMEOUT_METHOD: u32 = 4;
const EXPRESSION: u32 = 5;

/// Fields shared by both entry variants.
struct CommonFields<'a> {
    context: Option<&'a [u8]>,
    start: DateTime<Utc>,
    last_timeout: Option<TimeDelta>,
}

impl<'a> CommonFields<'a> {
    fn new() -> Self {
        Self {
            context: None,
            start: DateTime::<Utc>::UNIX_EPOCH,
            last_timeout: None,
        }
    }

    /// Returns false if `index` is not a common field.
    fn read(
        &mut self,
        reader: &mut FieldReader<'a>,
        index: u32,
        wire_type: WireType,
    ) -> WireResult<bool> {
        match index {
            CONTEXT => self.context = Some(reader.read_bytes(index, wire_type)?),
            START => self.start = reader.read_instant(index, wire_type)?,
            LAST_TIMEOUT => self.last_timeout = Some(reader.read_duration(index, wire_type)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn context<C, M: ContextMarshaller<C>>(&self, marshaller: &M) -> Result<C> {
        marshaller
            .read(self.context)
            .map_err(|e| TimerError::invalid_argument("undecodable timer context", e))
    }
}

fn write_common<C, M: ContextMarshaller<C>>(
    writer: &mut FieldWriter,
    marshaller: &M,
    entry: &TimerMetaDataEntry<C>,
) -> Result<()> {
    let context = marshaller
        .write(entry.context())
        .map_err(|e| TimerError::invalid_argument("unencodable timer context", e))?;
    if let Some(context) = context {
        writer.write_bytes(CONTEXT, &context);
    }
    if entry.start() != DateTime::<Utc>::UNIX_EPOCH {
        writer.write_instant(START, entry.start());
    }
    if let Some(last_timeout) = entry.last_timeout() {
        writer.write_duration(LAST_TIMEOUT, last_timeout);
    }
    Ok(())
}

/// Interval entries: context 1, start 2, last timeout 3, interval 4.
pub struct IntervalEntryMarshaller<C, M> {
    context: M,
    _context: PhantomData<fn() -> C>,
}

impl<C, M: ContextMarshaller<C>> IntervalEntryMarshaller<C, M> {
    pub fn new(context: M) -> Self {
        Self {
            context,
            _context: PhantomData,
        }
    }
}

impl<C, M: ContextMarshaller<C>> Marshaller<TimerMetaDataEntry<C>> for IntervalEntryMarshaller<C, M> {
    fn write(&self, writer: &mut FieldWriter, entry: &TimerMetaDataEntry<C>) -> Result<()> {
        write_common(writer, &self.context, entry)?;
        if let Some(interval) = entry.interval_period() {
            writer.write_duration(INTERVAL, interval);
        }
        Ok(())
    }

    fn read(&self, mut reader: FieldReader<'_>) -> Result<TimerMetaDataEntry<C>> {
        let mut common = CommonFields::new();
        let mut interval = None;
        while let Some((index, wire_type)) = reader.next_field()? {
            if common.read(&mut reader, index, wire_type)? {
                continue;
            }
            match index {
                INTERVAL => interval = Some(reader.read_duration(index, wire_type)?),
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(TimerMetaDataEntry::from_parts(
            common.context(&self.context)?,
            common.start,
            common.last_timeout,
            TimerSchedule::Interval { interval },
        ))
    }
}

/// Schedule entries: context 1, start 2, last timeout 3, timeout method 4
/// (nested record), expression 5..=14.
pub struct ScheduleEntryMarshaller<C, M> {
    context: M,
    factory: ScheduleTimeoutFactory,
    _context: PhantomData<fn() -> C>,
}

impl<C, M: ContextMarshaller<C>> ScheduleEntryMarshaller<C, M> {
    pub fn new(context: M, factory: ScheduleTimeoutFactory) -> Self {
        Self {
            context,
            factory,
            _context: PhantomData,
        }
    }
}

impl<C, M: ContextMarshaller<C>> Marshaller<TimerMetaDataEntry<C>> for ScheduleEntryMarshaller<C, M> {
    fn write(&self, writer: &mut FieldWriter, entry: &TimerMetaDataEntry<C>) -> Result<()> {
        write_common(writer, &self.context, entry)?;
        let timeout_method = entry.timeout_method();
        if timeout_method != TimeoutDescriptor::default() {
            writer.write_record(TIMEOUT_METHOD, |nested| {
                FieldSetMarshaller.write(nested, &timeout_method)
            })?;
        }
        if let Some(expression) = entry.expression() {
            expression.write_fields(writer, EXPRESSION);
        }
        Ok(())
    }

    fn read(&self, mut reader: FieldReader<'_>) -> Result<TimerMetaDataEntry<C>> {
        let mut common = CommonFields::new();
        let mut timeout_method = TimeoutDescriptor::default();
        let mut expression = ScheduleExpression::initial();
        while let Some((index, wire_type)) = reader.next_field()? {
            if common.read(&mut reader, index, wire_type)? {
                continue;
            }
            match index {
                TIMEOUT_METHOD => {
                    let nested = reader.read_record(index, wire_type)?;
                    timeout_method = FieldSetMarshaller.read(nested)?;
                }
                _ if ScheduleExpression::owns(EXPRESSION, index) => {
                    expression.read_field(&mut reader, index - EXPRESSION, wire_type)?
                }
                _ => reader.skip(wire_type)?,
            }
        }
        Ok(TimerMetaDataEntry::from_parts(
            common.context(&self.context)?,
            common.start,
            common.last_timeout,
            TimerSchedule::calendar(expression, timeout_method, &self.factory),
        ))
    }
}

const INTERVAL_ENTRY: u32 = 1;
const SCHEDULE_ENTRY: u32 = 2;

/// Envelope distinguishing the two entry variants: field 1 holds an interval
/// entry, field 2 a schedule entry.
pub struct EntryMarshaller<C, M> {
    interval: IntervalEntryMarshaller<C, M>,
    schedule: ScheduleEntryMarshaller<C, M>,
}

impl<C, M: ContextMarshaller<C> + Clone> EntryMarshaller<C, M> {
    pub fn new(context: M, factory: ScheduleTimeoutFactory) -> Self {
        Self {
            interval: IntervalEntryMarshaller::new(context.clone()),
            schedule: ScheduleEntryMarshaller::new(context, factory),
        }
    }
}

impl<C, M: ContextMarshaller<C>> Marshaller<TimerMetaDataEntry<C>> for EntryMarshaller<C, M> {
    fn write(&self, writer: &mut FieldWriter, entry: &TimerMetaDataEntry<C>) -> Result<()> {
        match entry.timer_type() {
            TimerType::Interval => writer.write_record(INTERVAL_ENTRY, |nested| {
                self.interval.write(nested, entry)
            }),
            TimerType::Schedule => writer.write_record(SCHEDULE_ENTRY, |nested| {
                self.schedule.write(nested, entry)
            }),
        }
    }

    fn read(&self, mut reader: FieldReader<'_>) -> Result<TimerMetaDataEntry<C>> {
        let mut entry = None;
        while let Some((index, wire_type)) = reader.next_field()? {
            match index {
                INTERVAL_ENTRY => {
                    entry = Some(self.interval.read(reader.read_record(index, wire_type)?)?)
                }
                SCHEDULE_ENTRY => {
                    entry = Some(self.schedule.read(reader.read_record(index, wire_type)?)?)
                }
                _ => reader.skip(wire_type)?,
            }
        }
        entry.ok_or_else(|| WireError::MissingField("entry").into())
    }
}
