use prost::encoding::WireType;

use super::{FieldReader, FieldSet, FieldWriter, WireResult};
use crate::schedule::{ScheduleExpression, DEFAULT_DATE_FIELD, DEFAULT_TIME_FIELD};

const START: u32 = 0;
const END: u32 = 1;
const YEAR: u32 = 2;
const MONTH: u32 = 3;
const DAY_OF_MONTH: u32 = 4;
const DAY_OF_WEEK: u32 = 5;
const ZONE: u32 = 6;
const HOUR: u32 = 7;
const MINUTE: u32 = 8;
const SECOND: u32 = 9;

impl FieldSet for ScheduleExpression {
    const FIELD_COUNT: u32 = 10;

    fn initial() -> Self {
        ScheduleExpression::default()
    }

    fn write_fields(&self, writer: &mut FieldWriter, start: u32) {
        if let Some(instant) = self.start {
            writer.write_instant(start + START, instant);
        }
        if let Some(instant) = self.end {
            writer.write_instant(start + END, instant);
        }
        let patterns = [
            (YEAR, &self.year, DEFAULT_DATE_FIELD),
            (MONTH, &self.month, DEFAULT_DATE_FIELD),
            (DAY_OF_MONTH, &self.day_of_month, DEFAULT_DATE_FIELD),
            (DAY_OF_WEEK, &self.day_of_week, DEFAULT_DATE_FIELD),
        ];
        for (offset, value, default) in patterns {
            if value != default {
                writer.write_string(start + offset, value);
            }
        }
        if let Some(zone) = &self.zone {
            writer.write_string(start + ZONE, zone);
        }
        let patterns = [
            (HOUR, &self.hour),
            (MINUTE, &self.minute),
            (SECOND, &self.second),
        ];
        for (offset, value) in patterns {
            if value != DEFAULT_TIME_FIELD {
                writer.write_string(start + offset, value);
            }
        }
    }

    fn read_field(
        &mut self,
        reader: &mut FieldReader<'_>,
        offset: u32,
        wire_type: WireType,
    ) -> WireResult<()> {
        match offset {
            START => self.start = Some(reader.read_instant(offset, wire_type)?),
            END => self.end = Some(reader.read_instant(offset, wire_type)?),
            YEAR => self.year = reader.read_string(offset, wire_type)?,
            MONTH => self.month = reader.read_string(offset, wire_type)?,
            DAY_OF_MONTH => self.day_of_month = reader.read_string(offset, wire_type)?,
            DAY_OF_WEEK => self.day_of_week = reader.read_string(offset, wire_type)?,
            ZONE => self.zone = Some(reader.read_string(offset, wire_type)?),
            HOUR => self.hour = reader.read_string(offset, wire_type)?,
            MINUTE => self.minute = reader.read_string(offset, wire_type)?,
            SECOND => self.second = reader.read_string(offset, wire_type)?,
            _ => reader.skip(wire_type)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{FieldSetMarshaller, Marshaller};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn default_expression_encodes_to_nothing() {
        let bytes = FieldSetMarshaller
            .encode(&ScheduleExpression::default())
            .unwrap();
        assert!(bytes.is_empty());
        let decoded: ScheduleExpression = FieldSetMarshaller.decode(&bytes).unwrap();
        assert_eq!(decoded, ScheduleExpression::default());
    }

    #[test]
    fn only_non_default_fields_are_written() {
        let expression = ScheduleExpression::default().hour("*/2");
        let bytes = FieldSetMarshaller.encode(&expression).unwrap();
        // key(7, length-delimited), length, "*/2"
        assert_eq!(&bytes[..], &[(7 << 3) | 2, 3, b'*', b'/', b'2']);
    }

    #[test]
    fn embedded_at_an_offset() {
        let expression = ScheduleExpression::default().second("30").zone("Z");
        let mut writer = FieldWriter::new();
        expression.write_fields(&mut writer, 5);
        let bytes = writer.freeze();

        let mut reader = FieldReader::new(&bytes);
        let mut decoded = ScheduleExpression::initial();
        let mut indexes = Vec::new();
        while let Some((index, wire_type)) = reader.next_field().unwrap() {
            assert!(ScheduleExpression::owns(5, index));
            indexes.push(index);
            decoded.read_field(&mut reader, index - 5, wire_type).unwrap();
        }
        assert_eq!(indexes, vec![11, 14]);
        assert_eq!(decoded, expression);
    }

    fn pattern() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("*".to_string()),
            Just("0".to_string()),
            "[0-9]{1,2}(-[0-9]{1,2})?(/[0-9])?",
        ]
    }

    proptest! {
        #[test]
        fn round_trips(
            second in pattern(),
            minute in pattern(),
            hour in pattern(),
            day_of_month in pattern(),
            month in pattern(),
            day_of_week in pattern(),
            year in pattern(),
            zone in proptest::option::of(Just("+01:00".to_string())),
            start in proptest::option::of(0i64..4_102_444_800_000),
            end in proptest::option::of(0i64..4_102_444_800_000),
        ) {
            let expression = ScheduleExpression {
                second,
                minute,
                hour,
                day_of_month,
                month,
                day_of_week,
                year,
                zone,
                start: start.and_then(DateTime::<Utc>::from_timestamp_millis),
                end: end.and_then(DateTime::<Utc>::from_timestamp_millis),
            };
            let bytes = FieldSetMarshaller.encode(&expression).unwrap();
            let decoded: ScheduleExpression = FieldSetMarshaller.decode(&bytes).unwrap();
            prop_assert_eq!(decoded, expression);
        }
    }

    #[test]
    fn pre_epoch_bounds_survive() {
        let expression =
            ScheduleExpression::default().start(Utc.with_ymd_and_hms(1960, 1, 1, 0, 0, 0).unwrap());
        let bytes = FieldSetMarshaller.encode(&expression).unwrap();
        let decoded: ScheduleExpression = FieldSetMarshaller.decode(&bytes).unwrap();
        assert_eq!(decoded, expression);
    }
}
