use std::str::FromStr;
use std::sync::Arc;

use ::cron::Schedule;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use tracing::debug;

use super::{ScheduleExpression, ScheduleOperator, ScheduleProvider};
use crate::error::{Result, TimerError};

/// Schedule provider backed by the `cron` crate.
///
/// Day-of-week values follow the `0`/`7` = Sunday numbering of schedule
/// expressions and are translated to the crate's `1` = Sunday numbering.
/// Zones must be `UTC`, `Z`, `GMT` or a fixed offset such as `+02:00`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CronScheduleProvider;

impl ScheduleProvider for CronScheduleProvider {
    fn create_operator(&self, expression: &ScheduleExpression) -> Result<ScheduleOperator> {
        let pattern = cron_pattern(expression)?;
        let schedule = Schedule::from_str(&pattern).map_err(|e| TimerError::InvalidSchedule {
            expression: pattern.clone(),
            reason: e.to_string(),
        })?;
        let zone = parse_zone(expression.zone.as_deref())?;
        let (start, end) = (expression.start, expression.end);
        debug!("Compiled schedule '{}' in zone {}", pattern, zone);

        Ok(Arc::new(move |last: Option<DateTime<Utc>>| {
            // The iterator yields instants strictly after its argument, so a
            // lower bound that must itself be eligible moves back by one millisecond.
            let floor = match (last, start) {
                (Some(last), Some(start)) if last < start => {
                    start.checked_sub_signed(TimeDelta::milliseconds(1))?
                }
                (Some(last), _) => last,
                (None, start) => start
                    .unwrap_or_else(Utc::now)
                    .checked_sub_signed(TimeDelta::milliseconds(1))?,
            };
            let next = schedule
                .after(&floor.with_timezone(&zone))
                .next()?
                .with_timezone(&Utc);
            match end {
                Some(end) if next > end => None,
                _ => Some(next),
            }
        }))
    }
}

fn cron_pattern(expression: &ScheduleExpression) -> Result<String> {
    let fields = [
        ("second", expression.second.as_str()),
        ("minute", expression.minute.as_str()),
        ("hour", expression.hour.as_str()),
        ("dayOfMonth", expression.day_of_month.as_str()),
        ("month", expression.month.as_str()),
        ("dayOfWeek", expression.day_of_week.as_str()),
        ("year", expression.year.as_str()),
    ];
    for (name, value) in fields {
        if value.trim().is_empty() || value.contains(char::is_whitespace) {
            return Err(TimerError::InvalidSchedule {
                expression: expression.to_string(),
                reason: format!("{name} must be a single non-empty token"),
            });
        }
    }
    Ok(format!(
        "{} {} {} {} {} {} {}",
        expression.second,
        expression.minute,
        expression.hour,
        expression.day_of_month,
        expression.month,
        translate_day_of_week(&expression.day_of_week),
        expression.year
    ))
}

fn translate_day_of_week(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            if let Some(days) = expand_through_sunday(range, step) {
                return days;
            }
            match step {
                Some(step) => format!("{}/{}", translate_day_range(range), step),
                None => translate_day_range(range),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// A numeric range ending on day 7 ends on Sunday, which is day 1 after
/// renumbering and would invert the range; such ranges become explicit lists.
fn expand_through_sunday(range: &str, step: Option<&str>) -> Option<String> {
    let (low, high) = range.split_once('-')?;
    let (low, high) = (low.parse::<u8>().ok()?, high.parse::<u8>().ok()?);
    let step = match step {
        Some(step) => step.parse::<usize>().ok().filter(|step| *step > 0)?,
        None => 1,
    };
    if high != 7 || low > high {
        return None;
    }
    let mut days: Vec<u8> = (low..=high).step_by(step).map(|day| (day % 7) + 1).collect();
    days.sort_unstable();
    days.dedup();
    Some(
        days.iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn translate_day_range(range: &str) -> String {
    range
        .split('-')
        .map(|day| match day.parse::<u8>() {
            Ok(day) => ((day % 7) + 1).to_string(),
            Err(_) => day.to_string(),
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn parse_zone(zone: Option<&str>) -> Result<FixedOffset> {
    let utc = FixedOffset::east_opt(0).ok_or_else(|| TimerError::InvalidSchedule {
        expression: "UTC".to_string(),
        reason: "zero offset rejected".to_string(),
    })?;
    match zone.map(str::trim) {
        None | Some("") => Ok(utc),
        Some(z) if z.eq_ignore_ascii_case("utc") || z.eq_ignore_ascii_case("gmt") || z == "Z" => {
            Ok(utc)
        }
        Some(z) => FixedOffset::from_str(z).map_err(|e| TimerError::InvalidSchedule {
            expression: z.to_string(),
            reason: format!("unsupported zone: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn operator(expression: ScheduleExpression) -> ScheduleOperator {
        CronScheduleProvider.create_operator(&expression).unwrap()
    }

    #[test]
    fn default_expression_fires_at_midnight() {
        let op = operator(ScheduleExpression::default().start(at(2024, 3, 10, 8, 30, 0)));
        assert_eq!(op(None), Some(at(2024, 3, 11, 0, 0, 0)));
        assert_eq!(op(Some(at(2024, 3, 11, 0, 0, 0))), Some(at(2024, 3, 12, 0, 0, 0)));
    }

    #[test]
    fn first_timeout_includes_start_instant() {
        let op = operator(
            ScheduleExpression::default()
                .minute("*/15")
                .hour("*")
                .start(at(2024, 3, 10, 8, 30, 0)),
        );
        assert_eq!(op(None), Some(at(2024, 3, 10, 8, 30, 0)));
        assert_eq!(op(Some(at(2024, 3, 10, 8, 30, 0))), Some(at(2024, 3, 10, 8, 45, 0)));
    }

    #[test]
    fn end_bound_stops_the_schedule() {
        let op = operator(
            ScheduleExpression::default()
                .hour("12")
                .start(at(2024, 1, 1, 0, 0, 0))
                .end(at(2024, 1, 2, 13, 0, 0)),
        );
        assert_eq!(op(None), Some(at(2024, 1, 1, 12, 0, 0)));
        assert_eq!(op(Some(at(2024, 1, 1, 12, 0, 0))), Some(at(2024, 1, 2, 12, 0, 0)));
        assert_eq!(op(Some(at(2024, 1, 2, 12, 0, 0))), None);
    }

    #[test]
    fn fixed_offset_zone_shifts_wall_clock() {
        let op = operator(
            ScheduleExpression::default()
                .hour("9")
                .zone("+02:00")
                .start(at(2024, 6, 1, 0, 0, 0)),
        );
        assert_eq!(op(None), Some(at(2024, 6, 1, 7, 0, 0)));
    }

    #[test]
    fn day_of_week_uses_sunday_zero_numbering() {
        assert_eq!(translate_day_of_week("0"), "1");
        assert_eq!(translate_day_of_week("7"), "1");
        assert_eq!(translate_day_of_week("1-5"), "2-6");
        assert_eq!(translate_day_of_week("Mon,3/2"), "Mon,4/2");
        assert_eq!(translate_day_of_week("*"), "*");
        assert_eq!(translate_day_of_week("6-7"), "1,7");
        assert_eq!(translate_day_of_week("5-7"), "1,6,7");
        assert_eq!(translate_day_of_week("0-7"), "1,2,3,4,5,6,7");
        assert_eq!(translate_day_of_week("1-7/2"), "1,2,4,6");
        assert_eq!(translate_day_of_week("1,6-7"), "2,1,7");

        // 2024-03-10 is a Sunday.
        let op = operator(
            ScheduleExpression::default()
                .day_of_week("0")
                .start(at(2024, 3, 4, 0, 0, 0)),
        );
        assert_eq!(op(None), Some(at(2024, 3, 10, 0, 0, 0)));
    }

    #[test]
    fn weekend_range_ending_on_sunday() {
        // 2024-03-08 is a Friday.
        let op = operator(
            ScheduleExpression::default()
                .day_of_week("6-7")
                .start(at(2024, 3, 8, 0, 0, 0)),
        );
        assert_eq!(op(None), Some(at(2024, 3, 9, 0, 0, 0)));
        assert_eq!(op(Some(at(2024, 3, 9, 0, 0, 0))), Some(at(2024, 3, 10, 0, 0, 0)));
        assert_eq!(op(Some(at(2024, 3, 10, 0, 0, 0))), Some(at(2024, 3, 16, 0, 0, 0)));

        let friday_to_sunday = ScheduleExpression::default().day_of_week("5-7");
        assert!(CronScheduleProvider.create_operator(&friday_to_sunday).is_ok());
    }

    #[test]
    fn rejects_named_zones_and_bad_fields() {
        let named = ScheduleExpression::default().zone("Europe/Paris");
        assert!(matches!(
            CronScheduleProvider.create_operator(&named),
            Err(TimerError::InvalidSchedule { .. })
        ));

        let bad = ScheduleExpression::default().hour("25");
        assert!(matches!(
            CronScheduleProvider.create_operator(&bad),
            Err(TimerError::InvalidSchedule { .. })
        ));

        let spaced = ScheduleExpression::default().minute("1 2");
        assert!(CronScheduleProvider.create_operator(&spaced).is_err());
    }
}
