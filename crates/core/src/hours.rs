//! Working-hours window evaluated per target timezone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};

/// Whole-hour UTC offsets considered when filtering discovery inputs.
pub const MIN_OFFSET: i32 = -12;
pub const MAX_OFFSET: i32 = 12;

/// Inclusive range of UTC offsets, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TzRange {
    pub from: i32,
    pub to: i32,
}

impl TzRange {
    pub fn contains(&self, offset: i32) -> bool {
        (self.from..=self.to).contains(&offset)
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

/// Whether a local wall-clock time falls inside `[earliest, latest]`,
/// compared to the minute.
///
/// Equal bounds admit the whole day. `earliest > latest` is a window that
/// wraps over midnight.
pub fn within_window(local: NaiveTime, earliest: NaiveTime, latest: NaiveTime) -> bool {
    let (local, earliest, latest) = (minute_of_day(local), minute_of_day(earliest), minute_of_day(latest));
    if earliest == latest {
        true
    } else if earliest < latest {
        earliest <= local && local <= latest
    } else {
        local >= earliest || local <= latest
    }
}

/// Offsets whose local time at `now` is inside the working window and whose
/// local weekday is not skipped.
///
/// Consecutive offsets are merged into ranges. A range never spans two local
/// dates, so a window straddling midnight yields two disjoint ranges.
pub fn timezones_between(
    now: DateTime<Utc>,
    earliest: NaiveTime,
    latest: NaiveTime,
    skip_days: &[Weekday],
) -> Vec<TzRange> {
    let mut ranges: Vec<TzRange> = Vec::new();
    let mut last_date: Option<NaiveDate> = None;

    for offset in MIN_OFFSET..=MAX_OFFSET {
        let local = (now + Duration::hours(offset as i64)).naive_utc();
        let permitted = !skip_days.contains(&local.weekday())
            && within_window(local.time(), earliest, latest);
        if !permitted {
            continue;
        }

        match ranges.last_mut() {
            Some(r) if r.to == offset - 1 && last_date == Some(local.date()) => r.to = offset,
            _ => ranges.push(TzRange {
                from: offset,
                to: offset,
            }),
        }
        last_date = Some(local.date());
    }

    ranges
}
