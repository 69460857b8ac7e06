//! Fixed textual formats for temporal column values.

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc,
};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S%.3f";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn format_datetime(value: NaiveDateTime) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

/// `YYYY-MM-DD HH:MM:SS`, with a fractional part only when one is present.
pub fn format_datetime_compact(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

/// UTC ISO-8601 with millisecond precision, e.g. `2024-01-02T03:04:05.678Z`.
pub fn format_instant_iso<Tz: TimeZone>(value: &DateTime<Tz>) -> String {
    value
        .with_timezone(&Utc)
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

const DATETIME_INPUTS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

fn parse_with_offset(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .or_else(|| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z").ok())
}

/// Reads a date from parameter text. Date-times keep the date as written.
pub fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .ok()
        .or_else(|| parse_datetime_text(text).map(|dt| dt.date()))
}

pub fn parse_time_text(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f")
        .ok()
        .or_else(|| NaiveTime::parse_from_str(text, "%H:%M").ok())
}

/// Reads a zone-less date-time. An offset, if present, is ignored; a bare date is midnight.
pub fn parse_datetime_text(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    DATETIME_INPUTS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| parse_with_offset(text).map(|dt| dt.naive_local()))
        .or_else(|| {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Reads an instant. Text without an offset is taken as UTC.
pub fn parse_instant_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    parse_with_offset(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| parse_datetime_text(text).map(|naive| Utc.from_utc_datetime(&naive)))
}

/// Standard (non daylight-saving) UTC offset of `tz`, in seconds.
///
/// Taken as the smaller of the January and July offsets of 1970.
fn standard_offset_secs<Tz: TimeZone>(tz: &Tz) -> i64 {
    let probe = |month: u32| {
        NaiveDate::from_ymd_opt(1970, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| i64::from(tz.offset_from_utc_datetime(&naive).fix().local_minus_utc()))
            .unwrap_or_default()
    };
    probe(1).min(probe(7))
}

fn observes_dst<Tz: TimeZone>(value: &DateTime<Tz>, standard: i64) -> bool {
    i64::from(value.offset().fix().local_minus_utc()) > standard
}

/// Shifts a local date-time read from a zone-less column by the difference between its own
/// daylight-saving state and the state at `now`.
pub fn dst_corrected<Tz: TimeZone>(value: DateTime<Tz>, now: &DateTime<Tz>) -> DateTime<Tz> {
    let standard = standard_offset_secs(&value.timezone());
    let mut shift = 0;
    if !observes_dst(&value, standard) {
        shift += standard;
    }
    if !observes_dst(now, standard) {
        shift -= standard;
    }
    value + Duration::seconds(shift)
}

/// Formats a zone-less date/time column value as local text.
///
/// Values on the epoch date keep only their time part and values at local midnight keep only
/// their date part.
pub fn format_local_datetime<Tz: TimeZone>(value: DateTime<Tz>, now: &DateTime<Tz>) -> String {
    let text = format_datetime(dst_corrected(value, now).naive_local());
    if let Some(time) = text.strip_prefix("1970-01-01 ") {
        time.to_string()
    } else if let Some(date) = text.strip_suffix(" 00:00:00.000") {
        date.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Rome;

    fn rome(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<chrono_tz::Tz> {
        Rome.with_ymd_and_hms(y, m, d, h, mi, 0).single().expect("unambiguous local time")
    }

    #[test]
    fn fixed_formats() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 678)
            .unwrap();
        assert_eq!(format_date(dt.date()), "2024-01-02");
        assert_eq!(format_time(dt.time()), "03:04:05.678");
        assert_eq!(format_datetime(dt), "2024-01-02 03:04:05.678");
        assert_eq!(format_instant_iso(&Utc.from_utc_datetime(&dt)), "2024-01-02T03:04:05.678Z");
    }

    #[test]
    fn parameter_text_parses_to_temporal_values() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(parse_date_text("2024-01-02"), Some(day));
        assert_eq!(parse_date_text("2024-01-02T23:30:00.000+01:00"), Some(day));
        assert_eq!(parse_date_text("02/01/2024"), None);

        let at = day.and_hms_opt(10, 11, 12).unwrap();
        assert_eq!(parse_datetime_text("2024-01-02 10:11:12"), Some(at));
        assert_eq!(parse_datetime_text("2024-01-02T10:11:12.000+02:00"), Some(at));
        assert_eq!(parse_datetime_text("2024-01-02"), day.and_hms_opt(0, 0, 0));

        assert_eq!(parse_time_text("10:11"), NaiveTime::from_hms_opt(10, 11, 0));
        assert_eq!(
            parse_instant_text("2024-01-02T10:11:12+02:00"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 8, 11, 12).unwrap())
        );
        assert_eq!(
            parse_instant_text("2024-01-02 10:11:12"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 11, 12).unwrap())
        );
    }

    #[test]
    fn compact_datetime_omits_zero_fraction() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(3, 4, 5).unwrap();
        assert_eq!(format_datetime_compact(dt), "2024-01-02 03:04:05");
    }

    #[test]
    fn dst_correction_is_noop_when_states_match() {
        let winter = rome(2024, 1, 15, 10, 0);
        let also_winter = rome(2024, 2, 1, 12, 0);
        assert_eq!(dst_corrected(winter, &also_winter), winter);

        let summer = rome(2024, 7, 15, 10, 0);
        let also_summer = rome(2024, 8, 1, 12, 0);
        assert_eq!(dst_corrected(summer, &also_summer), summer);
    }

    #[test]
    fn dst_correction_shifts_across_states() {
        let winter = rome(2024, 1, 15, 10, 0);
        let summer_now = rome(2024, 7, 1, 9, 0);
        let shifted = dst_corrected(winter, &summer_now);
        assert_eq!(format_datetime(shifted.naive_local()), "2024-01-15 11:00:00.000");

        let summer = rome(2024, 7, 15, 10, 0);
        let winter_now = rome(2024, 1, 1, 9, 0);
        let shifted = dst_corrected(summer, &winter_now);
        assert_eq!(format_datetime(shifted.naive_local()), "2024-07-15 09:00:00.000");
    }

    #[test]
    fn utc_zone_never_shifts() {
        let value = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(dst_corrected(value, &now), value);
    }

    #[test]
    fn local_text_trims_epoch_date_and_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        let time_only = Utc.with_ymd_and_hms(1970, 1, 1, 12, 30, 0).unwrap();
        assert_eq!(format_local_datetime(time_only, &now), "12:30:00.000");

        let date_only = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
        assert_eq!(format_local_datetime(date_only, &now), "2024-03-05");

        let full = Utc.with_ymd_and_hms(2024, 3, 5, 8, 1, 2).unwrap();
        assert_eq!(format_local_datetime(full, &now), "2024-03-05 08:01:02.000");
    }
}
