use crate::reading::Reading;
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CAPTURE_TIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

/// Civil timezone capture times are rendered in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl TargetZone {
    pub fn format(&self, instant: DateTime<Utc>) -> String {
        match self {
            TargetZone::Named(tz) => instant
                .with_timezone(tz)
                .format(CAPTURE_TIME_FORMAT)
                .to_string(),
            TargetZone::Fixed(offset) => instant
                .with_timezone(offset)
                .format(CAPTURE_TIME_FORMAT)
                .to_string(),
        }
    }
}

impl fmt::Display for TargetZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetZone::Named(tz) => write!(f, "{}", tz.name()),
            TargetZone::Fixed(offset) => write!(f, "UTC{offset}"),
        }
    }
}

impl FromStr for TargetZone {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("timezone identifier is empty".to_string());
        }
        if let Some(offset) = parse_fixed_offset(trimmed) {
            return Ok(TargetZone::Fixed(offset));
        }
        trimmed
            .parse::<Tz>()
            .map(TargetZone::Named)
            .map_err(|_| format!("unknown timezone {trimmed:?}"))
    }
}

/// Accepts `UTC`, `Z`, `+08:00`, `-0530`, `UTC+8` and `GMT-03:30`.
fn parse_fixed_offset(raw: &str) -> Option<FixedOffset> {
    let upper = raw.to_ascii_uppercase();
    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);
    if rest.is_empty() || rest == "Z" {
        return FixedOffset::east_opt(0);
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'+' => (1, &rest[1..]),
        b'-' => (-1, &rest[1..]),
        _ => return None,
    };
    if !digits.is_ascii() {
        return None;
    }
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at(2),
        None => (digits, "0"),
    };
    if hours.is_empty() || !hours.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !minutes.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// A reading stamped with its receipt time, waiting for the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub received_at: DateTime<Utc>,
    pub capture_time: String,
    pub payload: Reading,
}

impl NormalizedRecord {
    pub fn document(&self) -> StoredDocument {
        StoredDocument {
            capture_time: self.capture_time.clone(),
            data: self.payload.clone(),
        }
    }
}

/// Shape written to the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub capture_time: String,
    pub data: Reading,
}

pub fn normalize(reading: Reading, now: DateTime<Utc>, zone: &TargetZone) -> NormalizedRecord {
    NormalizedRecord {
        received_at: now,
        capture_time: zone.format(now),
        payload: reading,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().expect("valid instant")
    }

    fn reading(value: serde_json::Value) -> Reading {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn formats_in_fixed_offset() {
        let zone: TargetZone = "UTC+8".parse().expect("zone");
        let record = normalize(
            reading(json!({"temp": 22.5, "humidity": 60})),
            at(2024, 3, 1, 12, 0, 0),
            &zone,
        );
        assert_eq!(record.capture_time, "01-03-2024 20:00:00");
        assert_eq!(record.received_at, at(2024, 3, 1, 12, 0, 0));
    }

    #[test]
    fn formats_in_named_zone_across_midnight() {
        let zone: TargetZone = "Asia/Kuala_Lumpur".parse().expect("zone");
        let record = normalize(Reading::new(), at(2023, 12, 31, 18, 30, 5), &zone);
        assert_eq!(record.capture_time, "01-01-2024 02:30:05");
    }

    #[test]
    fn named_zone_follows_daylight_saving() {
        let zone: TargetZone = "Europe/Berlin".parse().expect("zone");
        assert_eq!(zone.format(at(2024, 1, 15, 12, 0, 0)), "15-01-2024 13:00:00");
        assert_eq!(zone.format(at(2024, 7, 15, 12, 0, 0)), "15-07-2024 14:00:00");
    }

    #[test]
    fn same_inputs_give_identical_records() {
        let zone: TargetZone = "+08:00".parse().expect("zone");
        let now = at(2024, 3, 1, 12, 0, 0);
        let payload = reading(json!({"temp": 22.5, "nested": {"a": [1, 2]}}));
        let first = normalize(payload.clone(), now, &zone);
        let second = normalize(payload, now, &zone);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first.document()).expect("json"),
            serde_json::to_vec(&second.document()).expect("json")
        );
    }

    #[test]
    fn empty_reading_still_produces_a_record() {
        let zone = TargetZone::Fixed(FixedOffset::east_opt(0).expect("offset"));
        let record = normalize(Reading::new(), at(2024, 3, 1, 0, 0, 0), &zone);
        assert_eq!(
            serde_json::to_value(record.document()).expect("json"),
            json!({"capture_time": "01-03-2024 00:00:00", "data": {}})
        );
    }

    #[test]
    fn parses_offset_spellings() {
        let cases = [
            ("UTC", 0),
            ("z", 0),
            ("+08:00", 8 * 3600),
            ("-0530", -(5 * 3600 + 30 * 60)),
            ("UTC+8", 8 * 3600),
            ("gmt-03:30", -(3 * 3600 + 30 * 60)),
        ];
        for (raw, seconds) in cases {
            let zone: TargetZone = raw.parse().expect(raw);
            assert_eq!(
                zone,
                TargetZone::Fixed(FixedOffset::east_opt(seconds).expect("offset")),
                "{raw}"
            );
        }
    }

    #[test]
    fn rejects_unknown_zones() {
        assert!("Mars/Olympus_Mons".parse::<TargetZone>().is_err());
        assert!("UTC+25".parse::<TargetZone>().is_err());
        assert!("".parse::<TargetZone>().is_err());
    }

    #[test]
    fn rejects_non_ascii_offsets_without_panicking() {
        assert!("+1\u{e9}1".parse::<TargetZone>().is_err());
        assert!("UTC-\u{e9}9".parse::<TargetZone>().is_err());
        assert!("+\u{663}\u{663}".parse::<TargetZone>().is_err());
    }
}
