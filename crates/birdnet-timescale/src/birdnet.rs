//! BirdNET detection payloads and their normalized, storable form.
//!
//! A [`DetectionRecord`] is what BirdNET publishes on MQTT: the detection
//! date and time-of-day arrive as two separate strings, local to the station.
//! [`DetectionRecord::to_event`] resolves them against an IANA timezone and
//! produces a [`DetectionEvent`], the row written to TimescaleDB.

use chrono::{DateTime, FixedOffset, LocalResult, NaiveDateTime, Offset, TimeZone, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BridgeError, Result};

/// Layout of `"{Date} {Time}"` in BirdNET payloads.
pub const DATE_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Image metadata BirdNET attaches to a detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct BirdImage {
    #[serde(rename = "URL", deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub scientific_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub license_name: String,
    #[serde(rename = "LicenseURL", deserialize_with = "null_as_default")]
    pub license_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub author_name: String,
    #[serde(rename = "AuthorURL", deserialize_with = "null_as_default")]
    pub author_url: String,
    pub cached_at: Option<DateTime<FixedOffset>>,
    #[serde(deserialize_with = "null_as_default")]
    pub source_provider: String,
}

/// A detection as published by BirdNET.
///
/// Missing fields (and `null` for non-optional ones) decode to their default
/// value; only invalid JSON or a mistyped field fails the decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DetectionRecord {
    #[serde(rename = "ID", deserialize_with = "null_as_default")]
    pub id: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub source_node: String,
    #[serde(deserialize_with = "null_as_default")]
    pub date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub source: String,
    pub begin_time: Option<DateTime<FixedOffset>>,
    pub end_time: Option<DateTime<FixedOffset>>,
    #[serde(deserialize_with = "null_as_default")]
    pub species_code: String,
    #[serde(deserialize_with = "null_as_default")]
    pub scientific_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub common_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub confidence: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub latitude: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub longitude: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub threshold: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub sensitivity: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub clip_name: String,
    /// Analysis duration in nanoseconds.
    #[serde(deserialize_with = "null_as_default")]
    pub processing_time: i64,
    pub results: Option<String>,
    pub review: Option<String>,
    pub comments: Option<String>,
    pub lock: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub verified: String,
    #[serde(deserialize_with = "null_as_default")]
    pub locked: bool,
    pub bird_image: Option<BirdImage>,
}

/// A detection with an absolute timestamp, ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionEvent {
    pub time: DateTime<FixedOffset>,
    pub source_node: String,
    pub source: String,
    pub begin_time: Option<DateTime<FixedOffset>>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub species_code: String,
    pub scientific_name: String,
    pub common_name: String,
    pub confidence: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub threshold: f64,
    pub sensitivity: f64,
}

impl DetectionRecord {
    /// Decode a raw MQTT payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Resolve `Date` + `Time` in `timezone` and build the storable event.
    ///
    /// Every other field is copied as-is; values are not range-checked.
    pub fn to_event(&self, timezone: &str) -> Result<DetectionEvent> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| BridgeError::InvalidTimezone(timezone.to_string()))?;

        let input = format!("{} {}", self.date, self.time);
        let naive = parse_local(&self.date, &self.time).map_err(|reason| {
            BridgeError::TimeParse {
                input: input.clone(),
                reason,
            }
        })?;

        Ok(DetectionEvent {
            time: resolve_local(&tz, &naive),
            source_node: self.source_node.clone(),
            source: self.source.clone(),
            begin_time: self.begin_time,
            end_time: self.end_time,
            species_code: self.species_code.clone(),
            scientific_name: self.scientific_name.clone(),
            common_name: self.common_name.clone(),
            confidence: self.confidence,
            latitude: self.latitude,
            longitude: self.longitude,
            threshold: self.threshold,
            sensitivity: self.sensitivity,
        })
    }
}

/// Parse `date` (`YYYY-MM-DD`) and `time` (`H:MM:SS` or `HH:MM:SS`).
///
/// chrono alone accepts single-digit month, day, minute and second fields and
/// a leap second; those are rejected here.
fn parse_local(date: &str, time: &str) -> std::result::Result<NaiveDateTime, String> {
    if !digits_match(date, "dddd-dd-dd") {
        return Err(format!("date '{date}' does not match YYYY-MM-DD"));
    }
    if !digits_match(time, "dd:dd:dd") && !digits_match(time, "d:dd:dd") {
        return Err(format!("time '{time}' does not match HH:MM:SS"));
    }

    let naive = NaiveDateTime::parse_from_str(&format!("{date} {time}"), DATE_TIME_LAYOUT)
        .map_err(|e| e.to_string())?;
    if naive.nanosecond() >= 1_000_000_000 {
        return Err("second out of range".to_string());
    }
    Ok(naive)
}

/// `pattern` uses `d` for an ASCII digit; every other byte must match exactly.
fn digits_match(value: &str, pattern: &str) -> bool {
    value.len() == pattern.len()
        && value
            .bytes()
            .zip(pattern.bytes())
            .all(|(v, p)| if p == b'd' { v.is_ascii_digit() } else { v == p })
}

/// Pin a wall-clock time to an instant in `tz`.
///
/// Ambiguous times (clocks turned back) take the earlier instant. Times that
/// fall into a gap (clocks turned forward) are read with the offset in force
/// after the transition, which lands them before the gap.
fn resolve_local(tz: &Tz, naive: &NaiveDateTime) -> DateTime<FixedOffset> {
    match tz.from_local_datetime(naive) {
        LocalResult::Single(dt) => dt.fixed_offset(),
        LocalResult::Ambiguous(earliest, _) => earliest.fixed_offset(),
        LocalResult::None => {
            let guess = tz.offset_from_utc_datetime(naive).fix();
            let utc = *naive - chrono::Duration::seconds(guess.local_minus_utc() as i64);
            let offset = tz.offset_from_utc_datetime(&utc).fix();
            let utc = *naive - chrono::Duration::seconds(offset.local_minus_utc() as i64);
            tz.from_utc_datetime(&utc).fixed_offset()
        }
    }
}

/// Treat an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROBIN: &str = r#"{
        "Date": "2024-05-01",
        "Time": "06:15:00",
        "SpeciesCode": "AMRO",
        "ScientificName": "Turdus migratorius",
        "CommonName": "American Robin",
        "Confidence": 0.87
    }"#;

    fn robin() -> DetectionRecord {
        DetectionRecord::from_payload(ROBIN.as_bytes()).unwrap()
    }

    #[test]
    fn test_to_event_resolves_timezone() {
        let event = robin().to_event("America/Los_Angeles").unwrap();
        assert_eq!(event.time.to_rfc3339(), "2024-05-01T06:15:00-07:00");
        assert_eq!(event.species_code, "AMRO");
        assert_eq!(event.scientific_name, "Turdus migratorius");
        assert_eq!(event.common_name, "American Robin");
        assert!((event.confidence - 0.87).abs() < f64::EPSILON);
    }

    #[test]
    fn test_to_event_same_wall_clock_different_zones() {
        let record = robin();
        let la = record.to_event("America/Los_Angeles").unwrap();
        let utc = record.to_event("UTC").unwrap();
        assert_eq!(utc.time.to_rfc3339(), "2024-05-01T06:15:00+00:00");
        assert_eq!((la.time - utc.time).num_hours(), 7);
    }

    #[test]
    fn test_to_event_winter_offset() {
        let mut record = robin();
        record.date = "2024-01-15".into();
        let event = record.to_event("America/Los_Angeles").unwrap();
        assert_eq!(event.time.to_rfc3339(), "2024-01-15T06:15:00-08:00");
    }

    #[test]
    fn test_unknown_timezone() {
        let err = robin().to_event("Mars/Olympus_Mons").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTimezone(ref tz) if tz == "Mars/Olympus_Mons"));
    }

    #[test]
    fn test_malformed_date() {
        let mut record = robin();
        record.date = "13-99-9999".into();
        let err = record.to_event("America/Los_Angeles").unwrap_err();
        assert!(matches!(err, BridgeError::TimeParse { ref input, .. } if input == "13-99-9999 06:15:00"));
    }

    #[test]
    fn test_malformed_time() {
        let mut record = robin();
        record.time = "6:15".into();
        assert!(record.to_event("UTC").is_err());

        record.time = "25:00:00".into();
        assert!(record.to_event("UTC").is_err());
    }

    #[test]
    fn test_date_requires_two_digit_month_and_day() {
        let mut record = robin();
        record.date = "2024-5-1".into();
        record.time = "6:15:00".into();
        assert!(matches!(
            record.to_event("America/Los_Angeles"),
            Err(BridgeError::TimeParse { ref input, .. }) if input == "2024-5-1 6:15:00"
        ));

        record.date = "2024-05-01".into();
        let event = record.to_event("America/Los_Angeles").unwrap();
        assert_eq!(event.time.to_rfc3339(), "2024-05-01T06:15:00-07:00");
    }

    #[test]
    fn test_minutes_and_seconds_need_two_digits() {
        let mut record = robin();
        record.time = "06:5:00".into();
        assert!(record.to_event("UTC").is_err());

        record.time = "06:15:0".into();
        assert!(record.to_event("UTC").is_err());

        record.time = " 06:15:00".into();
        assert!(record.to_event("UTC").is_err());
    }

    #[test]
    fn test_leap_second_rejected() {
        let mut record = robin();
        record.time = "06:15:60".into();
        let err = record.to_event("UTC").unwrap_err();
        assert!(
            matches!(err, BridgeError::TimeParse { ref reason, .. } if reason == "second out of range")
        );

        record.time = "23:59:59".into();
        assert!(record.to_event("UTC").is_ok());
    }

    #[test]
    fn test_missing_date_and_time_fails() {
        let record = DetectionRecord::default();
        assert!(matches!(
            record.to_event("UTC"),
            Err(BridgeError::TimeParse { .. })
        ));
    }

    #[test]
    fn test_ambiguous_time_takes_earlier_instant() {
        let mut record = robin();
        record.date = "2024-11-03".into();
        record.time = "01:30:00".into();
        let event = record.to_event("America/Los_Angeles").unwrap();
        assert_eq!(event.time.to_rfc3339(), "2024-11-03T01:30:00-07:00");
    }

    #[test]
    fn test_gap_time_uses_post_transition_offset() {
        let mut record = robin();
        record.date = "2024-03-10".into();
        record.time = "02:30:00".into();
        let event = record.to_event("America/Los_Angeles").unwrap();
        assert_eq!(event.time.to_rfc3339(), "2024-03-10T01:30:00-08:00");
    }

    #[test]
    fn test_passthrough_fields_unchecked() {
        let mut record = robin();
        record.confidence = 7.5;
        record.latitude = -123.0;
        record.longitude = 999.0;
        record.threshold = -1.0;
        record.sensitivity = 0.0;
        record.source_node = "node-1".into();
        record.source = "rtsp://cam".into();
        let event = record.to_event("UTC").unwrap();
        assert_eq!(event.confidence, 7.5);
        assert_eq!(event.latitude, -123.0);
        assert_eq!(event.longitude, 999.0);
        assert_eq!(event.threshold, -1.0);
        assert_eq!(event.source_node, "node-1");
        assert_eq!(event.source, "rtsp://cam");
    }

    #[test]
    fn test_decode_full_payload() {
        let payload = r#"{
            "ID": 42,
            "SourceNode": "backyard",
            "Date": "2024-05-01",
            "Time": "06:15:00",
            "Source": "rtsp://192.168.1.10/stream",
            "BeginTime": "2024-05-01T06:14:57.5-07:00",
            "EndTime": "2024-05-01T06:15:00.5-07:00",
            "SpeciesCode": "AMRO",
            "ScientificName": "Turdus migratorius",
            "CommonName": "American Robin",
            "Confidence": 0.87,
            "Latitude": 47.6,
            "Longitude": -122.3,
            "Threshold": 0.7,
            "Sensitivity": 1.0,
            "ClipName": "clips/amro.wav",
            "ProcessingTime": 123456789,
            "Results": null,
            "Review": "correct",
            "Comments": null,
            "Lock": null,
            "Verified": "correct",
            "Locked": true,
            "BirdImage": {
                "URL": "https://example.org/amro.jpg",
                "ScientificName": "Turdus migratorius",
                "LicenseName": "CC BY 2.0",
                "LicenseURL": "https://creativecommons.org/licenses/by/2.0/",
                "AuthorName": "someone",
                "AuthorURL": "https://example.org/someone",
                "CachedAt": "2024-04-30T12:00:00Z",
                "SourceProvider": "wikimedia"
            },
            "SomethingNew": [1, 2, 3]
        }"#;

        let record = DetectionRecord::from_payload(payload.as_bytes()).unwrap();
        assert_eq!(record.id, 42);
        assert_eq!(record.source_node, "backyard");
        assert_eq!(record.processing_time, 123_456_789);
        assert_eq!(record.results, None);
        assert_eq!(record.review.as_deref(), Some("correct"));
        assert!(record.locked);
        let image = record.bird_image.as_ref().unwrap();
        assert_eq!(image.url, "https://example.org/amro.jpg");
        assert_eq!(image.source_provider, "wikimedia");
        assert!(image.cached_at.is_some());

        let event = record.to_event("America/Los_Angeles").unwrap();
        assert_eq!(
            event.begin_time.unwrap().to_rfc3339(),
            "2024-05-01T06:14:57.500-07:00"
        );
        assert!(event.end_time.unwrap() > event.begin_time.unwrap());
    }

    #[test]
    fn test_decode_missing_and_null_fields_default() {
        let record =
            DetectionRecord::from_payload(br#"{"CommonName": null, "Confidence": null}"#).unwrap();
        assert_eq!(record.common_name, "");
        assert_eq!(record.confidence, 0.0);
        assert_eq!(record.begin_time, None);
        assert_eq!(record.bird_image, None);
    }

    #[test]
    fn test_optional_empty_string_is_present() {
        let record = DetectionRecord::from_payload(br#"{"Comments": ""}"#).unwrap();
        assert_eq!(record.comments.as_deref(), Some(""));
        assert_eq!(record.review, None);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(matches!(
            DetectionRecord::from_payload(b"not json"),
            Err(BridgeError::Decode(_))
        ));
        assert!(DetectionRecord::from_payload(br#"{"Confidence": "high"}"#).is_err());
    }
}
