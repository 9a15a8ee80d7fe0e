//! Extraction of a [`Setting`] (a place and a time) from the EXIF data
//! embedded in a downloaded item.
//!
//! Only the captured prefix of the download stream is parsed (see
//! [`repo::hashsink`](crate::repo::hashsink)); EXIF always lives near the
//! head of the container formats we care about. Media without EXIF, or with
//! EXIF we cannot read, simply yields `None`. It is never an item failure.

use std::io::Cursor;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use exif::{Exif, In, Reader, Tag, Value};
use serde::{Deserialize, Serialize};

/// Where and when a media item originated, as recorded by the capturing
/// device. Altitude is meters relative to sea level (negative is below).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub origin_time: DateTime<Utc>,
}

/// Derive a [`Setting`] from the first bytes of a media file. Returns
/// `None` unless coordinates, altitude, and timestamp are all present.
pub fn setting_from_prefix(prefix: &[u8]) -> Option<Setting> {
    if prefix.is_empty() {
        return None;
    }
    let parsed = Reader::new()
        .read_from_container(&mut Cursor::new(prefix))
        .ok()?;

    let latitude = coordinate(&parsed, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S")?;
    let longitude = coordinate(&parsed, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W")?;
    let altitude = altitude(&parsed)?;
    let origin_time = timestamp(&parsed)?;

    Some(Setting {
        latitude,
        longitude,
        altitude,
        origin_time,
    })
}

/// Decode a degrees/minutes/seconds rational triple, negated when the
/// reference hemisphere matches `negative_ref`.
fn coordinate(parsed: &Exif, tag: Tag, ref_tag: Tag, negative_ref: &str) -> Option<f64> {
    let field = parsed.get_field(tag, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    if parts.len() < 3 {
        return None;
    }
    let degrees = parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0;

    let reference = ascii_field(parsed, ref_tag)?;
    Some(if reference == negative_ref {
        -degrees
    } else {
        degrees
    })
}

fn altitude(parsed: &Exif) -> Option<f64> {
    let field = parsed.get_field(Tag::GPSAltitude, In::PRIMARY)?;
    let Value::Rational(parts) = &field.value else {
        return None;
    };
    let mut altitude = parts.first()?.to_f64();

    // GPSAltitudeRef 0 is above sea level, 1 is below; we store relative
    // to sea level.
    let reference = parsed.get_field(Tag::GPSAltitudeRef, In::PRIMARY)?;
    if reference.value.get_uint(0)? == 1 && altitude > 0.0 {
        altitude = -altitude;
    }
    Some(altitude)
}

fn timestamp(parsed: &Exif) -> Option<DateTime<Utc>> {
    let field = parsed
        .get_field(Tag::DateTimeOriginal, In::PRIMARY)
        .or_else(|| parsed.get_field(Tag::DateTime, In::PRIMARY))?;
    let Value::Ascii(raw) = &field.value else {
        return None;
    };
    let parsed_time = exif::DateTime::from_ascii(raw.first()?).ok()?;

    let date = NaiveDate::from_ymd_opt(
        parsed_time.year.into(),
        parsed_time.month.into(),
        parsed_time.day.into(),
    )?;
    let naive = date.and_hms_opt(
        parsed_time.hour.into(),
        parsed_time.minute.into(),
        parsed_time.second.into(),
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

fn ascii_field(parsed: &Exif, tag: Tag) -> Option<String> {
    let field = parsed.get_field(tag, In::PRIMARY)?;
    let Value::Ascii(raw) = &field.value else {
        return None;
    };
    let text = String::from_utf8_lossy(raw.first()?);
    Some(text.trim().to_string())
}
