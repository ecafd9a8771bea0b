//! Batch wire codec.
//!
//! A batch is 1..=40 fixes serialised big-endian as a 16 byte header
//! followed by one 9 byte body per non-reference sample:
//!
//! ```text
//! header:  ref_ts u32 | ref_lat i32 (deg * 1e7) | ref_lon i32 (deg * 1e7)
//!          | ref_alt i16 (m) | ref_spd u8 (km/h * 10) | count u8
//! sample:  dt u16 (s) | dlat i16 (deg * 1e4) | dlon i16 (deg * 1e4)
//!          | alt i16 (m) | spd u8 (km/h * 10)
//! ```
//!
//! Deltas are taken against the quantised reference, so decoding is the
//! exact inverse of encoding. Values that don't fit their field saturate
//! instead of failing; position data is lossy by nature and a clipped
//! sample is worth more than a dropped batch.

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};
use chrono::{
    DateTime,
    Duration,
};

use crate::Fix;

/// Serialised header length in bytes.
pub const HEADER_LENGTH: usize = 16;

/// Serialised length of one non-reference sample in bytes.
pub const SAMPLE_LENGTH: usize = 9;

/// Maximum number of samples in one batch, reference included.
pub const MAX_SAMPLES: usize = 40;

/// Exact serialised length of a batch with `count` samples.
pub const fn encoded_length(count: usize) -> usize {
    HEADER_LENGTH + SAMPLE_LENGTH * (count - 1)
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("batch must contain 1..={MAX_SAMPLES} samples, got {count}")]
    BadCount { count: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is {actual} bytes, but {expected} bytes are declared")]
    TooShort { expected: usize, actual: usize },

    #[error("sample count must be 1..={MAX_SAMPLES}, got {count}")]
    BadCount { count: u8 },

    #[error("{extra} trailing bytes after the declared batch length")]
    TrailingBytes { extra: usize },
}

/// Serialises a batch of fixes.
///
/// The first fix is the reference and is stored in full precision; the
/// remaining fixes are stored as deltas against it. Fix order is preserved.
pub fn encode(fixes: &[Fix]) -> Result<Bytes, EncodeError> {
    let count = fixes.len();
    if count == 0 || count > MAX_SAMPLES {
        return Err(EncodeError::BadCount { count });
    }

    let reference = &fixes[0];
    let ref_ts = clamp_field(reference.time.timestamp(), 0, u32::MAX as i64) as u32;
    let ref_lat = quantize(reference.latitude, 1e7, i32::MIN as i64, i32::MAX as i64) as i32;
    let ref_lon = quantize(reference.longitude, 1e7, i32::MIN as i64, i32::MAX as i64) as i32;
    let ref_alt = quantize(reference.altitude, 1.0, i16::MIN as i64, i16::MAX as i64) as i16;
    let ref_spd = quantize(reference.speed, 10.0, 0, u8::MAX as i64) as u8;

    let mut buffer = BytesMut::with_capacity(encoded_length(count));
    buffer.put_u32(ref_ts);
    buffer.put_i32(ref_lat);
    buffer.put_i32(ref_lon);
    buffer.put_i16(ref_alt);
    buffer.put_u8(ref_spd);
    buffer.put_u8(count as u8);

    // deltas are against the value the decoder will reconstruct, not the
    // raw reference
    let ref_lat_deg = f64::from(ref_lat) / 1e7;
    let ref_lon_deg = f64::from(ref_lon) / 1e7;

    for fix in &fixes[1..] {
        let dt = clamp_field(fix.time.timestamp() - i64::from(ref_ts), 0, u16::MAX as i64) as u16;
        let dlat = quantize(
            fix.latitude - ref_lat_deg,
            1e4,
            i16::MIN as i64,
            i16::MAX as i64,
        ) as i16;
        let dlon = quantize(
            fix.longitude - ref_lon_deg,
            1e4,
            i16::MIN as i64,
            i16::MAX as i64,
        ) as i16;
        let alt = quantize(fix.altitude, 1.0, i16::MIN as i64, i16::MAX as i64) as i16;
        let spd = quantize(fix.speed, 10.0, 0, u8::MAX as i64) as u8;

        buffer.put_u16(dt);
        buffer.put_i16(dlat);
        buffer.put_i16(dlon);
        buffer.put_i16(alt);
        buffer.put_u8(spd);
    }

    Ok(buffer.freeze())
}

/// Deserialises a batch back into absolute fixes.
///
/// The payload must contain exactly the declared batch, nothing more.
pub fn decode(payload: &[u8]) -> Result<Vec<Fix>, DecodeError> {
    if payload.len() < HEADER_LENGTH {
        return Err(DecodeError::TooShort {
            expected: HEADER_LENGTH,
            actual: payload.len(),
        });
    }

    let mut buffer = &payload[..];
    let ref_ts = buffer.get_u32();
    let ref_lat = buffer.get_i32();
    let ref_lon = buffer.get_i32();
    let ref_alt = buffer.get_i16();
    let ref_spd = buffer.get_u8();
    let count = buffer.get_u8();

    if count == 0 || usize::from(count) > MAX_SAMPLES {
        return Err(DecodeError::BadCount { count });
    }

    let expected = encoded_length(usize::from(count));
    if payload.len() < expected {
        return Err(DecodeError::TooShort {
            expected,
            actual: payload.len(),
        });
    }
    if payload.len() > expected {
        return Err(DecodeError::TrailingBytes {
            extra: payload.len() - expected,
        });
    }

    let reference = Fix {
        time: DateTime::from_timestamp(i64::from(ref_ts), 0)
            .expect("u32 unix seconds are always representable"),
        latitude: f64::from(ref_lat) / 1e7,
        longitude: f64::from(ref_lon) / 1e7,
        altitude: f64::from(ref_alt),
        speed: f64::from(ref_spd) / 10.0,
    };

    let mut fixes = Vec::with_capacity(usize::from(count));
    fixes.push(reference);

    for _ in 1..count {
        let dt = buffer.get_u16();
        let dlat = buffer.get_i16();
        let dlon = buffer.get_i16();
        let alt = buffer.get_i16();
        let spd = buffer.get_u8();

        fixes.push(Fix {
            time: reference.time + Duration::seconds(i64::from(dt)),
            latitude: reference.latitude + f64::from(dlat) / 1e4,
            longitude: reference.longitude + f64::from(dlon) / 1e4,
            altitude: f64::from(alt),
            speed: f64::from(spd) / 10.0,
        });
    }

    Ok(fixes)
}

/// Round to nearest (ties away from zero) at the given scale, saturating
/// at the field bounds.
fn quantize(value: f64, scale: f64, min: i64, max: i64) -> i64 {
    let scaled = (value * scale).round();
    if scaled < min as f64 || scaled > max as f64 {
        tracing::debug!(value, "quantised value saturates its wire field");
        scaled.clamp(min as f64, max as f64) as i64
    }
    else {
        scaled as i64
    }
}

fn clamp_field(value: i64, min: i64, max: i64) -> i64 {
    if value < min || value > max {
        tracing::debug!(value, "value saturates its wire field");
    }
    value.clamp(min, max)
}
