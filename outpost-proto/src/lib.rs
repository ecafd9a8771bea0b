//! Data model and wire formats for the outpost position uplink.
//!
//! A batch of GPS fixes is serialised by [`batch`] into a compact
//! delta-compressed byte string, then wrapped by [`envelope`] into an
//! authenticated ciphertext. The two layers are pure; everything that does
//! I/O lives in the client and server crates.

pub mod batch;
pub mod envelope;

/// Resource path batches are posted to.
pub const POSITION_PATH: &str = "/position";

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

/// A single GPS observation.
///
/// Altitude and speed are zero when the upstream sentence didn't report
/// them; the wire format has no notion of a missing field.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub time: DateTime<Utc>,

    /// Signed decimal degrees.
    pub latitude: f64,

    /// Signed decimal degrees.
    pub longitude: f64,

    /// Metres above sea level.
    pub altitude: f64,

    /// Ground speed in km/h.
    pub speed: f64,
}
