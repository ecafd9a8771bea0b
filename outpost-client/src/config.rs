//! Client configuration.
//!
//! A flat `key=value` file (same syntax as a `.env` file) with a closed set
//! of keys. Unknown keys are a startup error so that typos surface
//! immediately instead of silently running with a default.

use std::{
    collections::HashMap,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_DEVICE: &str = "/dev/ttyGPS0";
pub const DEFAULT_BAUD: u32 = 38400;
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.0001;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("invalid configuration")]
pub enum Error {
    #[error("failed to read config file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },

    #[error("unknown config key: {key}")]
    UnknownKey { key: String },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("missing required config key: {key}")]
    MissingKey { key: &'static str },
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Serial device the NMEA sentences come from.
    pub device: PathBuf,

    /// Serial baud rate. GPS receivers ship at 4800 or 38400.
    pub baud: u32,

    /// Server to post batches to, `host:port`.
    pub outpost_host: String,

    /// File holding the 32 byte pre-shared key.
    pub psk_path: PathBuf,

    /// Minimum per-axis movement in degrees before a fix is accepted.
    pub similarity_threshold: f64,

    /// How long a non-empty buffer may wait before it is flushed.
    pub flush_interval: Duration,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut values = HashMap::new();
        for item in dotenvy::from_path_iter(path).map_err(|source| {
            Error::Read {
                path: path.to_owned(),
                source,
            }
        })? {
            let (key, value) = item.map_err(|source| {
                Error::Read {
                    path: path.to_owned(),
                    source,
                }
            })?;
            values.insert(key, value);
        }

        Self::from_values(values)
    }

    fn from_values(mut values: HashMap<String, String>) -> Result<Self, Error> {
        let device = values
            .remove("device")
            .map_or_else(|| DEFAULT_DEVICE.into(), PathBuf::from);
        let baud = parse_or(&mut values, "baud", DEFAULT_BAUD)?;
        let outpost_host = values
            .remove("outpost_host")
            .ok_or(Error::MissingKey {
                key: "outpost_host",
            })?;
        let psk_path = values
            .remove("psk_path")
            .map(PathBuf::from)
            .ok_or(Error::MissingKey { key: "psk_path" })?;
        let similarity_threshold =
            parse_or(&mut values, "similarity_threshold", DEFAULT_SIMILARITY_THRESHOLD)?;
        let flush_interval = Duration::from_secs(parse_or(
            &mut values,
            "flush_interval",
            DEFAULT_FLUSH_INTERVAL.as_secs(),
        )?);

        if let Some(key) = values.into_keys().next() {
            return Err(Error::UnknownKey { key });
        }

        Ok(Self {
            device,
            baud,
            outpost_host,
            psk_path,
            similarity_threshold,
            flush_interval,
        })
    }
}

fn parse_or<T: FromStr>(
    values: &mut HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, Error> {
    match values.remove(key) {
        None => Ok(default),
        Some(value) => {
            value
                .parse()
                .map_err(|_| Error::InvalidValue { key, value })
        }
    }
}
