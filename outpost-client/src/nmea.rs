//! NMEA 0183 sentence stream.
//!
//! Reads `$...*hh` lines from an async byte source (normally the serial
//! port) and parses the two sentence types that carry what the uplink
//! needs: RMC (date, time, position, speed over ground) and GGA (time,
//! position, altitude). Everything else decodes to [`Sentence::Other`].
//!
//! Field reference: <https://gpsd.gitlab.io/gpsd/NMEA.html>

use std::{
    pin::Pin,
    str::{
        FromStr,
        Utf8Error,
    },
    task::{
        Context,
        Poll,
    },
};

use chrono::{
    NaiveDate,
    NaiveTime,
};
use futures_util::Stream;
use pin_project_lite::pin_project;
use tokio::io::{
    AsyncRead,
    ReadBuf,
};

const RECEIVE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
#[error("nmea read error")]
pub enum Error {
    Io(#[from] std::io::Error),
    MaxLineLengthExceeded,
    InvalidEncoding(#[from] Utf8Error),
    InvalidSentence(#[from] SentenceFromStrError),
}

pin_project! {
    #[derive(Debug)]
    pub struct Reader<R> {
        #[pin]
        reader: R,
        receive_buffer: ReceiveBuffer,
    }
}

impl<R: AsyncRead> Reader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            receive_buffer: ReceiveBuffer::default(),
        }
    }
}

impl<R: AsyncRead> Stream for Reader<R> {
    type Item = Result<Sentence, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let this = self.as_mut().project();

            if let Some(line) = this.receive_buffer.next_line() {
                // receivers terminate sentences with `\r\n`; splitting at
                // either produces an empty line per sentence, which we skip
                if !line.is_empty() {
                    match str::from_utf8(line) {
                        Ok(line) => {
                            match line.parse() {
                                Ok(sentence) => return Poll::Ready(Some(Ok(sentence))),
                                Err(error) => {
                                    return Poll::Ready(Some(Err(Error::InvalidSentence(error))));
                                }
                            }
                        }
                        Err(error) => {
                            return Poll::Ready(Some(Err(error.into())));
                        }
                    }
                }
            }
            else {
                this.receive_buffer.prepare_read();
                if this.receive_buffer.is_full() {
                    this.receive_buffer.reset();
                    return Poll::Ready(Some(Err(Error::MaxLineLengthExceeded)));
                }

                let mut read_buf =
                    ReadBuf::new(&mut this.receive_buffer.buffer[this.receive_buffer.write_pos..]);
                match this.reader.poll_read(cx, &mut read_buf) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error.into()))),
                    Poll::Ready(Ok(())) => {
                        let num_bytes_read = read_buf.filled().len();
                        if num_bytes_read == 0 {
                            return Poll::Ready(None);
                        }

                        this.receive_buffer.write_pos += num_bytes_read;
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
struct ReceiveBuffer {
    buffer: [u8; RECEIVE_BUFFER_SIZE],
    read_pos: usize,
    write_pos: usize,
    no_newline_until: usize,
}

impl ReceiveBuffer {
    fn scan_for_newline(&mut self) -> Option<usize> {
        if let Some(index) = self.buffer[self.no_newline_until..self.write_pos]
            .iter()
            .position(|byte| *byte == b'\r' || *byte == b'\n')
        {
            let index = index + self.no_newline_until;
            self.no_newline_until = index;
            Some(index)
        }
        else {
            self.no_newline_until = self.write_pos;
            None
        }
    }

    fn next_line(&mut self) -> Option<&[u8]> {
        if let Some(newline) = self.scan_for_newline() {
            let start = self.read_pos;
            self.read_pos = newline + 1;
            self.no_newline_until = self.read_pos;
            Some(&self.buffer[start..newline])
        }
        else {
            None
        }
    }

    fn prepare_read(&mut self) {
        if self.read_pos < self.write_pos && self.read_pos > 0 {
            // move data
            self.buffer.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.no_newline_until -= self.read_pos;
            self.read_pos = 0;
        }
        else if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
            self.no_newline_until = 0;
        }
    }

    fn is_full(&self) -> bool {
        self.write_pos == self.buffer.len()
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.no_newline_until = 0;
    }
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self {
            buffer: [0; RECEIVE_BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
            no_newline_until: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Sentence {
    Rmc(Rmc),
    Gga(Gga),
    /// A well-formed sentence of a type we don't consume.
    Other,
}

/// Recommended minimum position data.
#[derive(Clone, Debug, PartialEq)]
pub struct Rmc {
    pub time: Option<NaiveTime>,
    pub date: Option<NaiveDate>,

    /// Status field was `A` (autonomous fix).
    pub valid: bool,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    /// Speed over ground in knots, as transmitted.
    pub speed_knots: Option<f64>,
}

/// Fix data, including altitude.
#[derive(Clone, Debug, PartialEq)]
pub struct Gga {
    pub time: Option<NaiveTime>,

    /// 0 means no fix.
    pub fix_quality: u8,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    /// Metres above sea level.
    pub altitude: Option<f64>,
}

impl FromStr for Sentence {
    type Err = SentenceFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('$')
            .ok_or(SentenceFromStrError::MissingStart)?;

        // a checksum field is verified when present
        let data = if let Some((data, checksum)) = body.rsplit_once('*') {
            let expected = u8::from_str_radix(checksum.trim_end(), 16).map_err(|_| {
                SentenceFromStrError::BadChecksumField {
                    value: checksum.to_owned(),
                }
            })?;
            let actual = data.bytes().fold(0, |acc, byte| acc ^ byte);
            if actual != expected {
                return Err(SentenceFromStrError::ChecksumMismatch { expected, actual });
            }
            data
        }
        else {
            body
        };

        let mut fields = data.split(',');
        let sentence_type = fields.next().ok_or(SentenceFromStrError::Truncated)?;
        let Some(kind) = sentence_type
            .len()
            .checked_sub(3)
            .and_then(|start| sentence_type.get(start..))
        else {
            return Ok(Self::Other);
        };

        match kind {
            "RMC" => {
                let time = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let status = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let latitude = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let ns = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let longitude = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let ew = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let speed = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let _course = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let date = fields.next().ok_or(SentenceFromStrError::Truncated)?;

                Ok(Self::Rmc(Rmc {
                    time: parse_time(time)?,
                    date: parse_date(date)?,
                    valid: status == "A",
                    latitude: parse_coordinate(latitude, ns)?,
                    longitude: parse_coordinate(longitude, ew)?,
                    speed_knots: parse_number(speed, |value| {
                        SentenceFromStrError::InvalidSpeed {
                            value: value.to_owned(),
                        }
                    })?,
                }))
            }
            "GGA" => {
                let time = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let latitude = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let ns = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let longitude = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let ew = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let quality = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let _satellites = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let _hdop = fields.next().ok_or(SentenceFromStrError::Truncated)?;
                let altitude = fields.next().ok_or(SentenceFromStrError::Truncated)?;

                let fix_quality = if quality.is_empty() {
                    0
                }
                else {
                    quality.parse().map_err(|_| {
                        SentenceFromStrError::InvalidQuality {
                            value: quality.to_owned(),
                        }
                    })?
                };

                Ok(Self::Gga(Gga {
                    time: parse_time(time)?,
                    fix_quality,
                    latitude: parse_coordinate(latitude, ns)?,
                    longitude: parse_coordinate(longitude, ew)?,
                    altitude: parse_number(altitude, |value| {
                        SentenceFromStrError::InvalidAltitude {
                            value: value.to_owned(),
                        }
                    })?,
                }))
            }
            _ => Ok(Self::Other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("nmea sentence parse error")]
pub enum SentenceFromStrError {
    #[error("sentence doesn't start with $")]
    MissingStart,
    #[error("truncated sentence")]
    Truncated,
    #[error("bad checksum field: {value}")]
    BadChecksumField { value: String },
    #[error("checksum mismatch: expected {expected:02X}, calculated {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("invalid time: {value}")]
    InvalidTime { value: String },
    #[error("invalid date: {value}")]
    InvalidDate { value: String },
    #[error("invalid coordinate: {value}")]
    InvalidCoordinate { value: String },
    #[error("invalid speed: {value}")]
    InvalidSpeed { value: String },
    #[error("invalid fix quality: {value}")]
    InvalidQuality { value: String },
    #[error("invalid altitude: {value}")]
    InvalidAltitude { value: String },
}

/// `hhmmss` or `hhmmss.sss`; the fraction is dropped, the protocol carries
/// whole seconds.
fn parse_time(s: &str) -> Result<Option<NaiveTime>, SentenceFromStrError> {
    if s.is_empty() {
        return Ok(None);
    }

    let invalid = || {
        SentenceFromStrError::InvalidTime {
            value: s.to_owned(),
        }
    };

    if s.len() < 6 || !s.is_ascii() {
        return Err(invalid());
    }

    let hour = s[0..2].parse().map_err(|_| invalid())?;
    let minute = s[2..4].parse().map_err(|_| invalid())?;
    let second = s[4..6].parse().map_err(|_| invalid())?;

    NaiveTime::from_hms_opt(hour, minute, second)
        .map(Some)
        .ok_or_else(invalid)
}

/// `ddmmyy`. Two-digit years are 20xx; the format runs out in 2100 either
/// way.
fn parse_date(s: &str) -> Result<Option<NaiveDate>, SentenceFromStrError> {
    if s.is_empty() {
        return Ok(None);
    }

    let invalid = || {
        SentenceFromStrError::InvalidDate {
            value: s.to_owned(),
        }
    };

    if s.len() != 6 || !s.is_ascii() {
        return Err(invalid());
    }

    let day = s[0..2].parse().map_err(|_| invalid())?;
    let month = s[2..4].parse().map_err(|_| invalid())?;
    let year: i32 = s[4..6].parse().map_err(|_| invalid())?;

    NaiveDate::from_ymd_opt(2000 + year, month, day)
        .map(Some)
        .ok_or_else(invalid)
}

/// `ddmm.mmmm` (or `dddmm.mmmm` for longitudes) plus a hemisphere letter,
/// to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str) -> Result<Option<f64>, SentenceFromStrError> {
    if value.is_empty() || hemisphere.is_empty() {
        return Ok(None);
    }

    let invalid = || {
        SentenceFromStrError::InvalidCoordinate {
            value: format!("{value},{hemisphere}"),
        }
    };

    if !value.is_ascii() {
        return Err(invalid());
    }

    // minutes are the final two integer digits plus the fraction; degrees
    // are whatever precedes them
    let point = value.find('.').unwrap_or(value.len());
    if point < 2 {
        return Err(invalid());
    }

    let degrees: f64 = if point == 2 {
        0.0
    }
    else {
        value[..point - 2].parse().map_err(|_| invalid())?
    };
    let minutes: f64 = value[point - 2..].parse().map_err(|_| invalid())?;
    let decimal = degrees + minutes / 60.0;

    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(invalid()),
    }
}

fn parse_number(
    s: &str,
    error: impl Fn(&str) -> SentenceFromStrError,
) -> Result<Option<f64>, SentenceFromStrError> {
    if s.is_empty() {
        Ok(None)
    }
    else {
        s.parse().map(Some).map_err(|_| error(s))
    }
}
