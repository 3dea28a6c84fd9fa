//! # Sound Speed Profile Sentences
//!
//! ASCII sentence formats understood by echo sounder control systems. Every
//! line is CR/LF terminated.
//!
//! ```text
//! $AMS<code>,00000,<NNNN>,<HHMMSS>,<DD>,<MM>,<YYYY>,
//! <depth>,<speed>,<temperature>,<salinity>,         (NNNN lines)
//! <DDMM.mmm>,<N|S>,<DDDMM.mmm>,<E|W>,               (positioned formats)
//! \*<HH>                                            (positioned formats)
//! \                                                 (plain formats)
//! ```
//!
//! | Code | Fields                         | Position + checksum |
//! |------|--------------------------------|---------------------|
//! | S00  | depth, speed                   | no                  |
//! | S01  | depth, speed, temp, salinity   | no                  |
//! | S03  | depth, temp, salinity          | no                  |
//! | S10  | depth, speed                   | yes                 |
//! | S11  | depth, speed, temp, salinity   | yes                 |
//! | S13  | depth, temp, salinity          | yes                 |
//!
//! Numbers carry two decimals; fields a layout does not use stay empty so
//! every data line has four comma-terminated fields. The checksum is the XOR
//! of every byte after `$` up to the `*`, written as two upper-case hex
//! digits.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

use crate::{Metadata, Position, ProfileSamples};

/// Largest UDP payload a profile sentence may occupy.
pub const MAX_DATAGRAM_PAYLOAD: usize = 65_508;

const PROFILE_ID: &str = "00000";
const SENTENCE_PREFIX: &str = "$AMS";
const REQUEST_BODY: &str = "AMQ,SVP";

/// Which fields a data line carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SentenceLayout {
    DepthSpeed,
    DepthSpeedTempSal,
    DepthTempSal,
}

/// Sentence layout plus whether the position/checksum trailer is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WireFormat {
    pub layout: SentenceLayout,
    pub positioned: bool,
}

impl WireFormat {
    pub const fn new(layout: SentenceLayout, positioned: bool) -> Self {
        Self { layout, positioned }
    }

    /// Three-character format code, e.g. `S11`.
    pub fn code(&self) -> &'static str {
        match (self.layout, self.positioned) {
            (SentenceLayout::DepthSpeed, false) => "S00",
            (SentenceLayout::DepthSpeedTempSal, false) => "S01",
            (SentenceLayout::DepthTempSal, false) => "S03",
            (SentenceLayout::DepthSpeed, true) => "S10",
            (SentenceLayout::DepthSpeedTempSal, true) => "S11",
            (SentenceLayout::DepthTempSal, true) => "S13",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        let format = match code {
            "S00" => Self::new(SentenceLayout::DepthSpeed, false),
            "S01" => Self::new(SentenceLayout::DepthSpeedTempSal, false),
            "S03" => Self::new(SentenceLayout::DepthTempSal, false),
            "S10" => Self::new(SentenceLayout::DepthSpeed, true),
            "S11" => Self::new(SentenceLayout::DepthSpeedTempSal, true),
            "S13" => Self::new(SentenceLayout::DepthTempSal, true),
            _ => return None,
        };
        Some(format)
    }
}

/// Errors building a sentence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodeError {
    #[error("profile has no valid samples")]
    NoSamples,

    #[error("profile has no timestamp")]
    MissingTimestamp,

    #[error("format {0} requires a position")]
    MissingPosition(&'static str),
}

/// Errors parsing a sentence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("sentence is not ASCII")]
    NotAscii,

    #[error("missing or malformed header")]
    BadHeader,

    #[error("unknown format code {0}")]
    UnknownFormat(String),

    #[error("malformed line {line}: {text}")]
    BadLine { line: usize, text: String },

    #[error("expected {expected} data lines, found {found}")]
    CountMismatch { expected: usize, found: usize },

    #[error("checksum mismatch: computed {computed:02X}, sentence says {stated}")]
    Checksum { computed: u8, stated: String },

    #[error("missing terminator")]
    MissingTerminator,
}

/// XOR of all bytes, the checksum used by positioned sentences.
///
/// # Example
/// ```
/// use svp_lib::protocol::checksum;
///
/// assert_eq!(checksum(b"AB"), 0x41 ^ 0x42);
/// ```
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Encode the valid samples of `samples` into a sentence.
///
/// The header time is the profile timestamp; positioned formats also need
/// the metadata position.
pub fn encode(
    samples: &ProfileSamples,
    meta: &Metadata,
    format: WireFormat,
) -> Result<Vec<u8>, EncodeError> {
    let timestamp = meta.timestamp.ok_or(EncodeError::MissingTimestamp)?;
    let position = if format.positioned {
        Some(meta.position.ok_or(EncodeError::MissingPosition(format.code()))?)
    } else {
        None
    };

    let count = samples.valid_count();
    if count == 0 {
        return Err(EncodeError::NoSamples);
    }

    let mut out = String::with_capacity(64 + count * 32);
    out.push_str(&format!(
        "{}{},{},{:04},{:02}{:02}{:02},{:02},{:02},{:04},\r\n",
        SENTENCE_PREFIX,
        &format.code()[1..],
        PROFILE_ID,
        count,
        timestamp.hour(),
        timestamp.minute(),
        timestamp.second(),
        timestamp.day(),
        timestamp.month(),
        timestamp.year(),
    ));

    for s in samples.valid() {
        let line = match format.layout {
            SentenceLayout::DepthSpeed => format!("{:.2},{:.2},,,\r\n", s.depth, s.speed),
            SentenceLayout::DepthSpeedTempSal => format!(
                "{:.2},{:.2},{:.2},{:.2},\r\n",
                s.depth, s.speed, s.temperature, s.salinity
            ),
            SentenceLayout::DepthTempSal => {
                format!("{:.2},,{:.2},{:.2},\r\n", s.depth, s.temperature, s.salinity)
            }
        };
        out.push_str(&line);
    }

    match position {
        Some(position) => {
            let (lat, ns) = format_dmm(position.latitude, true);
            let (lon, ew) = format_dmm(position.longitude, false);
            out.push_str(&format!("{lat},{ns},{lon},{ew},\r\n\\"));
            let sum = checksum(&out.as_bytes()[1..]);
            out.push_str(&format!("*{sum:02X}\r\n"));
        }
        None => out.push_str("\\\r\n"),
    }

    Ok(out.into_bytes())
}

/// Request for the client's currently applied profile: `$AMQ,SVP*HH`.
pub fn encode_profile_request() -> Vec<u8> {
    format!(
        "${}*{:02X}\r\n",
        REQUEST_BODY,
        checksum(REQUEST_BODY.as_bytes())
    )
    .into_bytes()
}

/// True if `bytes` is a well-formed profile request.
pub fn is_profile_request(bytes: &[u8]) -> bool {
    bytes == encode_profile_request().as_slice()
}

/// Degrees → `DDMM.mmm` (latitude) or `DDDMM.mmm` (longitude) and the
/// hemisphere letter.
pub fn format_dmm(value: f64, latitude: bool) -> (String, char) {
    let hemisphere = match (latitude, value < 0.0) {
        (true, false) => 'N',
        (true, true) => 'S',
        (false, false) => 'E',
        (false, true) => 'W',
    };
    // Round once in thousandths of a minute so 59.9996' carries into degrees
    let total = (value.abs() * 60_000.0).round() as u64;
    let degrees = total / 60_000;
    let minutes = (total % 60_000) / 1000;
    let thousandths = total % 1000;
    let text = if latitude {
        format!("{degrees:02}{minutes:02}.{thousandths:03}")
    } else {
        format!("{degrees:03}{minutes:02}.{thousandths:03}")
    };
    (text, hemisphere)
}

/// `DDMM.mmm` + hemisphere → signed degrees.
pub fn parse_dmm(text: &str, hemisphere: &str) -> Option<f64> {
    let raw: f64 = text.parse().ok()?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let value = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(value),
        "S" | "W" => Some(-value),
        _ => None,
    }
}

/// One parsed data line; fields the layout does not carry are `None`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodedSample {
    pub depth: f64,
    pub speed: Option<f64>,
    pub temperature: Option<f64>,
    pub salinity: Option<f64>,
}

/// A parsed profile sentence.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSentence {
    pub format: WireFormat,
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<DecodedSample>,
    pub position: Option<Position>,
}

impl DecodedSentence {
    pub fn depth_speed_pairs(&self) -> Vec<(f64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| s.speed.map(|speed| (s.depth, speed)))
            .collect()
    }
}

/// Parse a sentence produced by [`encode`], verifying count and checksum.
pub fn decode(bytes: &[u8]) -> Result<DecodedSentence, DecodeError> {
    if !bytes.is_ascii() {
        return Err(DecodeError::NotAscii);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotAscii)?;
    let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();

    let header = lines.first().ok_or(DecodeError::BadHeader)?;
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 7 || !fields[0].starts_with(SENTENCE_PREFIX) {
        return Err(DecodeError::BadHeader);
    }
    let code = format!("S{}", &fields[0][SENTENCE_PREFIX.len()..]);
    let format = WireFormat::from_code(&code).ok_or(DecodeError::UnknownFormat(code))?;
    let expected: usize = fields[2].parse().map_err(|_| DecodeError::BadHeader)?;
    let timestamp = parse_header_time(fields[3], fields[4], fields[5], fields[6])
        .ok_or(DecodeError::BadHeader)?;

    let trailer_lines = if format.positioned { 2 } else { 1 };
    if lines.len() < 1 + trailer_lines {
        return Err(DecodeError::MissingTerminator);
    }
    let body = &lines[1..lines.len() - trailer_lines];
    if body.len() != expected {
        return Err(DecodeError::CountMismatch {
            expected,
            found: body.len(),
        });
    }

    let mut samples = Vec::with_capacity(body.len());
    for (i, line) in body.iter().enumerate() {
        let bad = || DecodeError::BadLine {
            line: i + 2,
            text: line.to_string(),
        };
        let f: Vec<&str> = line.split(',').collect();
        if f.len() < 4 {
            return Err(bad());
        }
        let opt = |s: &str| -> Result<Option<f64>, DecodeError> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| bad())
            }
        };
        samples.push(DecodedSample {
            depth: f[0].parse().map_err(|_| bad())?,
            speed: opt(f[1])?,
            temperature: opt(f[2])?,
            salinity: opt(f[3])?,
        });
    }

    let terminator = lines[lines.len() - 1];
    let position = if format.positioned {
        let star = text.rfind('*').ok_or(DecodeError::MissingTerminator)?;
        let stated = terminator
            .strip_prefix("\\*")
            .ok_or(DecodeError::MissingTerminator)?;
        let computed = checksum(&bytes[1..star]);
        if u8::from_str_radix(stated, 16).ok() != Some(computed) {
            return Err(DecodeError::Checksum {
                computed,
                stated: stated.to_string(),
            });
        }

        let pos_line = lines[lines.len() - 2];
        let p: Vec<&str> = pos_line.split(',').collect();
        let parsed = if p.len() >= 4 {
            parse_dmm(p[0], p[1]).zip(parse_dmm(p[2], p[3]))
        } else {
            None
        };
        let (latitude, longitude) = parsed.ok_or_else(|| DecodeError::BadLine {
            line: lines.len() - 1,
            text: pos_line.to_string(),
        })?;
        Some(Position::new(latitude, longitude))
    } else {
        if terminator != "\\" {
            return Err(DecodeError::MissingTerminator);
        }
        None
    };

    Ok(DecodedSentence {
        format,
        timestamp,
        samples,
        position,
    })
}

fn parse_header_time(hms: &str, day: &str, month: &str, year: &str) -> Option<DateTime<Utc>> {
    if hms.len() != 6 || !hms.is_ascii() {
        return None;
    }
    let hour: u32 = hms[0..2].parse().ok()?;
    let minute: u32 = hms[2..4].parse().ok()?;
    let second: u32 = hms[4..6].parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    let naive = date.and_hms_opt(hour, minute, second)?;
    Some(Utc.from_utc_datetime(&naive))
}
