//! Astronomical time handling.
//!
//! All instants are stored as integer nanoseconds since 1970-01-01T00:00:00
//! TAI. Wall-clock (UTC) values are converted with the leap-second table, so
//! a dataset's `ingest_date` and a `T'...'` literal that name the same instant
//! have the same representation everywhere: in memory, in snapshots and in
//! rendered SQL.
//!
//! ```rust
//! use butlerdb::time::{AstroTime, TimeScale};
//!
//! let utc: AstroTime = "2020-01-01T00:00:00/utc".parse()?;
//! let tai: AstroTime = "2020-01-01T00:00:37/tai".parse()?;
//! assert_eq!(utc, tai);
//! assert_eq!(utc.to_iso(TimeScale::Utc), "2020-01-01T00:00:00.000000000");
//! # Ok::<(), butlerdb::ButlerError>(())
//! ```

mod leap;
mod timespan;

pub use timespan::Timespan;

use crate::error::{ButlerError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use leap::NSEC_PER_SEC;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const NSEC_PER_DAY: f64 = 86_400.0 * 1e9;

/// MJD of 1970-01-01.
const MJD_UNIX_EPOCH: f64 = 40_587.0;

const ISO_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Time scale of a literal or formatted time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeScale {
    Utc,
    #[default]
    Tai,
}

impl TimeScale {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeScale::Utc => "utc",
            TimeScale::Tai => "tai",
        }
    }
}

impl FromStr for TimeScale {
    type Err = ButlerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "utc" => Ok(TimeScale::Utc),
            "tai" => Ok(TimeScale::Tai),
            other => Err(ButlerError::InvalidTime(format!(
                "unsupported time scale '{}'",
                other
            ))),
        }
    }
}

/// An instant, stored as TAI nanoseconds since 1970-01-01T00:00:00 TAI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AstroTime {
    tai_nsec: i64,
}

impl AstroTime {
    /// 1970-01-01T00:00:00 TAI.
    pub const MIN: AstroTime = AstroTime { tai_nsec: 0 };

    /// 2100-01-01T00:00:00 TAI.
    pub const MAX: AstroTime = AstroTime {
        tai_nsec: 4_102_444_800 * NSEC_PER_SEC,
    };

    pub fn from_tai_nsec(tai_nsec: i64) -> Result<Self> {
        if !(Self::MIN.tai_nsec..=Self::MAX.tai_nsec).contains(&tai_nsec) {
            return Err(ButlerError::InvalidTime(format!(
                "{} ns is outside the supported range 1970-2100 TAI",
                tai_nsec
            )));
        }
        Ok(Self { tai_nsec })
    }

    pub fn tai_nsec(&self) -> i64 {
        self.tai_nsec
    }

    /// Convert a UTC wall-clock time, applying TAI−UTC at that instant.
    pub fn from_utc(utc: DateTime<Utc>) -> Result<Self> {
        let tai_nsec = utc_to_tai_nsec(utc).ok_or(ButlerError::InvalidTimestamp)?;
        Self::from_tai_nsec(tai_nsec)
    }

    pub fn to_utc(&self) -> DateTime<Utc> {
        let (secs, nanos) = leap::utc_from_tai(self.tai_nsec);
        // In-range values always convert; leap seconds land on a :59 second.
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Current wall-clock time in TAI.
    pub fn now() -> Self {
        let tai_nsec = utc_to_tai_nsec(Utc::now()).unwrap_or(Self::MAX.tai_nsec);
        Self {
            tai_nsec: tai_nsec.clamp(Self::MIN.tai_nsec, Self::MAX.tai_nsec),
        }
    }

    pub fn from_mjd(mjd: f64, scale: TimeScale) -> Result<Self> {
        if !mjd.is_finite() {
            return Err(ButlerError::InvalidTime(format!("invalid MJD {}", mjd)));
        }
        let nsec = ((mjd - MJD_UNIX_EPOCH) * NSEC_PER_DAY).round();
        if nsec < i64::MIN as f64 || nsec > i64::MAX as f64 {
            return Err(ButlerError::InvalidTime(format!("MJD {} out of range", mjd)));
        }
        let nsec = nsec as i64;
        match scale {
            TimeScale::Tai => Self::from_tai_nsec(nsec),
            TimeScale::Utc => {
                let utc = DateTime::from_timestamp(
                    nsec.div_euclid(NSEC_PER_SEC),
                    nsec.rem_euclid(NSEC_PER_SEC) as u32,
                )
                .ok_or(ButlerError::InvalidTimestamp)?;
                Self::from_utc(utc)
            }
        }
    }

    /// Modified Julian Date in the TAI scale.
    pub fn mjd(&self) -> f64 {
        MJD_UNIX_EPOCH + self.tai_nsec as f64 / NSEC_PER_DAY
    }

    /// Parse the body of a `T'...'` time literal.
    ///
    /// Accepted forms are `VALUE`, `VALUE/FORMAT`, `VALUE/SCALE` and
    /// `VALUE/FORMAT/SCALE`, where format is `iso` or `mjd` and scale is
    /// `tai` (the default) or `utc`. A bare number is an MJD.
    pub fn parse_literal(literal: &str) -> Result<Self> {
        let mut parts = literal.trim().split('/');
        let value = parts.next().unwrap_or_default().trim();
        if value.is_empty() {
            return Err(ButlerError::InvalidTime("empty time literal".into()));
        }

        let mut format: Option<&str> = None;
        let mut scale = TimeScale::default();
        for part in parts {
            let part = part.trim();
            match part.to_ascii_lowercase().as_str() {
                "iso" => format = Some("iso"),
                "mjd" => format = Some("mjd"),
                "utc" | "tai" => scale = part.parse()?,
                _ => {
                    return Err(ButlerError::InvalidTime(format!(
                        "unknown format or scale '{}' in time literal '{}'",
                        part, literal
                    )));
                }
            }
        }

        let format = format.unwrap_or_else(|| {
            if value.parse::<f64>().is_ok() {
                "mjd"
            } else {
                "iso"
            }
        });

        if format == "mjd" {
            let mjd = value.parse::<f64>().map_err(|_| {
                ButlerError::InvalidTime(format!("'{}' is not a valid MJD", value))
            })?;
            return Self::from_mjd(mjd, scale);
        }

        let naive = parse_iso(value)?;
        match scale {
            TimeScale::Utc => Self::from_utc(naive.and_utc()),
            TimeScale::Tai => {
                let calendar = naive.and_utc();
                let nsec = calendar
                    .timestamp()
                    .checked_mul(NSEC_PER_SEC)
                    .and_then(|n| n.checked_add(calendar.timestamp_subsec_nanos() as i64))
                    .ok_or(ButlerError::InvalidTimestamp)?;
                Self::from_tai_nsec(nsec)
            }
        }
    }

    /// Format as `YYYY-MM-DDTHH:MM:SS.nnnnnnnnn` in the given scale.
    pub fn to_iso(&self, scale: TimeScale) -> String {
        let calendar = match scale {
            TimeScale::Utc => self.to_utc(),
            TimeScale::Tai => DateTime::from_timestamp(
                self.tai_nsec.div_euclid(NSEC_PER_SEC),
                self.tai_nsec.rem_euclid(NSEC_PER_SEC) as u32,
            )
            .unwrap_or_default(),
        };
        calendar.format("%Y-%m-%dT%H:%M:%S%.9f").to_string()
    }
}

impl fmt::Display for AstroTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tai", self.to_iso(TimeScale::Tai))
    }
}

impl FromStr for AstroTime {
    type Err = ButlerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_literal(s)
    }
}

fn utc_to_tai_nsec(utc: DateTime<Utc>) -> Option<i64> {
    let secs = utc.timestamp();
    let nanos = utc.timestamp_subsec_nanos() as i64;
    let offset = leap::tai_minus_utc(secs);
    secs.checked_add(offset)?
        .checked_mul(NSEC_PER_SEC)?
        .checked_add(nanos)
}

fn parse_iso(value: &str) -> Result<NaiveDateTime> {
    for format in ISO_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default());
    }
    Err(ButlerError::InvalidTime(format!(
        "'{}' is not a valid ISO time",
        value
    )))
}
