//! Wall-clock time for stamping session headers.

use chrono::{FixedOffset, Local, NaiveDateTime, Utc};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Zone in which the device reports its clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZoneSpec {
    /// The host's local zone
    #[default]
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl ZoneSpec {
    /// Parse `spec`, falling back to UTC when it cannot be understood.
    pub fn resolve(spec: &str) -> Self {
        spec.parse().unwrap_or_else(|e| {
            warn!("Cannot resolve time zone {:?} ({}), using UTC", spec, e);
            ZoneSpec::Utc
        })
    }
}

impl FromStr for ZoneSpec {
    type Err = String;

    /// Accepts `local`, `utc` and offsets like `+02:00` or `-0330`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "local" | "" => return Ok(ZoneSpec::Local),
            "utc" | "z" => return Ok(ZoneSpec::Utc),
            _ => {}
        }

        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(format!("expected local, utc or ±HH:MM, got {:?}", s)),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("malformed offset {:?}", s));
        }
        let hours: i32 = digits[..2].parse().map_err(|e| format!("{}", e))?;
        let minutes: i32 = digits[2..].parse().map_err(|e| format!("{}", e))?;
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ZoneSpec::Fixed)
            .ok_or_else(|| format!("offset {:?} out of range", s))
    }
}

impl fmt::Display for ZoneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneSpec::Local => write!(f, "local"),
            ZoneSpec::Utc => write!(f, "UTC"),
            ZoneSpec::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    zone: ZoneSpec,
}

impl SystemClock {
    pub fn new(zone: ZoneSpec) -> Self {
        Self { zone }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        match self.zone {
            ZoneSpec::Local => Local::now().naive_local(),
            ZoneSpec::Utc => Utc::now().naive_utc(),
            ZoneSpec::Fixed(offset) => Utc::now().with_timezone(&offset).naive_local(),
        }
    }
}

/// A clock stopped at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
