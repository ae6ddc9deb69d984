//! Spacecraft elapsed time (SCET)
//!
//! Fixed-point onboard clock: 32-bit coarse seconds plus a 16-bit fine
//! sub-second field. The real value of a time is `coarse + fine / 65535`
//! seconds; arithmetic carries and borrows across the fine field modulo
//! 65536. All arithmetic runs on integer tick counts so that round trips are
//! exact.
//!
//! Out-of-range construction is rejected with [`TimeError`]; nothing is
//! clamped or wrapped.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Largest coarse value (seconds).
pub const MAX_COARSE: u32 = u32::MAX;

/// Largest fine value.
pub const MAX_FINE: u16 = u16::MAX;

/// Ticks per coarse second used for carry/borrow.
const FINE_MODULUS: i64 = 1 << 16;

/// Divisor used for the real-valued interpretation of the fine field.
const FINE_SCALE: f64 = 65535.0;

/// Desynchronization marker in the raw wire coarse field.
const DESYNC_BIT: u32 = 1 << 31;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("coarse time {0} does not fit in 32 bits")]
    CoarseOutOfRange(i64),

    #[error("fine time {0} does not fit in 16 bits")]
    FineOutOfRange(i64),

    #[error("time arithmetic left the representable range ({0} ticks)")]
    ArithmeticRange(i64),

    #[error("inverted time range: start {start} is after end {end}")]
    InvertedRange { start: SCETime, end: SCETime },

    #[error("cannot parse '{0}' as SCET (expected 'coarse:fine' or 'coarse')")]
    Parse(String),
}

// ============================================================================
// SCETime
// ============================================================================

/// A point on the spacecraft clock.
///
/// Equality and ordering consider only `(coarse, fine)`; the `time_sync`
/// flag is carried along as metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SCETime {
    coarse: u32,
    fine: u16,
    #[serde(default = "default_time_sync")]
    time_sync: bool,
}

fn default_time_sync() -> bool {
    true
}

impl SCETime {
    /// Construct from explicit parts, rejecting values outside the bit widths.
    pub fn new(coarse: i64, fine: i64) -> Result<Self, TimeError> {
        let coarse = u32::try_from(coarse).map_err(|_| TimeError::CoarseOutOfRange(coarse))?;
        let fine = u16::try_from(fine).map_err(|_| TimeError::FineOutOfRange(fine))?;
        Ok(Self::from_parts(coarse, fine))
    }

    /// Construct from already-bounded parts.
    pub const fn from_parts(coarse: u32, fine: u16) -> Self {
        Self {
            coarse,
            fine,
            time_sync: true,
        }
    }

    /// Construct from the raw wire fields. The top bit of `raw_coarse` marks
    /// an unsynchronized clock; it is extracted into `time_sync` and cleared.
    pub const fn from_raw(raw_coarse: u32, fine: u16) -> Self {
        Self {
            coarse: raw_coarse & !DESYNC_BIT,
            fine,
            time_sync: raw_coarse & DESYNC_BIT == 0,
        }
    }

    /// Nearest time to a real number of seconds.
    pub fn from_secs_f64(seconds: f64) -> Result<Self, TimeError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(TimeError::Parse(seconds.to_string()));
        }
        let mut coarse = seconds.floor() as i64;
        let mut fine = ((seconds - coarse as f64) * FINE_SCALE).round() as i64;
        if fine > i64::from(MAX_FINE) {
            coarse += 1;
            fine = 0;
        }
        Self::new(coarse, fine)
    }

    pub const fn min_time() -> Self {
        Self::from_parts(0, 0)
    }

    pub const fn max_time() -> Self {
        Self::from_parts(MAX_COARSE, MAX_FINE)
    }

    pub const fn coarse(&self) -> u32 {
        self.coarse
    }

    pub const fn fine(&self) -> u16 {
        self.fine
    }

    pub const fn time_sync(&self) -> bool {
        self.time_sync
    }

    /// Real value in seconds, `coarse + fine / 65535`.
    ///
    /// Monotone non-decreasing in the total order. Because the fine field is
    /// scaled by 65535 but carries at 65536, `(c, 65535)` and `(c + 1, 0)`
    /// share the float value `c + 1.0` while still ordering strictly.
    pub fn as_float(&self) -> f64 {
        f64::from(self.coarse) + f64::from(self.fine) / FINE_SCALE
    }

    fn ticks(&self) -> i64 {
        i64::from(self.coarse) * FINE_MODULUS + i64::from(self.fine)
    }

    fn from_ticks(ticks: i64, time_sync: bool) -> Result<Self, TimeError> {
        if ticks < 0 || ticks > Self::max_time().ticks() {
            return Err(TimeError::ArithmeticRange(ticks));
        }
        Ok(Self {
            coarse: (ticks / FINE_MODULUS) as u32,
            fine: (ticks % FINE_MODULUS) as u16,
            time_sync,
        })
    }

    /// `self + delta`, failing if the result leaves the representable range.
    pub fn checked_add(self, delta: SCETimeDelta) -> Result<Self, TimeError> {
        Self::from_ticks(self.ticks() + delta.ticks(), self.time_sync)
    }

    /// `self - delta`, failing on a negative coarse result.
    pub fn checked_sub(self, delta: SCETimeDelta) -> Result<Self, TimeError> {
        Self::from_ticks(self.ticks() - delta.ticks(), self.time_sync)
    }

    /// Onboard day number, used to split products into daily files.
    pub const fn day(&self) -> u32 {
        self.coarse / 86_400
    }
}

impl PartialEq for SCETime {
    fn eq(&self, other: &Self) -> bool {
        self.coarse == other.coarse && self.fine == other.fine
    }
}

impl Eq for SCETime {}

impl Hash for SCETime {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.coarse.hash(state);
        self.fine.hash(state);
    }
}

impl PartialOrd for SCETime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SCETime {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.coarse, self.fine).cmp(&(other.coarse, other.fine))
    }
}

impl std::ops::Sub for SCETime {
    type Output = SCETimeDelta;

    fn sub(self, rhs: Self) -> SCETimeDelta {
        // Both operands are bounded, so the difference always fits a delta.
        SCETimeDelta::from_ticks_unchecked(self.ticks() - rhs.ticks())
    }
}

impl fmt::Display for SCETime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:010}:{:05}", self.coarse, self.fine)
    }
}

impl FromStr for SCETime {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| TimeError::Parse(s.to_string()))
        };
        match s.split_once(':') {
            Some((coarse, fine)) => Self::new(parse(coarse)?, parse(fine)?),
            None => Self::new(parse(s)?, 0),
        }
    }
}

// ============================================================================
// SCETimeDelta
// ============================================================================

/// Signed difference between two [`SCETime`] values.
///
/// Normalized so that `fine` is always in `0..=65535` and the sign lives in
/// `coarse` (floor division): `-0.5 s` is `coarse = -1, fine = 32768`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SCETimeDelta {
    coarse: i64,
    fine: u16,
}

impl SCETimeDelta {
    pub fn new(coarse: i64, fine: i64) -> Result<Self, TimeError> {
        let ticks = coarse
            .checked_mul(FINE_MODULUS)
            .and_then(|c| c.checked_add(fine))
            .ok_or(TimeError::CoarseOutOfRange(coarse))?;
        let delta = Self::from_ticks_unchecked(ticks);
        if delta.coarse > i64::from(MAX_COARSE) || delta.coarse < -(i64::from(MAX_COARSE) + 1) {
            return Err(TimeError::CoarseOutOfRange(delta.coarse));
        }
        Ok(delta)
    }

    pub fn from_secs_f64(seconds: f64) -> Result<Self, TimeError> {
        if !seconds.is_finite() {
            return Err(TimeError::Parse(seconds.to_string()));
        }
        let coarse = seconds.floor();
        let fine = ((seconds - coarse) * FINE_SCALE).round() as i64;
        Self::new(coarse as i64, fine)
    }

    pub const fn zero() -> Self {
        Self { coarse: 0, fine: 0 }
    }

    fn from_ticks_unchecked(ticks: i64) -> Self {
        Self {
            coarse: ticks.div_euclid(FINE_MODULUS),
            fine: ticks.rem_euclid(FINE_MODULUS) as u16,
        }
    }

    fn ticks(&self) -> i64 {
        self.coarse * FINE_MODULUS + i64::from(self.fine)
    }

    pub const fn coarse(&self) -> i64 {
        self.coarse
    }

    pub const fn fine(&self) -> u16 {
        self.fine
    }

    pub fn as_float(&self) -> f64 {
        self.coarse as f64 + f64::from(self.fine) / FINE_SCALE
    }

    /// Half of the delta, rounded towards negative infinity.
    pub fn half(&self) -> Self {
        Self::from_ticks_unchecked(self.ticks().div_euclid(2))
    }
}

impl std::ops::Add for SCETimeDelta {
    type Output = SCETimeDelta;

    fn add(self, rhs: Self) -> Self {
        Self::from_ticks_unchecked(self.ticks() + rhs.ticks())
    }
}

impl std::ops::Neg for SCETimeDelta {
    type Output = SCETimeDelta;

    fn neg(self) -> Self {
        Self::from_ticks_unchecked(-self.ticks())
    }
}

impl fmt::Display for SCETimeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:05}", self.coarse, self.fine)
    }
}

// ============================================================================
// SCETimeRange
// ============================================================================

/// Closed interval `[start, end]` with `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct SCETimeRange {
    start: SCETime,
    end: SCETime,
}

#[derive(Deserialize)]
struct RawRange {
    start: SCETime,
    end: SCETime,
}

impl TryFrom<RawRange> for SCETimeRange {
    type Error = TimeError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        Self::new(raw.start, raw.end)
    }
}

impl SCETimeRange {
    pub fn new(start: SCETime, end: SCETime) -> Result<Self, TimeError> {
        if start > end {
            return Err(TimeError::InvertedRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Degenerate range containing a single instant.
    pub const fn instant(time: SCETime) -> Self {
        Self {
            start: time,
            end: time,
        }
    }

    pub const fn start(&self) -> SCETime {
        self.start
    }

    pub const fn end(&self) -> SCETime {
        self.end
    }

    /// Grow the range to cover `other`. Never shrinks.
    pub fn expand<R: Into<SCETimeRange>>(&mut self, other: R) {
        let other = other.into();
        self.start = self.start.min(other.start);
        self.end = self.end.max(other.end);
    }

    /// `start <= time <= end`
    pub fn contains(&self, time: SCETime) -> bool {
        self.start <= time && time <= self.end
    }

    pub fn contains_range(&self, other: &SCETimeRange) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }

    pub fn overlaps(&self, other: &SCETimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn duration(&self) -> SCETimeDelta {
        self.end - self.start
    }

    /// Midpoint of the range.
    pub fn avg(&self) -> SCETime {
        let midpoint = SCETime::from_ticks(self.start.ticks() + self.duration().half().ticks(), self.start.time_sync);
        // The midpoint of two in-range times is in range.
        midpoint.unwrap_or(self.start)
    }
}

impl From<SCETime> for SCETimeRange {
    fn from(time: SCETime) -> Self {
        Self::instant(time)
    }
}

impl fmt::Display for SCETimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}
