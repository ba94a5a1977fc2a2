//! Exact media time arithmetic.
//!
//! All times are carried as a signed count of 100ns ticks (HNS). A value can additionally be
//! invalid or infinite, and both states propagate through arithmetic instead of silently
//! turning into a finite number.

use std::{
    cmp::Ordering,
    fmt,
    ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const HNS_PER_SECOND: i64 = 10_000_000;
pub const HNS_PER_MILLISECOND: i64 = 10_000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TimeValue {
    hns: i64,
    valid: bool,
    infinite: bool,
}

impl Default for TimeValue {
    fn default() -> Self {
        Self::invalid()
    }
}

impl TimeValue {
    pub const fn invalid() -> Self {
        Self {
            hns: 0,
            valid: false,
            infinite: false,
        }
    }

    pub const fn zero() -> Self {
        Self::from_hns(0)
    }

    pub const fn positive_infinity() -> Self {
        Self {
            hns: i64::MAX,
            valid: true,
            infinite: true,
        }
    }

    pub const fn negative_infinity() -> Self {
        Self {
            hns: i64::MIN,
            valid: true,
            infinite: true,
        }
    }

    pub const fn from_hns(hns: i64) -> Self {
        Self {
            hns,
            valid: true,
            infinite: false,
        }
    }

    pub fn from_seconds(seconds: f64) -> Self {
        if seconds.is_nan() {
            return Self::invalid();
        }
        if seconds.is_infinite() {
            return if seconds > 0.0 {
                Self::positive_infinity()
            } else {
                Self::negative_infinity()
            };
        }
        let hns = seconds * HNS_PER_SECOND as f64;
        if hns >= i64::MAX as f64 {
            Self::positive_infinity()
        } else if hns <= i64::MIN as f64 {
            Self::negative_infinity()
        } else {
            Self::from_hns(hns.round() as i64)
        }
    }

    pub const fn from_milliseconds(ms: i64) -> Self {
        Self::from_hns(ms.saturating_mul(HNS_PER_MILLISECOND))
    }

    /// Creates a value from `value / timescale` seconds without going through floating point.
    pub fn from_timebase(value: i64, timescale: u64) -> Self {
        if timescale == 0 {
            return Self::invalid();
        }
        let hns = value as i128 * HNS_PER_SECOND as i128 / timescale as i128;
        Self::from_i128(hns)
    }

    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        let micros = time.timestamp_micros();
        Self::from_hns(micros.saturating_mul(10))
    }

    fn from_i128(hns: i128) -> Self {
        if hns > i64::MAX as i128 {
            Self::positive_infinity()
        } else if hns < i64::MIN as i128 {
            Self::negative_infinity()
        } else {
            Self::from_hns(hns as i64)
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.valid
    }

    pub const fn is_infinity(&self) -> bool {
        self.valid && self.infinite
    }

    pub const fn is_positive_infinity(&self) -> bool {
        self.is_infinity() && self.hns > 0
    }

    pub const fn is_negative_infinity(&self) -> bool {
        self.is_infinity() && self.hns < 0
    }

    /// Valid and not infinite.
    pub const fn is_finite(&self) -> bool {
        self.valid && !self.infinite
    }

    pub const fn is_zero(&self) -> bool {
        self.is_finite() && self.hns == 0
    }

    pub const fn as_hns(&self) -> i64 {
        self.hns
    }

    pub fn as_seconds(&self) -> f64 {
        self.as_seconds_or(0.0)
    }

    pub fn as_seconds_or(&self, default: f64) -> f64 {
        if !self.valid {
            default
        } else if self.infinite {
            if self.hns > 0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            }
        } else {
            self.hns as f64 / HNS_PER_SECOND as f64
        }
    }

    pub fn as_milliseconds(&self) -> i64 {
        if self.infinite {
            self.hns
        } else {
            self.hns / HNS_PER_MILLISECOND
        }
    }

    /// Converts to a count of `1/timescale` units, truncating toward zero.
    ///
    /// Infinite values saturate, invalid values yield 0.
    pub fn as_timebase(&self, timescale: u64) -> i64 {
        if !self.valid {
            return 0;
        }
        if self.infinite {
            return self.hns;
        }
        let v = self.hns as i128 * timescale as i128 / HNS_PER_SECOND as i128;
        v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        if !self.is_finite() {
            return None;
        }
        Utc.timestamp_micros(self.hns / 10).single()
    }

    pub fn std_duration(&self) -> std::time::Duration {
        if !self.is_finite() || self.hns <= 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_nanos((self.hns as u64).saturating_mul(100))
    }

    pub fn max(self, other: Self) -> Self {
        match self.partial_cmp(&other) {
            Some(Ordering::Less) => other,
            Some(_) => self,
            None => Self::invalid(),
        }
    }

    pub fn min(self, other: Self) -> Self {
        match self.partial_cmp(&other) {
            Some(Ordering::Greater) => other,
            Some(_) => self,
            None => Self::invalid(),
        }
    }

    /// Returns `self` when valid, otherwise `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        if self.valid {
            self
        } else {
            fallback
        }
    }
}

impl From<std::time::Duration> for TimeValue {
    fn from(value: std::time::Duration) -> Self {
        Self::from_i128((value.as_nanos() / 100) as i128)
    }
}

impl PartialEq for TimeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self.valid, other.valid) {
            (false, false) => true,
            (true, true) => self.infinite == other.infinite && self.hns == other.hns,
            _ => false,
        }
    }
}

impl PartialOrd for TimeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.valid || !other.valid {
            return None;
        }
        Some(self.hns.cmp(&other.hns))
    }
}

impl Add for TimeValue {
    type Output = TimeValue;

    fn add(self, rhs: Self) -> Self::Output {
        if !self.valid || !rhs.valid {
            return Self::invalid();
        }
        match (self.infinite, rhs.infinite) {
            (true, true) => {
                if (self.hns > 0) == (rhs.hns > 0) {
                    self
                } else {
                    Self::invalid()
                }
            }
            (true, false) => self,
            (false, true) => rhs,
            (false, false) => Self::from_i128(self.hns as i128 + rhs.hns as i128),
        }
    }
}

impl Neg for TimeValue {
    type Output = TimeValue;

    fn neg(self) -> Self::Output {
        if !self.valid {
            return self;
        }
        if self.infinite {
            return if self.hns > 0 {
                Self::negative_infinity()
            } else {
                Self::positive_infinity()
            };
        }
        Self::from_i128(-(self.hns as i128))
    }
}

impl Sub for TimeValue {
    type Output = TimeValue;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn sub(self, rhs: Self) -> Self::Output {
        self + (-rhs)
    }
}

impl AddAssign for TimeValue {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for TimeValue {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<i64> for TimeValue {
    type Output = TimeValue;

    fn mul(self, rhs: i64) -> Self::Output {
        if !self.valid {
            return self;
        }
        if self.infinite {
            return match rhs.cmp(&0) {
                Ordering::Equal => Self::invalid(),
                Ordering::Greater => self,
                Ordering::Less => -self,
            };
        }
        Self::from_i128(self.hns as i128 * rhs as i128)
    }
}

impl Div<i64> for TimeValue {
    type Output = TimeValue;

    fn div(self, rhs: i64) -> Self::Output {
        if !self.valid || rhs == 0 {
            return Self::invalid();
        }
        if self.infinite {
            return if rhs > 0 { self } else { -self };
        }
        Self::from_hns(self.hns / rhs)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.valid {
            write!(f, "invalid")
        } else if self.is_positive_infinity() {
            write!(f, "+inf")
        } else if self.is_negative_infinity() {
            write!(f, "-inf")
        } else {
            write!(f, "{:.3}s", self.as_seconds())
        }
    }
}

/// A rational time `numerator / denominator` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeFraction {
    numerator: i64,
    denominator: u32,
}

impl TimeFraction {
    pub const fn new(numerator: i64, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.denominator != 0
    }

    pub const fn numerator(&self) -> i64 {
        self.numerator
    }

    pub const fn denominator(&self) -> u32 {
        self.denominator
    }

    pub fn as_time_value(&self) -> TimeValue {
        TimeValue::from_timebase(self.numerator, self.denominator as u64)
    }

    /// Rescales the fraction into `timescale` units, truncating toward zero.
    pub fn get_as_timebase(&self, timescale: u64) -> i64 {
        if self.denominator == 0 {
            return 0;
        }
        if self.denominator as u64 == timescale {
            return self.numerator;
        }
        let v = self.numerator as i128 * timescale as i128 / self.denominator as i128;
        v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimeValue,
    pub end: TimeValue,
}

impl TimeRange {
    pub fn new(start: TimeValue, end: TimeValue) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_valid() && self.end.is_valid() && self.start <= self.end
    }

    pub fn contains(&self, time: TimeValue) -> bool {
        self.is_valid() && time >= self.start && time < self.end
    }

    pub fn duration(&self) -> TimeValue {
        self.end - self.start
    }
}
