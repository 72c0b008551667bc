// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Nanosecond clock time and exact integer scaling.
//!
//! All timeline arithmetic in the aggregator goes through [`scale`] and
//! [`scale_ceil`], which compute `val * num / denom` in 128-bit precision so
//! sample offsets never pick up rounding drift.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;
use ts_rs::TS;

/// A point or span on the media timeline, in nanoseconds.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    TS,
)]
#[ts(export)]
#[serde(transparent)]
pub struct ClockTime(pub u64);

impl ClockTime {
    pub const ZERO: Self = Self(0);
    pub const NSECOND: u64 = 1;
    pub const USECOND: u64 = 1_000;
    pub const MSECOND: u64 = 1_000_000;
    pub const SECOND: u64 = 1_000_000_000;

    pub const fn from_nseconds(ns: u64) -> Self {
        Self(ns)
    }

    pub const fn from_mseconds(ms: u64) -> Self {
        Self(ms.saturating_mul(Self::MSECOND))
    }

    pub const fn from_seconds(s: u64) -> Self {
        Self(s.saturating_mul(Self::SECOND))
    }

    pub const fn nseconds(self) -> u64 {
        self.0
    }

    pub const fn mseconds(self) -> u64 {
        self.0 / Self::MSECOND
    }

    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Absolute distance between two times.
    pub const fn abs_diff(self, other: Self) -> Self {
        Self(self.0.abs_diff(other.0))
    }

    /// Duration of `frames` samples at `rate` Hz, truncated.
    pub fn from_frames(frames: u64, rate: u32) -> Self {
        Self(scale(frames, Self::SECOND, u64::from(rate)))
    }

    /// Duration of `frames` samples at `rate` Hz, rounded up.
    pub fn from_frames_ceil(frames: u64, rate: u32) -> Self {
        Self(scale_ceil(frames, Self::SECOND, u64::from(rate)))
    }

    /// Number of whole samples at `rate` Hz that fit in this span.
    pub fn to_frames(self, rate: u32) -> u64 {
        scale(self.0, u64::from(rate), Self::SECOND)
    }
}

impl Add for ClockTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sub for ClockTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<Duration> for ClockTime {
    #[allow(clippy::cast_possible_truncation)] // u64 nanoseconds covers ~584 years
    fn from(d: Duration) -> Self {
        Self(d.as_nanos().min(u128::from(u64::MAX)) as u64)
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Self::from_nanos(t.0)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 / Self::SECOND;
        let nanos = self.0 % Self::SECOND;
        write!(f, "{}:{:02}:{:02}.{:09}", secs / 3600, (secs / 60) % 60, secs % 60, nanos)
    }
}

/// Computes `val * num / denom` without intermediate overflow, truncating.
///
/// Saturates at `u64::MAX`; a zero `denom` yields `u64::MAX`.
#[allow(clippy::cast_possible_truncation)]
pub fn scale(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let r = u128::from(val) * u128::from(num) / u128::from(denom);
    r.min(u128::from(u64::MAX)) as u64
}

/// Computes `val * num / denom` without intermediate overflow, rounding up.
#[allow(clippy::cast_possible_truncation)]
pub fn scale_ceil(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let r = (u128::from(val) * u128::from(num)).div_ceil(u128::from(denom));
    r.min(u128::from(u64::MAX)) as u64
}

/// Greatest common divisor, used to normalize duration fractions.
pub const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
