// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Time-format playback segments.
//!
//! A segment maps buffer timestamps to running time (the shared clock every
//! pad is synchronized against) and to stream time (the position reported to
//! users). Only forward playback is supported; constructing a segment with a
//! non-positive rate fails with [`MixKitError::Unsupported`].

use crate::error::MixKitError;
use crate::time::ClockTime;

/// A TIME segment: `[start, stop)` played at `rate`, accumulated into running time from `base`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub rate: f64,
    pub start: ClockTime,
    pub stop: Option<ClockTime>,
    /// Stream time corresponding to `start`.
    pub time: ClockTime,
    /// Running time corresponding to `start`.
    pub base: ClockTime,
    /// Last known position; `None` until something was played.
    pub position: Option<ClockTime>,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: ClockTime::ZERO,
            stop: None,
            time: ClockTime::ZERO,
            base: ClockTime::ZERO,
            position: None,
        }
    }
}

impl Segment {
    /// Creates a segment covering `[start, stop)` at the given rate.
    ///
    /// # Errors
    ///
    /// Returns `MixKitError::Unsupported` for negative rates and
    /// `MixKitError::Configuration` for a zero rate or `stop < start`.
    pub fn new(rate: f64, start: ClockTime, stop: Option<ClockTime>) -> Result<Self, MixKitError> {
        let segment = Self { rate, start, stop, time: start, ..Self::default() };
        segment.validate()?;
        Ok(segment)
    }

    /// # Errors
    ///
    /// See [`Segment::new`].
    pub fn validate(&self) -> Result<(), MixKitError> {
        if self.rate < 0.0 {
            return Err(MixKitError::Unsupported(format!(
                "negative playback rate {} is not supported",
                self.rate
            )));
        }
        if self.rate == 0.0 || !self.rate.is_finite() {
            return Err(MixKitError::Configuration(format!("invalid segment rate {}", self.rate)));
        }
        if let Some(stop) = self.stop {
            if stop < self.start {
                return Err(MixKitError::Configuration(format!(
                    "segment stop {stop} is before start {}",
                    self.start
                )));
            }
        }
        Ok(())
    }

    fn is_inside(&self, position: ClockTime) -> bool {
        position >= self.start && self.stop.is_none_or(|stop| position <= stop)
    }

    #[allow(clippy::float_cmp, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    #[allow(clippy::cast_precision_loss)]
    fn scale_rate(&self, t: u64, divide: bool) -> u64 {
        let abs_rate = self.rate.abs();
        if abs_rate == 1.0 {
            return t;
        }
        let scaled = if divide { t as f64 / abs_rate } else { t as f64 * abs_rate };
        scaled as u64
    }

    /// Converts a timestamp into running time, or `None` when it lies outside the segment.
    pub fn to_running_time(&self, position: ClockTime) -> Option<ClockTime> {
        if !self.is_inside(position) {
            return None;
        }
        let offset = self.scale_rate((position - self.start).nseconds(), true);
        Some(self.base + ClockTime(offset))
    }

    /// Inverse of [`Segment::to_running_time`].
    pub fn position_from_running_time(&self, running_time: ClockTime) -> Option<ClockTime> {
        let elapsed = running_time.checked_sub(self.base)?;
        let position = self.start + ClockTime(self.scale_rate(elapsed.nseconds(), false));
        if self.stop.is_some_and(|stop| position > stop) {
            return None;
        }
        Some(position)
    }

    /// Converts a timestamp into stream time.
    pub fn to_stream_time(&self, position: ClockTime) -> Option<ClockTime> {
        if !self.is_inside(position) {
            return None;
        }
        Some(self.time + (position - self.start))
    }

    /// Clips `[start, stop)` to the segment.
    ///
    /// Returns `None` when the range is completely outside of it.
    pub fn clip(
        &self,
        start: ClockTime,
        stop: Option<ClockTime>,
    ) -> Option<(ClockTime, Option<ClockTime>)> {
        if let Some(seg_stop) = self.stop {
            if start > seg_stop || (self.start != seg_stop && start == seg_stop) {
                return None;
            }
        }
        if let Some(stop) = stop {
            if stop < self.start || (start != stop && stop == self.start) {
                return None;
            }
        }

        let clip_start = start.max(self.start);
        let clip_stop = match (stop, self.stop) {
            (Some(stop), Some(seg_stop)) => Some(stop.min(seg_stop)),
            (Some(stop), None) => Some(stop),
            (None, seg_stop) => seg_stop,
        };
        Some((clip_start, clip_stop))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ms(v: u64) -> ClockTime {
        ClockTime::from_mseconds(v)
    }

    #[test]
    fn negative_rate_is_unsupported() {
        let err = Segment::new(-1.0, ClockTime::ZERO, None).unwrap_err();
        assert!(matches!(err, MixKitError::Unsupported(_)));

        let err = Segment::new(0.0, ClockTime::ZERO, None).unwrap_err();
        assert!(matches!(err, MixKitError::Configuration(_)));
    }

    #[test]
    fn running_time_round_trip() {
        let mut seg = Segment::new(1.0, ms(100), Some(ms(500))).unwrap();
        seg.base = ms(1000);

        assert_eq!(seg.to_running_time(ms(150)), Some(ms(1050)));
        assert_eq!(seg.position_from_running_time(ms(1050)), Some(ms(150)));
        assert_eq!(seg.to_running_time(ms(50)), None);
        assert_eq!(seg.to_running_time(ms(600)), None);
        assert_eq!(seg.position_from_running_time(ms(999)), None);
        assert_eq!(seg.position_from_running_time(ms(1401)), None);
    }

    #[test]
    fn stream_time_starts_at_segment_time() {
        let mut seg = Segment::new(1.0, ms(100), None).unwrap();
        seg.time = ms(5000);
        assert_eq!(seg.to_stream_time(ms(100)), Some(ms(5000)));
        assert_eq!(seg.to_stream_time(ms(350)), Some(ms(5250)));
    }

    #[test]
    fn faster_rate_compresses_running_time() {
        let seg = Segment::new(2.0, ClockTime::ZERO, None).unwrap();
        assert_eq!(seg.to_running_time(ms(200)), Some(ms(100)));
        assert_eq!(seg.position_from_running_time(ms(100)), Some(ms(200)));
    }

    #[test]
    fn clip_trims_to_segment_bounds() {
        let seg = Segment::new(1.0, ms(100), Some(ms(200))).unwrap();

        assert_eq!(seg.clip(ms(50), Some(ms(150))), Some((ms(100), Some(ms(150)))));
        assert_eq!(seg.clip(ms(150), Some(ms(250))), Some((ms(150), Some(ms(200)))));
        assert_eq!(seg.clip(ms(0), Some(ms(100))), None);
        assert_eq!(seg.clip(ms(200), Some(ms(300))), None);
        assert_eq!(seg.clip(ms(120), None), Some((ms(120), Some(ms(200)))));
    }
}
