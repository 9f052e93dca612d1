//! Timing metadata carried by every waveform.

use serde::{Deserialize, Serialize};

/// Femtoseconds per second.
pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// Femtoseconds per nanosecond.
pub const FS_PER_NANOSECOND: i64 = 1_000_000;

/// Femtoseconds per picosecond.
pub const FS_PER_PICOSECOND: i64 = 1_000;

/// Header flag: at least one sample hit the ADC rails.
pub const FLAG_CLIPPING: u8 = 0x01;

/// Acquisition timestamp plus the two numbers that place sample `i` on the
/// time (or frequency) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformHeader {
    /// Wall-clock time of sample 0, whole seconds since the Unix epoch.
    pub start_timestamp: i64,
    /// Sub-second part of the start time, in femtoseconds.
    pub start_femtoseconds: i64,
    /// X units per sample index (fs for time-domain data, Hz for spectra).
    pub timescale: i64,
    /// Offset of sample 0 from the nominal zero, in X units.
    pub trigger_phase: i64,
    pub flags: u8,
    /// Bumped every time the producer rewrites the waveform.
    pub revision: u64,
}

impl Default for WaveformHeader {
    fn default() -> Self {
        Self {
            start_timestamp: 0,
            start_femtoseconds: 0,
            timescale: 1,
            trigger_phase: 0,
            flags: 0,
            revision: 0,
        }
    }
}

impl WaveformHeader {
    pub fn new(timescale: i64, trigger_phase: i64) -> Self {
        Self {
            timescale,
            trigger_phase,
            ..Default::default()
        }
    }

    /// Set the start time to the current wall clock.
    pub fn stamp_now(&mut self) {
        self.set_start_time(chrono::Utc::now());
    }

    pub fn set_start_time(&mut self, time: chrono::DateTime<chrono::Utc>) {
        self.start_timestamp = time.timestamp();
        self.start_femtoseconds = time.timestamp_subsec_nanos() as i64 * FS_PER_NANOSECOND;
    }

    /// Start time as a UTC date, if representable.
    pub fn start_time(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let nanos = (self.start_femtoseconds / FS_PER_NANOSECOND).clamp(0, 999_999_999) as u32;
        chrono::DateTime::from_timestamp(self.start_timestamp, nanos)
    }

    /// Start time as fractional seconds since the epoch.
    pub fn start_seconds(&self) -> f64 {
        self.start_timestamp as f64 + self.start_femtoseconds as f64 / FS_PER_SECOND as f64
    }

    /// Copy the acquisition time and axis placement from another header.
    pub fn copy_timing_from(&mut self, other: &WaveformHeader) {
        self.start_timestamp = other.start_timestamp;
        self.start_femtoseconds = other.start_femtoseconds;
        self.timescale = other.timescale;
        self.trigger_phase = other.trigger_phase;
    }

    pub fn is_clipping(&self) -> bool {
        self.flags & FLAG_CLIPPING != 0
    }

    pub fn bump_revision(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_start_time_round_trip() {
        let t = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(250);
        let mut h = WaveformHeader::default();
        h.set_start_time(t);
        assert_eq!(h.start_femtoseconds, 250 * FS_PER_NANOSECOND);
        assert_eq!(h.start_time(), Some(t));
    }

    #[test]
    fn test_copy_timing_keeps_revision() {
        let mut a = WaveformHeader::new(100, 50);
        a.revision = 7;
        let b = WaveformHeader::new(10, 0);
        a.copy_timing_from(&b);
        assert_eq!(a.timescale, 10);
        assert_eq!(a.trigger_phase, 0);
        assert_eq!(a.revision, 7);
    }
}
