//! Scalar history for analog-scalar streams.
//!
//! Each time a scalar stream changes the scheduler appends `(time, value)` to
//! the stream's accumulator. The accumulator keeps a bounded window plus
//! running statistics over that window, and can render the window as a sparse
//! analog waveform for plotting.

use crate::waveform::{SparseWaveform, FS_PER_SECOND};
use std::collections::VecDeque;

/// Default number of points kept per scalar stream.
pub const DEFAULT_TREND_DEPTH: usize = 1024;

/// Running min / max / sum over a sliding window.
///
/// `pop` only fixes the sum and count; min and max are recomputed lazily by
/// the owner when the popped value was an extreme.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    pub count: usize,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn push(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
    }

    #[inline]
    pub fn pop(&mut self, v: f64) {
        self.count = self.count.saturating_sub(1);
        self.sum -= v;
    }

    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct TrendAccumulator {
    depth: usize,
    /// `(seconds since epoch, value)`, oldest first.
    points: VecDeque<(f64, f64)>,
    stats: RunningStats,
}

impl TrendAccumulator {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            points: VecDeque::new(),
            stats: RunningStats::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a point; non-finite values are ignored.
    pub fn push(&mut self, time: f64, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.points.len() == self.depth {
            if let Some((_, old)) = self.points.pop_front() {
                self.stats.pop(old);
                if old <= self.stats.min || old >= self.stats.max {
                    self.recompute_extremes();
                }
            }
        }
        self.points.push_back((time, value));
        self.stats.push(value);
    }

    fn recompute_extremes(&mut self) {
        let (min, max) = self
            .points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(_, v)| {
                (lo.min(v), hi.max(v))
            });
        self.stats.min = min;
        self.stats.max = max;
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points.iter().copied()
    }

    pub fn last(&self) -> Option<(f64, f64)> {
        self.points.back().copied()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.stats.reset();
    }

    /// Render the window as a sparse analog waveform at 1 fs resolution.
    ///
    /// The header's start time is the first point; each sample lasts until
    /// the next one and the last sample has unit duration.
    pub fn to_waveform(&self) -> SparseWaveform<f32> {
        let mut w = SparseWaveform::new(1, 0);
        let Some(&(t0, _)) = self.points.front() else {
            return w;
        };
        w.header.start_timestamp = t0.floor() as i64;
        w.header.start_femtoseconds = ((t0 - t0.floor()) * FS_PER_SECOND as f64) as i64;

        let offsets: Vec<i64> = self
            .points
            .iter()
            .map(|&(t, _)| ((t - t0) * FS_PER_SECOND as f64).round() as i64)
            .collect();
        for (i, &(_, v)) in self.points.iter().enumerate() {
            let duration = offsets.get(i + 1).map_or(1, |next| (next - offsets[i]).max(1));
            w.push(offsets[i], duration, v as f32);
        }
        w
    }
}

impl Default for TrendAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_TREND_DEPTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::WaveformBase;

    #[test]
    fn test_running_stats() {
        let mut s = RunningStats::new();
        assert_eq!(s.average(), None);
        s.push(1.0);
        s.push(3.0);
        assert_eq!(s.average(), Some(2.0));
        assert_eq!((s.min, s.max), (1.0, 3.0));
        s.pop(1.0);
        assert_eq!(s.average(), Some(3.0));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut t = TrendAccumulator::new(3);
        for (i, v) in [5.0, 1.0, 2.0, 3.0].into_iter().enumerate() {
            t.push(i as f64, v);
        }
        assert_eq!(t.len(), 3);
        assert_eq!(t.stats().max, 3.0);
        assert_eq!(t.stats().min, 1.0);
        assert_eq!(t.stats().average(), Some(2.0));
    }

    #[test]
    fn test_non_finite_ignored() {
        let mut t = TrendAccumulator::new(4);
        t.push(0.0, f64::NAN);
        t.push(1.0, f64::INFINITY);
        assert!(t.is_empty());
    }

    #[test]
    fn test_to_waveform() {
        let mut t = TrendAccumulator::new(8);
        t.push(100.0, 1.0);
        t.push(100.5, 2.0);
        t.push(101.0, 3.0);
        let w = t.to_waveform();
        assert_eq!(w.len(), 3);
        assert!(w.is_well_formed());
        assert_eq!(w.header.start_timestamp, 100);
        assert_eq!(w.offsets.as_slice(), &[0, FS_PER_SECOND / 2, FS_PER_SECOND]);
        assert_eq!(w.durations[2], 1);
        assert_eq!(w.samples.as_slice(), &[1.0, 2.0, 3.0]);
    }
}
