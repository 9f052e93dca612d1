//! Layout-independent timing primitives.
//!
//! Multi-input filters walk several waveforms of different timescale and
//! phase in lockstep with these. All results are in X units (fs for
//! time-domain data).

use super::WaveformBase;

/// Start of sample `i`: `trigger_phase + (offsets[i] or i) * timescale`.
#[inline]
pub fn get_offset_scaled<W: WaveformBase + ?Sized>(w: &W, i: usize) -> i64 {
    let h = w.header();
    let units = match w.sparse_offsets() {
        Some(offsets) => offsets[i],
        None => i as i64,
    };
    h.trigger_phase + units * h.timescale
}

/// Length of sample `i`: `(durations[i] or 1) * timescale`.
#[inline]
pub fn get_duration_scaled<W: WaveformBase + ?Sized>(w: &W, i: usize) -> i64 {
    let units = match w.sparse_durations() {
        Some(durations) => durations[i],
        None => 1,
    };
    units * w.header().timescale
}

/// Step `i` forward while sample `i` ends at or before `t`.
///
/// Stops at the last sample, so `i` stays a valid index when `len > 0`.
pub fn advance_to_timestamp_scaled<W: WaveformBase + ?Sized>(w: &W, i: &mut usize, len: usize, t: i64) {
    while *i + 1 < len && get_offset_scaled(w, *i) + get_duration_scaled(w, *i) <= t {
        *i += 1;
    }
}

/// The first sample boundary strictly after `t`, looking at sample `i` and
/// the start of sample `i + 1`. `i64::MAX` if there is none.
pub fn get_next_event_timestamp_scaled<W: WaveformBase + ?Sized>(
    w: &W,
    i: usize,
    len: usize,
    t: i64,
) -> i64 {
    if i >= len {
        return i64::MAX;
    }
    let start = get_offset_scaled(w, i);
    if start > t {
        return start;
    }
    let end = start + get_duration_scaled(w, i);
    if end > t {
        return end;
    }
    if i + 1 < len {
        let next = get_offset_scaled(w, i + 1);
        if next > t {
            return next;
        }
    }
    i64::MAX
}
