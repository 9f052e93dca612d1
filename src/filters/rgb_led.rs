//! Single-wire RGB LED (WS2812-style) decoder.
//!
//! Each bit is a high pulse followed by a low pulse: long then short is a 1,
//! short then long a 0. A long low pulse resets the chain. Every 24 bits form
//! one LED word, MSB first, in the order the LED receives them. The final bit
//! before a reset has its low half swallowed by the reset and is decoded from
//! its high half alone.

use crate::pipeline::{
    is_digital, Filter, FilterCategory, FilterCore, FilterParameter, PipelineResult, RefreshContext, Stream,
};
use crate::types::Color;
use crate::waveform::{
    digital_value, get_duration_scaled, get_offset_scaled, ProtocolSymbol, SparseWaveform, Waveform, WaveformBase,
    FS_PER_NANOSECOND,
};

/// Set in a word's data when any of its bits was malformed.
pub const ERROR_FLAG: u32 = 1 << 31;

const BITS_PER_LED: u32 = 24;
const RESET_FS: i64 = 50_000 * FS_PER_NANOSECOND;
const FIRST_RESET_FS: i64 = 5_000 * FS_PER_NANOSECOND;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RgbLedSymbol {
    #[default]
    Reset,
    /// 24-bit word, possibly with [`ERROR_FLAG`].
    Color(u32),
    /// Bits that did not add up to a whole word before a reset.
    Garbage,
}

impl crate::accel::Element for RgbLedSymbol {}

impl ProtocolSymbol for RgbLedSymbol {
    fn text(&self) -> String {
        match *self {
            RgbLedSymbol::Reset => "RESET".to_string(),
            RgbLedSymbol::Color(d) if d & ERROR_FLAG != 0 => format!("#{:06X} (ERROR)", d & 0x00ff_ffff),
            RgbLedSymbol::Color(d) => format!("#{:06X}", d),
            RgbLedSymbol::Garbage => "ERROR".to_string(),
        }
    }

    fn color(&self) -> Color {
        match *self {
            RgbLedSymbol::Reset => Color::PREAMBLE,
            RgbLedSymbol::Color(d) if d & ERROR_FLAG == 0 => Color::rgb((d >> 16) as u8, (d >> 8) as u8, d as u8),
            _ => Color::ERROR,
        }
    }
}

/// Pulse widths of one LED family, in ns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbLedTiming {
    pub long_ns: i64,
    pub short_ns: i64,
    pub tolerance_ns: i64,
}

impl RgbLedTiming {
    pub const WS2812: Self = Self {
        long_ns: 800,
        short_ns: 450,
        tolerance_ns: 150,
    };
    pub const EVERLIGHT: Self = Self {
        long_ns: 900,
        short_ns: 300,
        tolerance_ns: 80,
    };

    fn classify(&self, width_fs: i64) -> Pulse {
        let within = |nominal: i64| (width_fs - nominal * FS_PER_NANOSECOND).abs() <= self.tolerance_ns * FS_PER_NANOSECOND;
        if within(self.long_ns) {
            Pulse::Long
        } else if within(self.short_ns) {
            Pulse::Short
        } else {
            Pulse::Bad
        }
    }

    fn bit_period_fs(&self) -> i64 {
        (self.long_ns + self.short_ns) * FS_PER_NANOSECOND
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    Long,
    Short,
    Bad,
}

/// A maximal run of one level.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: i64,
    len: i64,
    high: bool,
}

fn runs(w: &Waveform) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::new();
    for i in 0..w.len() {
        let Some(high) = digital_value(w, i) else {
            continue;
        };
        let (start, len) = (get_offset_scaled(w, i), get_duration_scaled(w, i));
        match out.last_mut() {
            Some(r) if r.high == high && r.start + r.len == start => r.len += len,
            _ => out.push(Run { start, len, high }),
        }
    }
    out
}

/// Decode a digital LED data line.
pub fn decode_rgb_led(w: &Waveform, timing: RgbLedTiming) -> SparseWaveform<RgbLedSymbol> {
    let mut out = SparseWaveform::new(1, 0);
    let runs = runs(w);
    let is_reset = |r: &Run, first: bool| !r.high && r.len > if first { FIRST_RESET_FS } else { RESET_FS };

    let mut synced = false;
    let (mut word, mut nbits, mut error, mut word_start) = (0u32, 0u32, false, 0i64);
    let mut i = 0;
    while i < runs.len() {
        let run = runs[i];
        if !run.high {
            if is_reset(&run, i == 0) {
                if nbits > 0 {
                    out.push(word_start, run.start - word_start, RgbLedSymbol::Garbage);
                }
                out.push(run.start, run.len, RgbLedSymbol::Reset);
                synced = true;
                (word, nbits, error) = (0, 0, false);
            }
            i += 1;
            continue;
        }
        if !synced {
            i += 1;
            continue;
        }

        let high = timing.classify(run.len);
        let (bit, end) = match runs.get(i + 1) {
            Some(low) if is_reset(low, false) => {
                // Low half merged into the reset
                i += 1;
                let bit = match high {
                    Pulse::Long => Some(1),
                    Pulse::Short => Some(0),
                    Pulse::Bad => None,
                };
                (bit, run.start + timing.bit_period_fs())
            }
            Some(low) => {
                i += 2;
                let bit = match (high, timing.classify(low.len)) {
                    (Pulse::Long, Pulse::Short) => Some(1),
                    (Pulse::Short, Pulse::Long) => Some(0),
                    _ => None,
                };
                (bit, low.start + low.len)
            }
            None => break,
        };

        if nbits == 0 {
            word_start = run.start;
        }
        word = (word << 1) | bit.unwrap_or(0);
        error |= bit.is_none();
        nbits += 1;
        if nbits == BITS_PER_LED {
            let data = if error { word | ERROR_FLAG } else { word };
            out.push(word_start, end - word_start, RgbLedSymbol::Color(data));
            (word, nbits, error) = (0, 0, false);
        }
    }
    out
}

pub struct RgbLedDecoder {
    core: FilterCore,
}

impl RgbLedDecoder {
    pub const PROTOCOL: &'static str = "RGB LED";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Misc, Color::rgb(0xff, 0x60, 0x00));
        core.add_input("din");
        core.add_stream(Stream::protocol("data"));
        core.parameters.insert(
            "Type",
            FilterParameter::enumeration(&[("WS2812", 0), ("Everlight", 1)]),
        );
        Self { core }
    }

    fn timing(&self) -> RgbLedTiming {
        match self.core.parameters.int("Type") {
            1 => RgbLedTiming::EVERLIGHT,
            _ => RgbLedTiming::WS2812,
        }
    }
}

impl Default for RgbLedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for RgbLedDecoder {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0 && is_digital(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let din = ctx.inputs.require_waveform(0)?;
        let mut out = decode_rgb_led(din, self.timing());
        out.header.start_timestamp = din.header().start_timestamp;
        out.header.start_femtoseconds = din.header().start_femtoseconds;
        tracing::debug!("RGB LED: {} symbols", out.len());
        self.core.set_output(0, Waveform::protocol(out));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_util::{digital_source, wire};
    use crate::pipeline::{FilterGraph, StreamDescriptor};

    const NS: i64 = FS_PER_NANOSECOND;

    /// Runs for a reset, then `words` (24 bits each), then a trailing reset.
    fn encode(words: &[u32], timing: RgbLedTiming) -> Vec<(i64, i64, bool)> {
        let mut runs = Vec::new();
        let mut t = 0;
        let mut push = |len: i64, high: bool, t: &mut i64| {
            runs.push((*t, len, high));
            *t += len;
        };
        push(60_000 * NS, false, &mut t);
        let (long, short) = (timing.long_ns * NS, timing.short_ns * NS);
        for &w in words {
            for bit in (0..24).rev() {
                if (w >> bit) & 1 == 1 {
                    push(long, true, &mut t);
                    push(short, false, &mut t);
                } else {
                    push(short, true, &mut t);
                    push(long, false, &mut t);
                }
            }
        }
        push(60_000 * NS, false, &mut t);
        runs
    }

    fn decode_graph(runs: &[(i64, i64, bool)], kind: i64) -> Vec<RgbLedSymbol> {
        let mut graph = FilterGraph::new();
        let src = digital_source(&mut graph, runs);
        let mut dec = RgbLedDecoder::new();
        dec.core_mut().parameters.set("Type", kind).unwrap();
        let dec = wire(&mut graph, Box::new(dec), &[src]);
        graph.refresh().unwrap();
        let w = graph.stream(StreamDescriptor::new(dec, 0)).unwrap().waveform().unwrap();
        w.as_protocol::<RgbLedSymbol>().unwrap().samples.to_vec()
    }

    #[test]
    fn test_ws2812_three_leds() {
        let syms = decode_graph(&encode(&[0xFF00AA; 3], RgbLedTiming::WS2812), 0);
        assert_eq!(
            syms,
            vec![
                RgbLedSymbol::Reset,
                RgbLedSymbol::Color(0xFF00AA),
                RgbLedSymbol::Color(0xFF00AA),
                RgbLedSymbol::Color(0xFF00AA),
                RgbLedSymbol::Reset,
            ]
        );
        assert_eq!(syms[1].text(), "#FF00AA");
        assert_eq!(syms[1].color(), Color::rgb(0xff, 0x00, 0xaa));
    }

    #[test]
    fn test_everlight_timing() {
        let syms = decode_graph(&encode(&[0x123456], RgbLedTiming::EVERLIGHT), 1);
        assert_eq!(syms[1], RgbLedSymbol::Color(0x123456));
        // Everlight tolerances reject WS2812 pulse widths
        let syms = decode_graph(&encode(&[0x123456], RgbLedTiming::WS2812), 1);
        assert!(matches!(syms[1], RgbLedSymbol::Color(d) if d & ERROR_FLAG != 0));
    }

    #[test]
    fn test_bad_pulse_sets_error_flag() {
        let mut runs = encode(&[0xFFFFFF], RgbLedTiming::WS2812);
        // Stretch the first high pulse to 1.5 us and shift everything after it
        let extra = 700 * NS;
        runs[1].1 += extra;
        for r in runs.iter_mut().skip(2) {
            r.0 += extra;
        }
        let syms = decode_graph(&runs, 0);
        assert_eq!(syms[1], RgbLedSymbol::Color(0x7FFFFF | ERROR_FLAG));
        assert_eq!(syms[1].color(), Color::ERROR);
    }

    #[test]
    fn test_partial_word_is_garbage() {
        let mut runs = encode(&[0xABCDEF], RgbLedTiming::WS2812);
        // Drop the last eight bits (16 runs) before the trailing reset
        let reset = runs.pop().unwrap();
        runs.truncate(runs.len() - 16);
        let t = runs.last().map(|r| r.0 + r.1).unwrap();
        runs.push((t, reset.1, false));
        let syms = decode_graph(&runs, 0);
        assert_eq!(syms, vec![RgbLedSymbol::Reset, RgbLedSymbol::Garbage, RgbLedSymbol::Reset]);
    }

    #[test]
    fn test_short_leading_low_counts_as_reset() {
        let mut runs = encode(&[0x000001], RgbLedTiming::WS2812);
        runs[0].1 = 6_000 * NS;
        let shift = 54_000 * NS;
        for r in runs.iter_mut().skip(1) {
            r.0 -= shift;
        }
        let syms = decode_graph(&runs, 0);
        assert_eq!(syms[1], RgbLedSymbol::Color(1));
    }

    #[test]
    fn test_no_reset_no_output() {
        let runs = vec![(0, 800 * NS, true), (800 * NS, 450 * NS, false), (1250 * NS, 800 * NS, true)];
        assert!(decode_graph(&runs, 0).is_empty());
    }
}
