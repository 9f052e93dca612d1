//! Bang-bang PLL clock recovery.
//!
//! The loop predicts the next unit-interval boundary one period ahead of the
//! last. Every data transition that lands within half a period of a predicted
//! boundary nudges both the period and the boundary towards it by a fixed
//! fraction, in the direction of the phase error only.
//!
//! Outputs a double-data-rate clock whose edges sit at UI centres, plus the
//! data level sampled on each of those edges. While the optional gate input is
//! high the loop runs open, emitting edges at the free-running period; when
//! the gate drops it resyncs to the next transition.

use super::{level_at, transitions};
use crate::pipeline::{
    is_analog, is_digital, Filter, FilterCategory, FilterCore, FilterParameter, PipelineError, PipelineResult,
    RefreshContext, Stream,
};
use crate::types::{Color, Unit};
use crate::waveform::{get_duration_scaled, get_offset_scaled, SparseWaveform, Waveform, WaveformBase, FS_PER_SECOND};

/// Fraction of the period the period estimate moves per transition.
pub const PERIOD_GAIN: f64 = 5e-5;
/// Fraction of the period the boundary estimate moves per transition.
pub const PHASE_GAIN: f64 = 5e-3;

const IN_DATA: usize = 0;
const IN_GATE: usize = 1;

/// One recovered clock edge, in fs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEdge {
    pub time: i64,
    pub period: i64,
}

/// Run the PLL over `edges` (sorted transition times, fs) until `tend`.
///
/// `gated(t)` reports whether the gate is asserted at boundary `t`. Gated
/// boundaries free-run at the current period and ignore the data; the first
/// ungated boundary resyncs to the next transition.
pub fn recover_clock(
    edges: &[i64],
    tend: i64,
    nominal_period: f64,
    mut gated: impl FnMut(i64) -> bool,
) -> Vec<ClockEdge> {
    let mut out = Vec::new();
    let Some(&first) = edges.first() else {
        return out;
    };
    let mut period = nominal_period;
    let mut edgepos = first as f64;
    let mut nedge = 1;
    let mut was_gated = false;

    while (edgepos as i64) < tend {
        let center = period / 2.0;
        edgepos += period;

        if gated(edgepos as i64) {
            while nedge < edges.len() && (edges[nedge] as f64) < edgepos {
                nedge += 1;
            }
            was_gated = true;
            let time = (edgepos + center).round() as i64;
            if time < tend {
                out.push(ClockEdge {
                    time,
                    period: period.round() as i64,
                });
            }
            continue;
        }
        if was_gated {
            if nedge >= edges.len() {
                break;
            }
            edgepos = edges[nedge] as f64;
            nedge += 1;
            was_gated = false;
            continue;
        }
        if nedge + 1 >= edges.len() {
            break;
        }

        while nedge + 1 < edges.len() && (edges[nedge] as f64) + center < edgepos {
            let tnext = edges[nedge] as f64;
            let mut dphase = (edgepos - tnext) - period;
            if dphase > center {
                dphase -= period;
            } else if dphase < -center {
                dphase += period;
            }
            if dphase > 0.0 {
                period -= period * PERIOD_GAIN;
                edgepos -= period * PHASE_GAIN;
            } else {
                period += period * PERIOD_GAIN;
                edgepos += period * PHASE_GAIN;
            }
            nedge += 1;
        }

        out.push(ClockEdge {
            time: (edgepos + center).round() as i64,
            period: period.round() as i64,
        });
    }
    out
}

pub struct ClockRecoveryFilter {
    core: FilterCore,
}

impl ClockRecoveryFilter {
    pub const PROTOCOL: &'static str = "Clock Recovery (PLL)";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Clock, Color::rgb(0x00, 0xc0, 0xc0));
        core.add_input("IN");
        core.add_optional_input("Gate");
        core.add_stream(Stream::digital("clk"));
        core.add_stream(Stream::digital("sampled"));
        core.parameters
            .insert("Symbol rate", FilterParameter::float(1.25e9, Unit::Hertz));
        core.parameters.insert("Threshold", FilterParameter::float(0.0, Unit::Volts));
        Self { core }
    }
}

impl Default for ClockRecoveryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ClockRecoveryFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        match slot {
            IN_DATA => is_analog(stream) || is_digital(stream),
            IN_GATE => is_digital(stream),
            _ => false,
        }
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let rate = self.core.parameters.float("Symbol rate");
        if rate <= 0.0 {
            return Err(PipelineError::invalid("Symbol rate", format!("must be positive, got {rate}")));
        }
        let threshold = self.core.parameters.float("Threshold") as f32;
        let nominal = FS_PER_SECOND as f64 / rate;

        let data = ctx.inputs.require_waveform(IN_DATA)?;
        let edges: Vec<i64> = transitions(data, threshold).iter().map(|c| c.timestamp).collect();
        if edges.len() < 3 {
            return Err(PipelineError::WaveformTooShort(format!("{} transitions", edges.len())));
        }
        let last = data.len() - 1;
        let tend = get_offset_scaled(data, last) + get_duration_scaled(data, last);

        let gate = ctx.inputs.waveform(IN_GATE);
        let mut gate_cursor = 0;
        let clock = recover_clock(&edges, tend, nominal, |t| {
            gate.is_some_and(|g| level_at(g, &mut gate_cursor, t, 0.0) == Some(true))
        });
        if clock.is_empty() {
            return Err(PipelineError::WaveformTooShort("no clock edges recovered".into()));
        }

        let mut clk = SparseWaveform::<bool>::new(1, 0);
        let mut sampled = SparseWaveform::<bool>::new(1, 0);
        for w in [&mut clk, &mut sampled] {
            w.header.start_timestamp = data.header().start_timestamp;
            w.header.start_femtoseconds = data.header().start_femtoseconds;
        }
        let mut value = false;
        let mut cursor = 0;
        for edge in &clock {
            clk.push(edge.time, edge.period, value);
            value = !value;
            if let Some(bit) = level_at(data, &mut cursor, edge.time, threshold) {
                sampled.push(edge.time, edge.period, bit);
            }
        }

        tracing::debug!(
            "Clock recovery: {} transitions, {} clock edges, final period {} fs",
            edges.len(),
            clk.len(),
            clock.last().map_or(0, |e| e.period)
        );
        self.core.set_output(0, Waveform::SparseDigital(clk));
        self.core.set_output(1, Waveform::SparseDigital(sampled));
        Ok(())
    }
}
