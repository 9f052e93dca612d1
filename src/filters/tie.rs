//! Time interval error of a data signal against a recovered clock.

use super::transitions;
use crate::pipeline::{
    is_analog, is_digital, Filter, FilterCategory, FilterCore, FilterParameter, PipelineError, PipelineResult,
    RefreshContext, Stream,
};
use crate::types::{Color, Unit};
use crate::waveform::{find_edges, SparseWaveform, WaveformBase};

const IN_DATA: usize = 0;
const IN_CLOCK: usize = 1;

/// TIE of each data transition in `data` against the UI boundaries implied
/// by `clock`, whose edges sit at UI centres.
///
/// A transition at `t` between clock edges `c0 <= t < c1` has an ideal time
/// of `(c0 + c1) / 2`. Transitions outside the clock span are skipped.
pub fn time_interval_error(data: &[i64], clock: &[i64]) -> Vec<(i64, f32)> {
    let mut out = Vec::with_capacity(data.len());
    let mut ci = 0;
    for &t in data {
        while ci + 1 < clock.len() && clock[ci + 1] <= t {
            ci += 1;
        }
        if ci + 1 >= clock.len() || clock[ci] > t {
            continue;
        }
        let ideal = (clock[ci] + clock[ci + 1]) / 2;
        out.push((t, (t - ideal) as f32));
    }
    out
}

pub struct TieFilter {
    core: FilterCore,
}

impl TieFilter {
    pub const PROTOCOL: &'static str = "Clock Jitter (TIE)";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Clock, Color::rgb(0xc0, 0x60, 0xff));
        core.add_input("IN");
        core.add_input("Golden");
        core.add_stream(Stream::analog("tie", Unit::Femtoseconds));
        core.parameters.insert("Threshold", FilterParameter::float(0.0, Unit::Volts));
        Self { core }
    }
}

impl Default for TieFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for TieFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        match slot {
            IN_DATA => is_analog(stream) || is_digital(stream),
            IN_CLOCK => is_digital(stream),
            _ => false,
        }
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let threshold = self.core.parameters.float("Threshold") as f32;
        let data = ctx.inputs.require_waveform(IN_DATA)?;
        let clock = ctx.inputs.require_waveform(IN_CLOCK)?;

        let data_edges: Vec<i64> = transitions(data, threshold).iter().map(|c| c.timestamp).collect();
        let clock_edges: Vec<i64> = find_edges(clock).iter().map(|c| c.timestamp).collect();
        if clock_edges.len() < 2 {
            return Err(PipelineError::WaveformTooShort("golden clock has fewer than 2 edges".into()));
        }

        let ties = time_interval_error(&data_edges, &clock_edges);
        let mut out = SparseWaveform::<f32>::new(1, 0);
        out.header.start_timestamp = data.header().start_timestamp;
        out.header.start_femtoseconds = data.header().start_femtoseconds;
        for (i, &(t, tie)) in ties.iter().enumerate() {
            let next = ties.get(i + 1).map_or(t + 1, |n| n.0);
            out.push(t, (next - t).max(1), tie);
        }
        tracing::debug!("TIE: {} of {} transitions measured", out.len(), data_edges.len());
        self.core.set_output(0, out.into());
        Ok(())
    }
}
