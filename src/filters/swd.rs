//! ARM Serial Wire Debug frame decoder.
//!
//! SWDIO is sampled on every rising edge of SWCLK. A run of 50 or more ones
//! is a line reset; otherwise a one while idle is the start bit of a request
//! (`APnDP`, `RnW`, `A[2:3]`, parity, stop, park), followed by turnaround and
//! a three-bit acknowledge. An OK acknowledge carries 32 data bits and a
//! parity bit, LSB first, with the turnaround after the data for reads and
//! before it for writes.

use super::level_at;
use crate::pipeline::{
    is_digital, Filter, FilterCategory, FilterCore, PipelineError, PipelineResult, RefreshContext, Stream,
};
use crate::types::Color;
use crate::waveform::{find_edges, ProtocolSymbol, SparseWaveform, Waveform, WaveformBase};

const IN_CLK: usize = 0;
const IN_DIO: usize = 1;

const LINE_RESET_BITS: usize = 50;

pub const ACK_OK: u8 = 0b001;
pub const ACK_WAIT: u8 = 0b010;
pub const ACK_FAULT: u8 = 0b100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwdSymbol {
    #[default]
    Error,
    LineReset,
    Start,
    /// True for an access port request.
    ApNdp(bool),
    /// True for a read.
    RnW(bool),
    /// Register address, `A[3:2] << 2`.
    Addr(u8),
    /// True when the request parity matched.
    Parity(bool),
    Stop,
    Park,
    Turnaround,
    Ack(u8),
    Data(u32),
    /// True when the data parity matched.
    DataParity(bool),
}

impl crate::accel::Element for SwdSymbol {}

impl ProtocolSymbol for SwdSymbol {
    fn text(&self) -> String {
        match *self {
            SwdSymbol::Error => "ERROR".into(),
            SwdSymbol::LineReset => "LINE RESET".into(),
            SwdSymbol::Start => "START".into(),
            SwdSymbol::ApNdp(ap) => if ap { "AP" } else { "DP" }.into(),
            SwdSymbol::RnW(read) => if read { "R" } else { "W" }.into(),
            SwdSymbol::Addr(a) => format!("Reg {a:#x}"),
            SwdSymbol::Parity(ok) | SwdSymbol::DataParity(ok) => if ok { "PARITY OK" } else { "PARITY BAD" }.into(),
            SwdSymbol::Stop => "STOP".into(),
            SwdSymbol::Park => "PARK".into(),
            SwdSymbol::Turnaround => "TRN".into(),
            SwdSymbol::Ack(ACK_OK) => "OK".into(),
            SwdSymbol::Ack(ACK_WAIT) => "WAIT".into(),
            SwdSymbol::Ack(ACK_FAULT) => "FAULT".into(),
            SwdSymbol::Ack(a) => format!("ACK {a:#05b}"),
            SwdSymbol::Data(d) => format!("{d:08x}"),
        }
    }

    fn color(&self) -> Color {
        match *self {
            SwdSymbol::Error | SwdSymbol::Parity(false) | SwdSymbol::DataParity(false) => Color::ERROR,
            SwdSymbol::Parity(true) | SwdSymbol::DataParity(true) => Color::CHECKSUM_OK,
            SwdSymbol::LineReset | SwdSymbol::Start | SwdSymbol::Stop | SwdSymbol::Park => Color::PREAMBLE,
            SwdSymbol::Turnaround => Color::IDLE,
            SwdSymbol::ApNdp(_) | SwdSymbol::RnW(_) | SwdSymbol::Ack(_) => Color::CONTROL,
            SwdSymbol::Addr(_) => Color::ADDRESS,
            SwdSymbol::Data(_) => Color::DATA,
        }
    }
}

/// One sampled bit: start time, length and level.
#[derive(Debug, Clone, Copy)]
struct Bit {
    start: i64,
    len: i64,
    value: bool,
}

struct BitReader<'a> {
    bits: &'a [Bit],
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// `n` bits LSB first, with their start and end times.
    fn take(&mut self, n: usize) -> Option<(i64, i64, u32)> {
        let chunk = self.bits.get(self.pos..self.pos + n)?;
        self.pos += n;
        let value = chunk
            .iter()
            .enumerate()
            .fold(0u32, |v, (k, b)| v | (u32::from(b.value) << k));
        let last = chunk.last()?;
        Some((chunk[0].start, last.start + last.len, value))
    }

    fn peek(&self) -> Option<&Bit> {
        self.bits.get(self.pos)
    }

    /// Length of the run of ones starting at the cursor.
    fn ones_ahead(&self) -> usize {
        self.bits[self.pos..].iter().take_while(|b| b.value).count()
    }
}

/// Decode a stream of sampled SWDIO bits.
fn decode_bits(bits: &[Bit]) -> SparseWaveform<SwdSymbol> {
    let mut out = SparseWaveform::new(1, 0);
    let mut r = BitReader { bits, pos: 0 };
    let mut emit = |field: Option<(i64, i64, u32)>, make: &dyn Fn(u32) -> SwdSymbol| -> Option<u32> {
        let (start, end, v) = field?;
        out.push(start, end - start, make(v));
        Some(v)
    };

    while let Some(bit) = r.peek() {
        if !bit.value {
            r.pos += 1;
            continue;
        }
        let ones = r.ones_ahead();
        if ones >= LINE_RESET_BITS {
            emit(r.take(ones), &|_| SwdSymbol::LineReset);
            continue;
        }
        if frame(&mut r, &mut emit).is_none() {
            break;
        }
    }
    out
}

/// One request frame. `None` when the capture ends mid-frame.
fn frame(
    r: &mut BitReader<'_>,
    emit: &mut impl FnMut(Option<(i64, i64, u32)>, &dyn Fn(u32) -> SwdSymbol) -> Option<u32>,
) -> Option<()> {
    emit(r.take(1), &|_| SwdSymbol::Start)?;
    let ap = emit(r.take(1), &|v| SwdSymbol::ApNdp(v == 1))?;
    let read = emit(r.take(1), &|v| SwdSymbol::RnW(v == 1))?;
    let addr = emit(r.take(2), &|v| SwdSymbol::Addr((v << 2) as u8))?;
    let expected = (ap + read + addr.count_ones()) & 1;
    emit(r.take(1), &|v| SwdSymbol::Parity(v == expected))?;
    let stop = emit(r.take(1), &|v| if v == 0 { SwdSymbol::Stop } else { SwdSymbol::Error })?;
    let park = emit(r.take(1), &|v| if v == 1 { SwdSymbol::Park } else { SwdSymbol::Error })?;
    if stop != 0 || park != 1 {
        return Some(());
    }
    emit(r.take(1), &|_| SwdSymbol::Turnaround)?;
    let ack = emit(r.take(3), &|v| SwdSymbol::Ack(v as u8))?;
    if ack as u8 != ACK_OK {
        // The host turns the bus round again after a WAIT or FAULT
        emit(r.take(1), &|_| SwdSymbol::Turnaround)?;
        return Some(());
    }
    if read == 0 {
        emit(r.take(1), &|_| SwdSymbol::Turnaround)?;
    }
    let data = emit(r.take(32), &|v| SwdSymbol::Data(v))?;
    let parity = data.count_ones() & 1;
    emit(r.take(1), &|v| SwdSymbol::DataParity(v == parity))?;
    if read == 1 {
        emit(r.take(1), &|_| SwdSymbol::Turnaround)?;
    }
    Some(())
}

pub struct SwdDecoder {
    core: FilterCore,
}

impl SwdDecoder {
    pub const PROTOCOL: &'static str = "SWD";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Bus, Color::rgb(0x80, 0xff, 0x80));
        core.add_input("SWCLK");
        core.add_input("SWDIO");
        core.add_stream(Stream::protocol("data"));
        Self { core }
    }
}

impl Default for SwdDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SwdDecoder {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot <= IN_DIO && is_digital(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let clk = ctx.inputs.require_waveform(IN_CLK)?;
        let dio = ctx.inputs.require_waveform(IN_DIO)?;
        let rising: Vec<i64> = find_edges(clk).iter().filter(|e| e.rising).map(|e| e.timestamp).collect();
        if rising.len() < 2 {
            return Err(PipelineError::WaveformTooShort("SWCLK has fewer than 2 rising edges".into()));
        }

        let mut cursor = 0;
        let bits: Vec<Bit> = rising
            .windows(2)
            .map_while(|w| {
                level_at(dio, &mut cursor, w[0], 0.0).map(|value| Bit {
                    start: w[0],
                    len: w[1] - w[0],
                    value,
                })
            })
            .collect();

        let mut out = decode_bits(&bits);
        out.header.start_timestamp = clk.header().start_timestamp;
        out.header.start_femtoseconds = clk.header().start_femtoseconds;
        tracing::debug!("SWD: {} bits, {} symbols", bits.len(), out.len());
        self.core.set_output(0, Waveform::protocol(out));
        Ok(())
    }
}

/// Bit-level encoders shared by the SWD tests.
#[cfg(test)]
pub(crate) mod encode {
    /// Bits of one OK-acknowledged frame as driven on SWDIO, including both
    /// turnarounds (driven low) and two idle cycles.
    pub fn frame(ap: bool, read: bool, addr: u8, data: u32) -> Vec<bool> {
        let a2 = (addr >> 2) & 1 == 1;
        let a3 = (addr >> 3) & 1 == 1;
        let parity = [ap, read, a2, a3].iter().filter(|&&b| b).count() % 2 == 1;
        let mut bits = vec![true, ap, read, a2, a3, parity, false, true, false, true, false, false];
        let data_bits = (0..32).map(|k| (data >> k) & 1 == 1);
        let data_parity = data.count_ones() % 2 == 1;
        if !read {
            bits.push(false);
        }
        bits.extend(data_bits);
        bits.push(data_parity);
        if read {
            bits.push(false);
        }
        bits.extend([false, false]);
        bits
    }

    pub fn line_reset() -> Vec<bool> {
        let mut bits = vec![true; 56];
        bits.extend([false, false]);
        bits
    }

    /// SWCLK and SWDIO runs for `bits`, 1000 fs per bit, rising edge mid-bit.
    pub fn waveforms(bits: &[bool]) -> (Vec<(i64, i64, bool)>, Vec<(i64, i64, bool)>) {
        let mut clk = Vec::new();
        let mut dio = Vec::new();
        for (k, &b) in bits.iter().enumerate() {
            let t = k as i64 * 1000;
            clk.push((t, 500, false));
            clk.push((t + 500, 500, true));
            dio.push((t, 1000, b));
        }
        // One more rising edge so the last bit has a length
        let end = bits.len() as i64 * 1000;
        clk.push((end, 500, false));
        clk.push((end + 500, 500, true));
        dio.push((end, 1000, false));
        (clk, dio)
    }
}
