//! 64b/66b block sync and descrambling.
//!
//! Input is a stream of sampled bits in wire order. The decoder finds the
//! bit offset at which two-bit sync headers are consistently `01` or `10`,
//! then descrambles each 64-bit payload with the self-synchronizing
//! x^58 + x^39 + 1 polynomial. The first block after lock is unreliable
//! until the descrambler has seen 58 bits.

use crate::pipeline::{
    is_digital, Filter, FilterCategory, FilterCore, PipelineError, PipelineResult, RefreshContext, Stream,
};
use crate::types::Color;
use crate::waveform::{
    digital_value, get_duration_scaled, get_offset_scaled, ProtocolSymbol, SparseWaveform, Waveform, WaveformBase,
};

pub const BLOCK_BITS: usize = 66;
pub const HEADER_DATA: u8 = 0b01;
pub const HEADER_CONTROL: u8 = 0b10;

/// Blocks examined per candidate offset when searching for lock.
const LOCK_WINDOW: usize = 64;

const SCRAMBLER_MASK: u64 = (1 << 58) - 1;

/// One 66-bit block after descrambling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Block66 {
    /// Sync header, first wire bit in bit 1.
    pub header: u8,
    /// Payload with lane 0 in the most significant byte.
    pub payload: u64,
}

impl Block66 {
    pub fn data(payload: u64) -> Self {
        Self {
            header: HEADER_DATA,
            payload,
        }
    }

    pub fn control(payload: u64) -> Self {
        Self {
            header: HEADER_CONTROL,
            payload,
        }
    }

    pub fn is_data(&self) -> bool {
        self.header == HEADER_DATA
    }

    pub fn is_control(&self) -> bool {
        self.header == HEADER_CONTROL
    }

    pub fn is_valid(&self) -> bool {
        self.is_data() || self.is_control()
    }

    /// Lane `k`, 0..8.
    pub fn byte(&self, k: usize) -> u8 {
        (self.payload >> (56 - 8 * k)) as u8
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.payload.to_be_bytes()
    }
}

impl crate::accel::Element for Block66 {}

impl ProtocolSymbol for Block66 {
    fn text(&self) -> String {
        match self.header {
            HEADER_DATA => format!("D {:016x}", self.payload),
            HEADER_CONTROL => format!("C {:016x}", self.payload),
            h => format!("SYNC ERR {h:02b}"),
        }
    }

    fn color(&self) -> Color {
        match self.header {
            HEADER_DATA => Color::DATA,
            HEADER_CONTROL => Color::CONTROL,
            _ => Color::ERROR,
        }
    }
}

/// Self-synchronizing x^58 + x^39 + 1 descrambler.
#[derive(Debug, Default, Clone)]
pub struct Descrambler {
    state: u64,
}

impl Descrambler {
    pub fn bit(&mut self, b: bool) -> bool {
        let out = b ^ ((self.state >> 38) & 1 == 1) ^ ((self.state >> 57) & 1 == 1);
        self.state = ((self.state << 1) | u64::from(b)) & SCRAMBLER_MASK;
        out
    }
}

/// Matching scrambler, used to synthesize line data.
#[derive(Debug, Default, Clone)]
pub struct Scrambler {
    state: u64,
}

impl Scrambler {
    pub fn bit(&mut self, b: bool) -> bool {
        let out = b ^ ((self.state >> 38) & 1 == 1) ^ ((self.state >> 57) & 1 == 1);
        self.state = ((self.state << 1) | u64::from(out)) & SCRAMBLER_MASK;
        out
    }

    /// Wire bits of `block`, header unscrambled, payload bytes LSB first.
    pub fn encode(&mut self, block: &Block66) -> Vec<bool> {
        let mut bits = Vec::with_capacity(BLOCK_BITS);
        bits.push(block.header & 0b10 != 0);
        bits.push(block.header & 0b01 != 0);
        for byte in block.bytes() {
            for k in 0..8 {
                bits.push(self.bit((byte >> k) & 1 == 1));
            }
        }
        bits
    }
}

fn header_at(bits: &[bool], i: usize) -> u8 {
    (u8::from(bits[i]) << 1) | u8::from(bits[i + 1])
}

/// Offset in `bits` of the first block boundary, or `None` without lock.
pub fn find_lock(bits: &[bool]) -> Option<usize> {
    let mut best: Option<(usize, usize, usize)> = None;
    for offset in 0..BLOCK_BITS {
        let blocks = ((bits.len().saturating_sub(offset)) / BLOCK_BITS).min(LOCK_WINDOW);
        if blocks < 2 {
            continue;
        }
        let valid = (0..blocks)
            .filter(|&b| matches!(header_at(bits, offset + b * BLOCK_BITS), HEADER_DATA | HEADER_CONTROL))
            .count();
        if best.map_or(true, |(_, v, _)| valid > v) {
            best = Some((offset, valid, blocks));
        }
    }
    // Allow a few corrupted headers inside the window
    best.filter(|&(_, valid, blocks)| valid * 10 >= blocks * 9)
        .map(|(offset, _, _)| offset)
}

/// Decode every whole block from `offset` onwards.
pub fn decode_blocks(bits: &[bool], offset: usize) -> Vec<Block66> {
    let mut descrambler = Descrambler::default();
    bits[offset.min(bits.len())..]
        .chunks_exact(BLOCK_BITS)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            for (k, &b) in chunk[2..].iter().enumerate() {
                bytes[k / 8] |= u8::from(descrambler.bit(b)) << (k % 8);
            }
            Block66 {
                header: header_at(chunk, 0),
                payload: u64::from_be_bytes(bytes),
            }
        })
        .collect()
}

pub struct Block66Decoder {
    core: FilterCore,
}

impl Block66Decoder {
    pub const PROTOCOL: &'static str = "64b/66b";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Serial, Color::rgb(0x40, 0xa0, 0xff));
        core.add_input("data");
        core.add_stream(Stream::protocol("data"));
        Self { core }
    }
}

impl Default for Block66Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Block66Decoder {
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
        let input = ctx.inputs.require_waveform(0)?;
        let len = input.len();
        let bits: Vec<bool> = (0..len).filter_map(|i| digital_value(input, i)).collect();
        if bits.len() < 2 * BLOCK_BITS {
            return Err(PipelineError::WaveformTooShort(format!("{} bits", bits.len())));
        }
        let offset = find_lock(&bits).ok_or_else(|| PipelineError::Degenerate("no 64b/66b block lock".into()))?;

        let blocks = decode_blocks(&bits, offset);
        let mut out = SparseWaveform::<Block66>::new(1, 0);
        out.header.start_timestamp = input.header().start_timestamp;
        out.header.start_femtoseconds = input.header().start_femtoseconds;
        for (n, block) in blocks.into_iter().enumerate() {
            let first = offset + n * BLOCK_BITS;
            let last = first + BLOCK_BITS - 1;
            let start = get_offset_scaled(input, first);
            let end = get_offset_scaled(input, last) + get_duration_scaled(input, last);
            out.push(start, end - start, block);
        }

        tracing::debug!("64b/66b: locked at bit {}, {} blocks", offset, out.len());
        self.core.set_output(0, Waveform::protocol(out));
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod encode {
    use super::{Block66, Scrambler};

    /// Line bits for `blocks` after `skew` bits of idle-low line.
    pub fn line(blocks: &[Block66], skew: usize) -> Vec<bool> {
        let mut scrambler = Scrambler::default();
        let mut bits = vec![false; skew];
        for block in blocks {
            bits.extend(scrambler.encode(block));
        }
        bits
    }

    /// `(offset, duration, value)` runs, one per bit, `ui` fs each.
    pub fn runs(bits: &[bool], ui: i64) -> Vec<(i64, i64, bool)> {
        bits.iter()
            .enumerate()
            .map(|(k, &b)| (k as i64 * ui, ui, b))
            .collect()
    }
}
