//! MEM-AP memory transactions from decoded SWD frames.
//!
//! Tracks TAR and CSW writes to the access port and turns accesses to DRW
//! into memory reads and writes. AP reads are posted: the word returned by
//! one AP read belongs to the previous one, and the last is collected with a
//! DP RDBUFF read.

use super::swd::{SwdSymbol, ACK_FAULT, ACK_OK};
use crate::pipeline::{
    Filter, FilterCategory, FilterCore, Packet, PipelineError, PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::Color;
use crate::waveform::{ProtocolSymbol, SparseWaveform, Waveform, WaveformBase};

const AP_CSW: u8 = 0x0;
const AP_TAR: u8 = 0x4;
const AP_DRW: u8 = 0xC;
const DP_RDBUFF: u8 = 0xC;

const CSW_SIZE_MASK: u32 = 0x7;
const CSW_ADDRINC_SHIFT: u32 = 4;
const CSW_ADDRINC_MASK: u32 = 0x3;

/// Auto-increment wraps within a 1 KiB block.
const TAR_INC_WRAP: u32 = 0x3ff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemApSymbol {
    Read {
        addr: u32,
        data: u32,
    },
    Write {
        addr: u32,
        data: u32,
    },
    #[default]
    Error,
}

impl MemApSymbol {
    fn op(&self) -> &'static str {
        match self {
            MemApSymbol::Read { .. } => "Read",
            MemApSymbol::Write { .. } => "Write",
            MemApSymbol::Error => "Error",
        }
    }
}

impl crate::accel::Element for MemApSymbol {}

impl ProtocolSymbol for MemApSymbol {
    fn text(&self) -> String {
        match *self {
            MemApSymbol::Read { addr, data } => format!("Read {addr:08x}: {data:08x}"),
            MemApSymbol::Write { addr, data } => format!("Write {addr:08x}: {data:08x}"),
            MemApSymbol::Error => "ERROR".into(),
        }
    }

    fn color(&self) -> Color {
        match self {
            MemApSymbol::Read { .. } => Color::DATA,
            MemApSymbol::Write { .. } => Color::CONTROL,
            MemApSymbol::Error => Color::ERROR,
        }
    }
}

/// One request frame gathered from the symbol stream.
#[derive(Debug, Default, Clone, Copy)]
struct Frame {
    start: i64,
    end: i64,
    ap: bool,
    read: bool,
    addr: u8,
    request_ok: bool,
    ack: u8,
    data: Option<u32>,
    data_ok: bool,
}

/// Assemble frames from SWD symbols. Line resets are returned as `None`.
fn frames(w: &SparseWaveform<SwdSymbol>) -> Vec<Option<Frame>> {
    let mut out = Vec::new();
    let mut cur: Option<Frame> = None;
    for i in 0..w.len() {
        let (t, end) = (w.offset(i), w.offset(i) + w.duration(i));
        match w.samples[i] {
            SwdSymbol::LineReset => {
                cur = None;
                out.push(None);
            }
            SwdSymbol::Start => {
                cur = Some(Frame {
                    start: t,
                    end,
                    request_ok: true,
                    ..Frame::default()
                });
            }
            sym => {
                let Some(f) = cur.as_mut() else { continue };
                f.end = end;
                match sym {
                    SwdSymbol::ApNdp(ap) => f.ap = ap,
                    SwdSymbol::RnW(read) => f.read = read,
                    SwdSymbol::Addr(a) => f.addr = a,
                    SwdSymbol::Parity(ok) => f.request_ok &= ok,
                    SwdSymbol::Error => f.request_ok = false,
                    SwdSymbol::Ack(ack) => {
                        f.ack = ack;
                        if ack != ACK_OK {
                            out.push(cur.take());
                        }
                    }
                    SwdSymbol::Data(d) => f.data = Some(d),
                    SwdSymbol::DataParity(ok) => {
                        f.data_ok = ok;
                        out.push(cur.take());
                    }
                    _ => {}
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    /// A DRW read of this address.
    Memory(u32),
    /// A read of some other AP register.
    Register,
}

/// Access port register state across frames.
#[derive(Debug, Default)]
struct MemAp {
    tar: u32,
    csw: u32,
    pending: Option<Pending>,
}

impl MemAp {
    fn increment(&mut self) {
        if (self.csw >> CSW_ADDRINC_SHIFT) & CSW_ADDRINC_MASK == 0 {
            return;
        }
        let size = 1u32 << (self.csw & CSW_SIZE_MASK).min(2);
        self.tar = (self.tar & !TAR_INC_WRAP) | (self.tar.wrapping_add(size) & TAR_INC_WRAP);
    }

    /// The transaction completed by `frame`, if any.
    fn step(&mut self, frame: &Frame) -> Option<MemApSymbol> {
        if !frame.request_ok || (frame.ack == ACK_OK && !frame.data_ok) {
            self.pending = None;
            return Some(MemApSymbol::Error);
        }
        match frame.ack {
            ACK_OK => {}
            ACK_FAULT => {
                self.pending = None;
                return Some(MemApSymbol::Error);
            }
            // WAIT and no-response frames are retried by the host
            _ => return None,
        }
        let data = frame.data?;

        match (frame.ap, frame.read, frame.addr) {
            (true, false, AP_CSW) => {
                self.csw = data;
                self.pending = None;
                None
            }
            (true, false, AP_TAR) => {
                self.tar = data;
                self.pending = None;
                None
            }
            (true, false, AP_DRW) => {
                let addr = self.tar;
                self.increment();
                self.pending = None;
                Some(MemApSymbol::Write { addr, data })
            }
            (true, false, _) => {
                self.pending = None;
                None
            }
            (true, true, reg) => {
                let done = self.complete(data);
                self.pending = Some(if reg == AP_DRW {
                    let addr = self.tar;
                    self.increment();
                    Pending::Memory(addr)
                } else {
                    Pending::Register
                });
                done
            }
            (false, true, DP_RDBUFF) => {
                let done = self.complete(data);
                self.pending = None;
                done
            }
            (false, _, _) => None,
        }
    }

    fn complete(&mut self, data: u32) -> Option<MemApSymbol> {
        match self.pending.take() {
            Some(Pending::Memory(addr)) => Some(MemApSymbol::Read { addr, data }),
            _ => None,
        }
    }
}

pub struct SwdMemApDecoder {
    core: FilterCore,
}

impl SwdMemApDecoder {
    pub const PROTOCOL: &'static str = "SWD MEM-AP";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Memory, Color::rgb(0xff, 0xc0, 0x40));
        core.add_input("SWD");
        core.add_stream(Stream::protocol("data"));
        Self { core }
    }
}

impl Default for SwdMemApDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SwdMemApDecoder {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0
            && stream.stream_type == StreamType::Protocol
            && stream.waveform().map_or(true, |w| w.as_protocol::<SwdSymbol>().is_some())
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let input = ctx.inputs.require_waveform(0)?;
        let swd = input
            .as_protocol::<SwdSymbol>()
            .ok_or_else(|| PipelineError::invalid("SWD", "expected SWD symbols"))?;

        let mut out = SparseWaveform::<MemApSymbol>::new(1, 0);
        out.header.start_timestamp = input.header().start_timestamp;
        out.header.start_femtoseconds = input.header().start_femtoseconds;

        let mut ap = MemAp::default();
        for frame in frames(swd) {
            let Some(frame) = frame else {
                ap.pending = None;
                continue;
            };
            let Some(sym) = ap.step(&frame) else { continue };
            let mut pkt = Packet::new(frame.start, frame.end - frame.start)
                .with_header("Op", sym.op())
                .with_color(sym.color());
            if let MemApSymbol::Read { addr, data } | MemApSymbol::Write { addr, data } = sym {
                pkt = pkt
                    .with_header("Address", format!("0x{addr:08x}"))
                    .with_header("Data", format!("0x{data:08x}"));
                pkt.data.extend_from_slice(&data.to_le_bytes());
            }
            self.core.push_packet(pkt);
            out.push(frame.start, frame.end - frame.start, sym);
        }

        tracing::debug!("SWD MEM-AP: {} transactions", out.len());
        self.core.set_output(0, Waveform::protocol(out));
        Ok(())
    }
}
