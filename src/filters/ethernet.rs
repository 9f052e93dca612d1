//! 10GBASE-R PCS and Ethernet MAC frame decoding.
//!
//! Control blocks are classified by their block type byte. Start blocks open
//! a frame (the start control character is replaced by the 0x55 preamble
//! byte it stands for), data blocks contribute all eight lanes and terminate
//! blocks contribute the lanes before the terminate character. Each completed
//! frame is parsed as preamble, SFD, addresses, optional 802.1Q tag,
//! ethertype, payload and FCS.

use super::block66::Block66;
use crate::pipeline::{
    Filter, FilterCategory, FilterCore, Packet, PipelineError, PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::Color;
use crate::waveform::{ProtocolSymbol, SparseWaveform, Waveform, WaveformBase};

pub const BLOCK_IDLE: u8 = 0x1e;
pub const BLOCK_START_LANE0: u8 = 0x78;
pub const BLOCK_START_LANE4: u8 = 0x33;
pub const BLOCK_ORDERED_START: u8 = 0x66;
pub const BLOCK_ORDERED_SET: u8 = 0x4b;
pub const BLOCK_ORDERED_PAIR: u8 = 0x55;
pub const BLOCK_CONTROL_ORDERED: u8 = 0x2d;

/// Terminate block types indexed by the number of data bytes before /T/.
pub const BLOCK_TERMINATE: [u8; 8] = [0x87, 0x99, 0xaa, 0xb4, 0xcc, 0xd2, 0xe1, 0xff];

const PREAMBLE: u8 = 0x55;
const SFD: u8 = 0xd5;
const ETHERTYPE_VLAN: u16 = 0x8100;
const MAC_HEADER_LEN: usize = 14;
const FCS_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EthernetSymbol {
    Idle,
    LocalFault,
    RemoteFault,
    LinkInterruption,
    Preamble,
    Sfd,
    DstMac([u8; 6]),
    SrcMac([u8; 6]),
    /// 802.1Q tag control information.
    Vlan(u16),
    Ethertype(u16),
    Data(u8),
    Fcs {
        value: u32,
        ok: bool,
    },
    #[default]
    Error,
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn ethertype_name(t: u16) -> String {
    match t {
        0x0800 => "IPv4".into(),
        0x0806 => "ARP".into(),
        0x86dd => "IPv6".into(),
        0x88cc => "LLDP".into(),
        t if t <= 1500 => format!("Length {t}"),
        t => format!("0x{t:04x}"),
    }
}

impl crate::accel::Element for EthernetSymbol {}

impl ProtocolSymbol for EthernetSymbol {
    fn text(&self) -> String {
        match self {
            EthernetSymbol::Idle => "IDLE".into(),
            EthernetSymbol::LocalFault => "LOCAL FAULT".into(),
            EthernetSymbol::RemoteFault => "REMOTE FAULT".into(),
            EthernetSymbol::LinkInterruption => "LINK INTERRUPTION".into(),
            EthernetSymbol::Preamble => "PREAMBLE".into(),
            EthernetSymbol::Sfd => "SFD".into(),
            EthernetSymbol::DstMac(mac) => format!("To {}", format_mac(mac)),
            EthernetSymbol::SrcMac(mac) => format!("From {}", format_mac(mac)),
            EthernetSymbol::Vlan(tci) => format!("VLAN {}, PCP {}", tci & 0xfff, tci >> 13),
            EthernetSymbol::Ethertype(t) => format!("Type: {}", ethertype_name(*t)),
            EthernetSymbol::Data(b) => format!("{b:02x}"),
            EthernetSymbol::Fcs { ok: true, .. } => "CRC OK".into(),
            EthernetSymbol::Fcs { ok: false, value } => format!("CRC BAD {value:08x}"),
            EthernetSymbol::Error => "ERROR".into(),
        }
    }

    fn color(&self) -> Color {
        match self {
            EthernetSymbol::Idle => Color::IDLE,
            EthernetSymbol::LocalFault
            | EthernetSymbol::RemoteFault
            | EthernetSymbol::LinkInterruption
            | EthernetSymbol::Error => Color::ERROR,
            EthernetSymbol::Preamble | EthernetSymbol::Sfd => Color::PREAMBLE,
            EthernetSymbol::DstMac(_) | EthernetSymbol::SrcMac(_) => Color::ADDRESS,
            EthernetSymbol::Vlan(_) | EthernetSymbol::Ethertype(_) => Color::CONTROL,
            EthernetSymbol::Data(_) => Color::DATA,
            EthernetSymbol::Fcs { ok: true, .. } => Color::CHECKSUM_OK,
            EthernetSymbol::Fcs { ok: false, .. } => Color::CHECKSUM_BAD,
        }
    }
}

/// IEEE 802.3 CRC-32 (reflected, polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

/// Fault signalled by a sequence ordered set, from its lane 3 byte.
fn sequence_fault(lane3: u8) -> EthernetSymbol {
    match lane3 {
        0x01 => EthernetSymbol::LocalFault,
        0x02 => EthernetSymbol::RemoteFault,
        0x03 => EthernetSymbol::LinkInterruption,
        _ => EthernetSymbol::Error,
    }
}

/// A data byte with the lane time it occupied.
#[derive(Debug, Clone, Copy)]
struct LaneByte {
    value: u8,
    start: i64,
    end: i64,
}

struct PcsState {
    out: SparseWaveform<EthernetSymbol>,
    packets: Vec<Packet>,
    frame: Option<Vec<LaneByte>>,
}

impl PcsState {
    fn emit(&mut self, start: i64, end: i64, sym: EthernetSymbol) {
        self.out.push(start, end - start, sym);
    }

    /// Emit `sym`, merging it into the previous symbol when they touch.
    fn emit_coalesced(&mut self, start: i64, end: i64, sym: EthernetSymbol) {
        if let Some(last) = self.out.len().checked_sub(1) {
            let last_end = self.out.offset(last) + self.out.duration(last);
            if self.out.samples[last] == sym && last_end == start {
                self.out.extend_last(end);
                return;
            }
        }
        self.emit(start, end, sym);
    }

    fn abort_frame(&mut self, end: i64) {
        if let Some(bytes) = self.frame.take() {
            let start = bytes.first().map_or(end, |b| b.start);
            self.emit(start, end, EthernetSymbol::Error);
        }
    }

    fn block(&mut self, block: &Block66, start: i64, end: i64) {
        let lane = |k: usize| LaneByte {
            value: block.byte(k),
            start: start + (end - start) * k as i64 / 8,
            end: start + (end - start) * (k as i64 + 1) / 8,
        };

        if block.is_data() {
            match self.frame.as_mut() {
                Some(frame) => frame.extend((0..8).map(lane)),
                None => self.emit(start, end, EthernetSymbol::Error),
            }
            return;
        }
        if !block.is_control() {
            self.abort_frame(start);
            self.emit(start, end, EthernetSymbol::Error);
            return;
        }

        let kind = block.byte(0);
        if let Some(n) = BLOCK_TERMINATE.iter().position(|&t| t == kind) {
            let Some(mut frame) = self.frame.take() else {
                self.emit(start, end, EthernetSymbol::Error);
                return;
            };
            frame.extend((1..=n).map(lane));
            self.parse_frame(&frame);
            let idle_start = start + (end - start) * (n as i64 + 1) / 8;
            if idle_start < end {
                self.emit_coalesced(idle_start, end, EthernetSymbol::Idle);
            }
            return;
        }

        // Anything else ends an open frame
        self.abort_frame(start);
        let mid = lane(4).start;
        let open = |first: usize| -> Vec<LaneByte> {
            let mut bytes = vec![LaneByte {
                value: PREAMBLE,
                ..lane(first)
            }];
            bytes.extend((first + 1..8).map(lane));
            bytes
        };
        match kind {
            BLOCK_IDLE => self.emit_coalesced(start, end, EthernetSymbol::Idle),
            BLOCK_START_LANE0 => self.frame = Some(open(0)),
            BLOCK_START_LANE4 => {
                self.emit_coalesced(start, mid, EthernetSymbol::Idle);
                self.frame = Some(open(4));
            }
            BLOCK_ORDERED_START => {
                self.emit_coalesced(start, mid, sequence_fault(block.byte(3)));
                self.frame = Some(open(4));
            }
            BLOCK_ORDERED_SET => self.emit_coalesced(start, end, sequence_fault(block.byte(3))),
            BLOCK_ORDERED_PAIR => {
                self.emit_coalesced(start, mid, sequence_fault(block.byte(3)));
                self.emit_coalesced(mid, end, sequence_fault(block.byte(7)));
            }
            BLOCK_CONTROL_ORDERED => {
                self.emit_coalesced(start, mid, EthernetSymbol::Idle);
                self.emit_coalesced(mid, end, sequence_fault(block.byte(7)));
            }
            _ => self.emit(start, end, EthernetSymbol::Error),
        }
    }

    fn parse_frame(&mut self, bytes: &[LaneByte]) {
        let Some((first, last)) = bytes.first().zip(bytes.last()) else {
            return;
        };
        let preamble = bytes.iter().take_while(|b| b.value == PREAMBLE).count();
        if preamble == 0 || bytes.get(preamble).map(|b| b.value) != Some(SFD) {
            self.emit(first.start, last.end, EthernetSymbol::Error);
            return;
        }
        self.emit(first.start, bytes[preamble - 1].end, EthernetSymbol::Preamble);
        self.emit(bytes[preamble].start, bytes[preamble].end, EthernetSymbol::Sfd);

        let body = &bytes[preamble + 1..];
        if body.len() < MAC_HEADER_LEN + FCS_LEN {
            if let Some((b0, bn)) = body.first().zip(body.last()) {
                self.emit(b0.start, bn.end, EthernetSymbol::Error);
            }
            return;
        }
        let span = |r: std::ops::Range<usize>| (body[r.start].start, body[r.end - 1].end);
        let value = |r: std::ops::Range<usize>| body[r].iter().map(|b| b.value).collect::<Vec<u8>>();
        let mac = |r: std::ops::Range<usize>| {
            let mut m = [0u8; 6];
            m.copy_from_slice(&value(r));
            m
        };
        let word = |at: usize| u16::from_be_bytes([body[at].value, body[at + 1].value]);

        let dst = mac(0..6);
        let src = mac(6..12);
        let (s, e) = span(0..6);
        self.emit(s, e, EthernetSymbol::DstMac(dst));
        let (s, e) = span(6..12);
        self.emit(s, e, EthernetSymbol::SrcMac(src));

        let mut at = 12;
        let mut vlan = None;
        let mut ethertype = word(at);
        if ethertype == ETHERTYPE_VLAN && body.len() >= MAC_HEADER_LEN + 4 + FCS_LEN {
            let tci = word(at + 2);
            let (s, e) = span(at..at + 4);
            self.emit(s, e, EthernetSymbol::Vlan(tci));
            vlan = Some(tci);
            at += 4;
            ethertype = word(at);
        }
        let (s, e) = span(at..at + 2);
        self.emit(s, e, EthernetSymbol::Ethertype(ethertype));
        at += 2;

        let fcs_at = body.len() - FCS_LEN;
        for b in &body[at..fcs_at] {
            self.emit(b.start, b.end, EthernetSymbol::Data(b.value));
        }
        let received = u32::from_le_bytes([
            body[fcs_at].value,
            body[fcs_at + 1].value,
            body[fcs_at + 2].value,
            body[fcs_at + 3].value,
        ]);
        let ok = crc32(&value(0..fcs_at)) == received;
        let (s, e) = span(fcs_at..body.len());
        self.emit(s, e, EthernetSymbol::Fcs { value: received, ok });

        let mut pkt = Packet::new(first.start, last.end - first.start)
            .with_header("Dest", format_mac(&dst))
            .with_header("Source", format_mac(&src))
            .with_header("Ethertype", ethertype_name(ethertype))
            .with_header("Length", (fcs_at - at).to_string())
            .with_color(if ok { Color::DATA } else { Color::CHECKSUM_BAD });
        if let Some(tci) = vlan {
            pkt = pkt.with_header("VLAN", (tci & 0xfff).to_string());
        }
        pkt.data = value(at..fcs_at);
        self.packets.push(pkt);
    }
}

pub struct TenGBaseRDecoder {
    core: FilterCore,
}

impl TenGBaseRDecoder {
    pub const PROTOCOL: &'static str = "Ethernet - 10GBaseR";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Serial, Color::rgb(0x00, 0x80, 0xff));
        core.add_input("blocks");
        core.add_stream(Stream::protocol("data"));
        Self { core }
    }
}

impl Default for TenGBaseRDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for TenGBaseRDecoder {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0
            && stream.stream_type == StreamType::Protocol
            && stream.waveform().map_or(true, |w| w.as_protocol::<Block66>().is_some())
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let input = ctx.inputs.require_waveform(0)?;
        let blocks = input
            .as_protocol::<Block66>()
            .ok_or_else(|| PipelineError::invalid("blocks", "expected 64b/66b blocks"))?;

        let mut pcs = PcsState {
            out: SparseWaveform::new(1, 0),
            packets: Vec::new(),
            frame: None,
        };
        pcs.out.header.start_timestamp = input.header().start_timestamp;
        pcs.out.header.start_femtoseconds = input.header().start_femtoseconds;
        for i in 0..blocks.len() {
            let start = blocks.offset(i);
            pcs.block(&blocks.samples[i], start, start + blocks.duration(i));
        }
        // A frame still open at the end of the capture is dropped silently

        tracing::debug!("10GBASE-R: {} blocks, {} frames", blocks.len(), pcs.packets.len());
        for pkt in pcs.packets {
            self.core.push_packet(pkt);
        }
        self.core.set_output(0, Waveform::protocol(pcs.out));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::block66::{encode, Block66Decoder};
    use crate::filters::test_util::{digital_source, protocol_source, wire};
    use crate::pipeline::{FilterGraph, NodeId, StreamDescriptor};

    const BLOCK_FS: i64 = 6400;

    fn control(bytes: [u8; 8]) -> Block66 {
        Block66::control(u64::from_be_bytes(bytes))
    }

    fn idle() -> Block66 {
        control([BLOCK_IDLE, 0, 0, 0, 0, 0, 0, 0])
    }

    /// MAC frame bytes after the SFD, FCS appended.
    fn mac_frame(ethertype: u16, vlan: Option<u16>, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb];
        if let Some(tci) = vlan {
            f.extend(ETHERTYPE_VLAN.to_be_bytes());
            f.extend(tci.to_be_bytes());
        }
        f.extend(ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        let fcs = crc32(&f);
        f.extend(fcs.to_le_bytes());
        f
    }

    /// PCS blocks carrying `frame` with a lane 0 start.
    fn blocks_for(frame: &[u8]) -> Vec<Block66> {
        let mut blocks = vec![idle(), control([BLOCK_START_LANE0, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, SFD])];
        let mut chunks = frame.chunks_exact(8);
        for c in chunks.by_ref() {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            blocks.push(Block66::data(u64::from_be_bytes(b)));
        }
        let rest = chunks.remainder();
        let mut term = [0u8; 8];
        term[0] = BLOCK_TERMINATE[rest.len()];
        term[1..=rest.len()].copy_from_slice(rest);
        blocks.push(control(term));
        blocks.push(idle());
        blocks
    }

    fn timed(blocks: &[Block66]) -> SparseWaveform<Block66> {
        let mut w = SparseWaveform::new(1, 0);
        for (k, b) in blocks.iter().enumerate() {
            w.push(k as i64 * BLOCK_FS, BLOCK_FS, *b);
        }
        w
    }

    fn decode(blocks: &[Block66]) -> (FilterGraph, NodeId) {
        let mut graph = FilterGraph::new();
        let src = protocol_source(&mut graph, timed(blocks));
        let dec = wire(&mut graph, Box::new(TenGBaseRDecoder::new()), &[src]);
        graph.refresh().unwrap();
        assert!(graph.errors(dec).is_empty(), "{:?}", graph.errors(dec));
        (graph, dec)
    }

    fn symbols(graph: &FilterGraph, id: NodeId) -> Vec<EthernetSymbol> {
        let w = graph.stream(StreamDescriptor::new(id, 0)).unwrap().waveform().unwrap();
        w.as_protocol::<EthernetSymbol>().unwrap().samples.to_vec()
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn test_frame_fields() {
        let payload: Vec<u8> = (0..46).collect();
        let (graph, dec) = decode(&blocks_for(&mac_frame(0x0800, None, &payload)));
        let syms = symbols(&graph, dec);

        assert_eq!(syms[0], EthernetSymbol::Idle);
        assert_eq!(syms[1], EthernetSymbol::Preamble);
        assert_eq!(syms[2], EthernetSymbol::Sfd);
        assert_eq!(syms[3], EthernetSymbol::DstMac([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(syms[4], EthernetSymbol::SrcMac([0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]));
        assert_eq!(syms[5], EthernetSymbol::Ethertype(0x0800));
        assert_eq!(syms[6..52].iter().filter(|s| matches!(s, EthernetSymbol::Data(_))).count(), 46);
        assert!(matches!(syms[52], EthernetSymbol::Fcs { ok: true, .. }));
        assert_eq!(syms.last(), Some(&EthernetSymbol::Idle));

        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header("Dest"), Some("00:11:22:33:44:55"));
        assert_eq!(packets[0].header("Ethertype"), Some("IPv4"));
        assert_eq!(packets[0].header("Length"), Some("46"));
        assert_eq!(packets[0].data, payload);
    }

    #[test]
    fn test_vlan_tag() {
        let (graph, dec) = decode(&blocks_for(&mac_frame(0x86dd, Some(0x2005), &[0xab; 50])));
        let syms = symbols(&graph, dec);
        assert_eq!(syms[5], EthernetSymbol::Vlan(0x2005));
        assert_eq!(syms[6], EthernetSymbol::Ethertype(0x86dd));
        assert_eq!(syms[5].text(), "VLAN 5, PCP 1");
        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets[0].header("VLAN"), Some("5"));
    }

    #[test]
    fn test_corrupt_fcs() {
        let mut frame = mac_frame(0x0800, None, &[0u8; 46]);
        frame[20] ^= 0x01;
        let (graph, dec) = decode(&blocks_for(&frame));
        let syms = symbols(&graph, dec);
        assert!(syms.iter().any(|s| matches!(s, EthernetSymbol::Fcs { ok: false, .. })));
        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets[0].color, Color::CHECKSUM_BAD);
    }

    #[test]
    fn test_every_terminate_position() {
        for extra in 0..8 {
            let frame = mac_frame(0x0800, None, &vec![0x5a; 46 + extra]);
            let (graph, dec) = decode(&blocks_for(&frame));
            let packets = graph.node(dec).unwrap().core().packets();
            assert_eq!(packets.len(), 1, "payload {}", 46 + extra);
            assert_eq!(packets[0].data.len(), 46 + extra);
            assert!(symbols(&graph, dec)
                .iter()
                .any(|s| matches!(s, EthernetSymbol::Fcs { ok: true, .. })));
        }
    }

    #[test]
    fn test_lane4_start() {
        let frame = mac_frame(0x0806, None, &[1u8; 46]);
        // Preamble starts in lane 4: three more 0x55 plus SFD in the start block
        let mut blocks = vec![control([BLOCK_START_LANE4, 0, 0, 0, 0, 0x55, 0x55, 0x55])];
        let mut bytes = vec![0x55, 0x55, 0x55, SFD];
        bytes.extend_from_slice(&frame);
        let mut chunks = bytes.chunks_exact(8);
        for c in chunks.by_ref() {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            blocks.push(Block66::data(u64::from_be_bytes(b)));
        }
        let rest = chunks.remainder();
        let mut term = [0u8; 8];
        term[0] = BLOCK_TERMINATE[rest.len()];
        term[1..=rest.len()].copy_from_slice(rest);
        blocks.push(control(term));

        let (graph, dec) = decode(&blocks);
        let syms = symbols(&graph, dec);
        assert_eq!(syms[0], EthernetSymbol::Idle);
        assert_eq!(syms[1], EthernetSymbol::Preamble);
        assert_eq!(syms[5], EthernetSymbol::Ethertype(0x0806));
        assert!(syms.iter().any(|s| matches!(s, EthernetSymbol::Fcs { ok: true, .. })));
    }

    #[test]
    fn test_faults_coalesce() {
        let fault = control([BLOCK_ORDERED_SET, 0, 0, 0x01, 0, 0, 0, 0]);
        let remote = control([BLOCK_ORDERED_SET, 0, 0, 0x02, 0, 0, 0, 0]);
        let (graph, dec) = decode(&[fault, fault, fault, remote, remote, idle()]);
        let w = graph.stream(StreamDescriptor::new(dec, 0)).unwrap().waveform().unwrap();
        let w = w.as_protocol::<EthernetSymbol>().unwrap();
        assert_eq!(
            w.samples.to_vec(),
            vec![EthernetSymbol::LocalFault, EthernetSymbol::RemoteFault, EthernetSymbol::Idle]
        );
        assert_eq!(w.duration(0), 3 * BLOCK_FS);
        assert_eq!(w.offset(1), 3 * BLOCK_FS);
    }

    #[test]
    fn test_data_outside_frame_is_error() {
        let (graph, dec) = decode(&[idle(), Block66::data(0), idle()]);
        assert_eq!(
            symbols(&graph, dec),
            vec![EthernetSymbol::Idle, EthernetSymbol::Error, EthernetSymbol::Idle]
        );
    }

    #[test]
    fn test_serial_bits_to_frames() {
        let payload = [0x42u8; 46];
        let mut blocks = vec![idle(); 3];
        blocks.extend(blocks_for(&mac_frame(0x0800, None, &payload)));
        let bits = encode::line(&blocks, 11);

        let mut graph = FilterGraph::new();
        let src = digital_source(&mut graph, &encode::runs(&bits, 97));
        let pcs = wire(&mut graph, Box::new(Block66Decoder::new()), &[src]);
        let mac = wire(&mut graph, Box::new(TenGBaseRDecoder::new()), &[pcs]);
        graph.refresh().unwrap();
        assert!(graph.errors(mac).is_empty(), "{:?}", graph.errors(mac));
        let packets = graph.node(mac).unwrap().core().packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, payload.to_vec());
    }
}
