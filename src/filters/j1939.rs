//! J1939 transport protocol (J1939-21) reassembly.
//!
//! Multi-packet messages are announced on TP.CM, either broadcast (BAM) or
//! as a connection-mode request to send (RTS), then carried seven bytes at a
//! time in sequence-numbered TP.DT frames. One transfer may be open per
//! originating address.

use std::collections::HashMap;

use crate::pipeline::{
    Filter, FilterCategory, FilterCore, Packet, PipelineError, PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::Color;
use crate::waveform::{ProtocolSymbol, SparseWaveform, Waveform, WaveformBase};

pub const PGN_TP_CM: u32 = 60416;
pub const PGN_TP_DT: u32 = 60160;

pub const CM_RTS: u8 = 16;
pub const CM_CTS: u8 = 17;
pub const CM_EOM_ACK: u8 = 19;
pub const CM_BAM: u8 = 32;
pub const CM_ABORT: u8 = 255;

pub const GLOBAL_ADDRESS: u8 = 0xff;

const DT_PAYLOAD: usize = 7;
const MAX_TRANSFER: usize = 1785;

/// One J1939 protocol data unit from the CAN layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct J1939Pdu {
    pub pgn: u32,
    pub source: u8,
    pub dest: u8,
    pub data: [u8; 8],
    pub len: u8,
}

impl J1939Pdu {
    pub fn new(pgn: u32, source: u8, dest: u8, data: &[u8]) -> Self {
        let mut buf = [0xffu8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            pgn,
            source,
            dest,
            data: buf,
            len: len as u8,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(8)]
    }
}

impl crate::accel::Element for J1939Pdu {}

impl ProtocolSymbol for J1939Pdu {
    fn text(&self) -> String {
        format!("PGN {} {:02x}->{:02x}", self.pgn, self.source, self.dest)
    }

    fn color(&self) -> Color {
        Color::DATA
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum J1939TransportSymbol {
    /// TP.CM announcement of a transfer.
    Announce {
        broadcast: bool,
        pgn: u32,
        size: u16,
        packets: u8,
    },
    /// TP.CM clear to send.
    ClearToSend {
        packets: u8,
        next: u8,
    },
    EndOfMessage {
        pgn: u32,
        size: u16,
    },
    Abort {
        pgn: u32,
        reason: u8,
    },
    /// A TP.DT frame that did not finish its transfer.
    Data {
        seq: u8,
    },
    /// The TP.DT frame that completed a transfer.
    Complete {
        pgn: u32,
        size: u16,
    },
    #[default]
    Error,
}

impl crate::accel::Element for J1939TransportSymbol {}

impl ProtocolSymbol for J1939TransportSymbol {
    fn text(&self) -> String {
        match *self {
            J1939TransportSymbol::Announce {
                broadcast,
                pgn,
                size,
                packets,
            } => format!(
                "{} PGN {pgn}: {size} bytes in {packets}",
                if broadcast { "BAM" } else { "RTS" }
            ),
            J1939TransportSymbol::ClearToSend { packets, next } => format!("CTS {packets} from {next}"),
            J1939TransportSymbol::EndOfMessage { pgn, size } => format!("EOM ACK PGN {pgn}: {size} bytes"),
            J1939TransportSymbol::Abort { pgn, reason } => format!("ABORT PGN {pgn}: reason {reason}"),
            J1939TransportSymbol::Data { seq } => format!("DT {seq}"),
            J1939TransportSymbol::Complete { pgn, size } => format!("PGN {pgn}: {size} bytes"),
            J1939TransportSymbol::Error => "ERROR".into(),
        }
    }

    fn color(&self) -> Color {
        match self {
            J1939TransportSymbol::Announce { .. }
            | J1939TransportSymbol::ClearToSend { .. }
            | J1939TransportSymbol::EndOfMessage { .. } => Color::CONTROL,
            J1939TransportSymbol::Data { .. } => Color::DATA,
            J1939TransportSymbol::Complete { .. } => Color::CHECKSUM_OK,
            J1939TransportSymbol::Abort { .. } | J1939TransportSymbol::Error => Color::ERROR,
        }
    }
}

/// An open transfer from one originator.
#[derive(Debug)]
struct Transfer {
    start: i64,
    dest: u8,
    pgn: u32,
    size: usize,
    next_seq: u8,
    data: Vec<u8>,
}

fn cm_size(d: &[u8]) -> u16 {
    u16::from_le_bytes([d[1], d[2]])
}

fn cm_pgn(d: &[u8]) -> u32 {
    u32::from_le_bytes([d[5], d[6], d[7], 0])
}

/// Reassembly state across PDUs.
#[derive(Debug, Default)]
struct Reassembler {
    open: HashMap<u8, Transfer>,
}

impl Reassembler {
    /// Symbol for one PDU plus a packet when it completed a transfer.
    fn pdu(&mut self, pdu: &J1939Pdu, start: i64, end: i64) -> Option<(J1939TransportSymbol, Option<Packet>)> {
        match pdu.pgn {
            PGN_TP_CM => Some((self.control(pdu, start), None)),
            PGN_TP_DT => Some(self.data(pdu, end)),
            _ => None,
        }
    }

    fn control(&mut self, pdu: &J1939Pdu, start: i64) -> J1939TransportSymbol {
        let d = &pdu.data;
        if pdu.len < 8 {
            return J1939TransportSymbol::Error;
        }
        match d[0] {
            CM_BAM | CM_RTS => {
                let size = cm_size(d);
                if !(9..=MAX_TRANSFER).contains(&usize::from(size)) {
                    return J1939TransportSymbol::Error;
                }
                let broadcast = d[0] == CM_BAM;
                if self.open.contains_key(&pdu.source) {
                    tracing::debug!("J1939: source {:#04x} restarted an open transfer", pdu.source);
                }
                self.open.insert(
                    pdu.source,
                    Transfer {
                        start,
                        dest: if broadcast { GLOBAL_ADDRESS } else { pdu.dest },
                        pgn: cm_pgn(d),
                        size: usize::from(size),
                        next_seq: 1,
                        data: Vec::with_capacity(usize::from(size)),
                    },
                );
                J1939TransportSymbol::Announce {
                    broadcast,
                    pgn: cm_pgn(d),
                    size,
                    packets: d[3],
                }
            }
            CM_CTS => J1939TransportSymbol::ClearToSend {
                packets: d[1],
                next: d[2],
            },
            CM_EOM_ACK => J1939TransportSymbol::EndOfMessage {
                pgn: cm_pgn(d),
                size: cm_size(d),
            },
            CM_ABORT => {
                // Either end may abort a connection
                self.open.remove(&pdu.source);
                if self.open.get(&pdu.dest).is_some_and(|t| t.dest == pdu.source) {
                    self.open.remove(&pdu.dest);
                }
                J1939TransportSymbol::Abort {
                    pgn: cm_pgn(d),
                    reason: d[1],
                }
            }
            _ => J1939TransportSymbol::Error,
        }
    }

    fn data(&mut self, pdu: &J1939Pdu, end: i64) -> (J1939TransportSymbol, Option<Packet>) {
        let seq = pdu.data[0];
        let Some(transfer) = self.open.get_mut(&pdu.source) else {
            return (J1939TransportSymbol::Error, None);
        };
        if seq != transfer.next_seq || pdu.dest != transfer.dest {
            tracing::debug!(
                "J1939: source {:#04x} sent DT {} out of sequence (expected {})",
                pdu.source,
                seq,
                transfer.next_seq
            );
            self.open.remove(&pdu.source);
            return (J1939TransportSymbol::Error, None);
        }
        transfer.next_seq = transfer.next_seq.wrapping_add(1);
        let take = (transfer.size - transfer.data.len()).min(DT_PAYLOAD);
        transfer.data.extend(pdu.payload().iter().skip(1).take(take));
        if transfer.data.len() < transfer.size {
            return (J1939TransportSymbol::Data { seq }, None);
        }

        let Some(done) = self.open.remove(&pdu.source) else {
            return (J1939TransportSymbol::Error, None);
        };
        let mut pkt = Packet::new(done.start, end - done.start)
            .with_header("PGN", done.pgn.to_string())
            .with_header("Source", format!("0x{:02x}", pdu.source))
            .with_header("Dest", format!("0x{:02x}", done.dest))
            .with_header("Length", done.size.to_string())
            .with_color(Color::DATA);
        pkt.data = done.data;
        let sym = J1939TransportSymbol::Complete {
            pgn: done.pgn,
            size: done.size as u16,
        };
        (sym, Some(pkt))
    }
}

pub struct J1939TransportDecoder {
    core: FilterCore,
}

impl J1939TransportDecoder {
    pub const PROTOCOL: &'static str = "J1939 Transport";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Bus, Color::rgb(0xff, 0x80, 0x40));
        core.add_input("j1939");
        core.add_stream(Stream::protocol("data"));
        Self { core }
    }
}

impl Default for J1939TransportDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for J1939TransportDecoder {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0
            && stream.stream_type == StreamType::Protocol
            && stream.waveform().map_or(true, |w| w.as_protocol::<J1939Pdu>().is_some())
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let input = ctx.inputs.require_waveform(0)?;
        let pdus = input
            .as_protocol::<J1939Pdu>()
            .ok_or_else(|| PipelineError::invalid("j1939", "expected J1939 PDUs"))?;

        let mut out = SparseWaveform::<J1939TransportSymbol>::new(1, 0);
        out.header.start_timestamp = input.header().start_timestamp;
        out.header.start_femtoseconds = input.header().start_femtoseconds;

        let mut state = Reassembler::default();
        for i in 0..pdus.len() {
            let (start, dur) = (pdus.offset(i), pdus.duration(i));
            let Some((sym, pkt)) = state.pdu(&pdus.samples[i], start, start + dur) else {
                continue;
            };
            out.push(start, dur, sym);
            if let Some(pkt) = pkt {
                self.core.push_packet(pkt);
            }
        }
        if !state.open.is_empty() {
            tracing::debug!("J1939: {} transfers still open at end of capture", state.open.len());
        }
        self.core.set_output(0, Waveform::protocol(out));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_util::{protocol_source, wire};
    use crate::pipeline::{FilterGraph, NodeId, StreamDescriptor};

    const PGN_DM1: u32 = 0xfeca;

    fn cm(ctrl: u8, source: u8, dest: u8, size: u16, packets: u8, pgn: u32) -> J1939Pdu {
        let s = size.to_le_bytes();
        let p = pgn.to_le_bytes();
        J1939Pdu::new(PGN_TP_CM, source, dest, &[ctrl, s[0], s[1], packets, 0xff, p[0], p[1], p[2]])
    }

    fn dts(source: u8, dest: u8, payload: &[u8]) -> Vec<J1939Pdu> {
        payload
            .chunks(DT_PAYLOAD)
            .enumerate()
            .map(|(k, chunk)| {
                let mut d = vec![k as u8 + 1];
                d.extend_from_slice(chunk);
                d.resize(8, 0xff);
                J1939Pdu::new(PGN_TP_DT, source, dest, &d)
            })
            .collect()
    }

    fn run(pdus: &[J1939Pdu]) -> (FilterGraph, NodeId) {
        let mut w = SparseWaveform::new(1, 0);
        for (k, pdu) in pdus.iter().enumerate() {
            w.push(k as i64 * 1000, 900, *pdu);
        }
        let mut graph = FilterGraph::new();
        let src = protocol_source(&mut graph, w);
        let dec = wire(&mut graph, Box::new(J1939TransportDecoder::new()), &[src]);
        graph.refresh().unwrap();
        assert!(graph.errors(dec).is_empty(), "{:?}", graph.errors(dec));
        (graph, dec)
    }

    fn symbols(graph: &FilterGraph, id: NodeId) -> Vec<J1939TransportSymbol> {
        let w = graph.stream(StreamDescriptor::new(id, 0)).unwrap().waveform().unwrap();
        w.as_protocol::<J1939TransportSymbol>().unwrap().samples.to_vec()
    }

    #[test]
    fn test_bam_reassembly() {
        let payload: Vec<u8> = (0..20).collect();
        let mut pdus = vec![cm(CM_BAM, 0x21, GLOBAL_ADDRESS, 20, 3, PGN_DM1)];
        pdus.extend(dts(0x21, GLOBAL_ADDRESS, &payload));
        let (graph, dec) = run(&pdus);

        assert_eq!(
            symbols(&graph, dec),
            vec![
                J1939TransportSymbol::Announce {
                    broadcast: true,
                    pgn: PGN_DM1,
                    size: 20,
                    packets: 3
                },
                J1939TransportSymbol::Data { seq: 1 },
                J1939TransportSymbol::Data { seq: 2 },
                J1939TransportSymbol::Complete { pgn: PGN_DM1, size: 20 },
            ]
        );
        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, payload);
        assert_eq!(packets[0].header("PGN"), Some("65226"));
        assert_eq!(packets[0].header("Source"), Some("0x21"));
        assert_eq!(packets[0].offset, 0);
        assert_eq!(packets[0].end(), 3900);
    }

    #[test]
    fn test_interleaved_sources() {
        let a: Vec<u8> = vec![0xaa; 10];
        let b: Vec<u8> = vec![0xbb; 15];
        let da = dts(0x01, GLOBAL_ADDRESS, &a);
        let db = dts(0x02, GLOBAL_ADDRESS, &b);
        let pdus = vec![
            cm(CM_BAM, 0x01, GLOBAL_ADDRESS, 10, 2, 0xfee3),
            cm(CM_BAM, 0x02, GLOBAL_ADDRESS, 15, 3, 0xfee4),
            da[0],
            db[0],
            db[1],
            da[1],
            db[2],
        ];
        let (graph, dec) = run(&pdus);
        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data, a);
        assert_eq!(packets[1].data, b);
    }

    #[test]
    fn test_rts_connection() {
        let payload: Vec<u8> = (0..9).collect();
        let mut pdus = vec![
            cm(CM_RTS, 0x10, 0x20, 9, 2, 0xef00),
            J1939Pdu::new(PGN_TP_CM, 0x20, 0x10, &[CM_CTS, 2, 1, 0xff, 0xff, 0x00, 0xef, 0x00]),
        ];
        pdus.extend(dts(0x10, 0x20, &payload));
        pdus.push(cm(CM_EOM_ACK, 0x20, 0x10, 9, 2, 0xef00));
        let (graph, dec) = run(&pdus);
        let syms = symbols(&graph, dec);
        assert_eq!(syms[1], J1939TransportSymbol::ClearToSend { packets: 2, next: 1 });
        assert_eq!(syms[3], J1939TransportSymbol::Complete { pgn: 0xef00, size: 9 });
        assert!(matches!(syms[4], J1939TransportSymbol::EndOfMessage { size: 9, .. }));
        let packets = graph.node(dec).unwrap().core().packets();
        assert_eq!(packets[0].header("Dest"), Some("0x20"));
        assert_eq!(packets[0].data, payload);
    }

    #[test]
    fn test_sequence_gap_drops_transfer() {
        let d = dts(0x21, GLOBAL_ADDRESS, &[0u8; 20]);
        let pdus = vec![cm(CM_BAM, 0x21, GLOBAL_ADDRESS, 20, 3, PGN_DM1), d[0], d[2]];
        let (graph, dec) = run(&pdus);
        assert_eq!(symbols(&graph, dec).last(), Some(&J1939TransportSymbol::Error));
        assert!(graph.node(dec).unwrap().core().packets().is_empty());
    }

    #[test]
    fn test_abort_from_receiver() {
        let d = dts(0x10, 0x20, &[0u8; 14]);
        let pdus = vec![
            cm(CM_RTS, 0x10, 0x20, 14, 2, 0xef00),
            J1939Pdu::new(PGN_TP_CM, 0x20, 0x10, &[CM_ABORT, 1, 0xff, 0xff, 0xff, 0x00, 0xef, 0x00]),
            d[0],
        ];
        let (graph, dec) = run(&pdus);
        let syms = symbols(&graph, dec);
        assert_eq!(syms[1], J1939TransportSymbol::Abort { pgn: 0xef00, reason: 1 });
        assert_eq!(syms[2], J1939TransportSymbol::Error);
    }

    #[test]
    fn test_other_pgns_ignored() {
        let pdus = vec![J1939Pdu::new(0xf004, 0x00, GLOBAL_ADDRESS, &[0; 8])];
        let (graph, dec) = run(&pdus);
        assert!(symbols(&graph, dec).is_empty());
    }
}
