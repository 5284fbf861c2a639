//! H.264 RTP depacketization (RFC 6184).
//!
//! Reassembles single-NAL, STAP-A and FU-A packets into access units.
//! An access unit is emitted when the marker bit is set or the RTP
//! timestamp changes; both triggers are equally authoritative. The owner
//! may additionally call [`H264Depacketizer::flush`] to force emission
//! (stalled-marker watchdog).
//!
//! Bad input never fails the stream: malformed packets and unsupported
//! packetization types are counted and dropped.

use bytes::{Bytes, BytesMut};

use crate::RtpPacket;

/// NAL unit type for an IDR slice.
const NAL_TYPE_IDR: u8 = 5;
/// Single-time aggregation packet.
const NAL_TYPE_STAP_A: u8 = 24;
/// Fragmentation unit.
const NAL_TYPE_FU_A: u8 = 28;

/// One complete coded frame: an ordered NAL sequence sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    pub nalus: Vec<Bytes>,
    pub rtp_timestamp: u32,
    pub is_keyframe: bool,
}

impl AccessUnit {
    /// Serialize as an Annex B byte stream (4-byte start codes), the form
    /// the WebRTC H.264 payloader consumes.
    pub fn annex_b(&self) -> Bytes {
        let total: usize = self.nalus.iter().map(|n| 4 + n.len()).sum();
        let mut out = BytesMut::with_capacity(total);
        for nalu in &self.nalus {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nalu);
        }
        out.freeze()
    }
}

/// Destination for reassembled access units, fixed at construction so the
/// data path cannot be rewired while packets are in flight.
pub trait AccessUnitSink {
    fn on_access_unit(&mut self, au: AccessUnit);
}

impl<F: FnMut(AccessUnit)> AccessUnitSink for F {
    fn on_access_unit(&mut self, au: AccessUnit) {
        self(au)
    }
}

struct Fragment {
    buf: BytesMut,
}

pub struct H264Depacketizer<S> {
    sink: S,
    /// Completed NAL units of the in-progress access unit.
    pending: Vec<Bytes>,
    pending_timestamp: Option<u32>,
    fragment: Option<Fragment>,
    last_seq: Option<u16>,
    /// SPS/PPS from the SDP, prepended to the first emitted access unit.
    param_sets: Option<(Bytes, Bytes)>,
    emitted_any: bool,
    losses: u64,
    dropped: u64,
}

impl<S: AccessUnitSink> H264Depacketizer<S> {
    pub fn new(param_sets: Option<(Vec<u8>, Vec<u8>)>, sink: S) -> Self {
        Self {
            sink,
            pending: Vec::new(),
            pending_timestamp: None,
            fragment: None,
            last_seq: None,
            param_sets: param_sets.map(|(sps, pps)| (Bytes::from(sps), Bytes::from(pps))),
            emitted_any: false,
            losses: 0,
            dropped: 0,
        }
    }

    /// Sequence gaps observed (each flushes any in-progress fragment).
    pub fn loss_count(&self) -> u64 {
        self.losses
    }

    /// Packets or aggregation entries discarded as malformed/unsupported.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// True when NAL units are buffered awaiting an emission trigger.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn process_packet(&mut self, pkt: RtpPacket<'_>) {
        // Gap detection mod 2^16: 65535 -> 0 is contiguous and must not
        // disturb an in-progress fragment train.
        if let Some(prev) = self.last_seq {
            if pkt.sequence_number != prev.wrapping_add(1) {
                self.losses += 1;
                if self.fragment.take().is_some() {
                    self.dropped += 1;
                }
            }
        }
        self.last_seq = Some(pkt.sequence_number);

        if pkt.payload.is_empty() {
            self.dropped += 1;
            return;
        }

        // Timestamp change closes the previous access unit; a fragment
        // spanning the change is stale and discarded.
        if let Some(ts) = self.pending_timestamp {
            if ts != pkt.timestamp {
                if self.fragment.take().is_some() {
                    self.dropped += 1;
                }
                if !self.pending.is_empty() {
                    self.emit(ts);
                }
                self.pending_timestamp = None;
            }
        }

        let nal_type = pkt.payload[0] & 0x1f;
        match nal_type {
            1..=23 => {
                self.push_nalu(Bytes::copy_from_slice(pkt.payload), pkt.timestamp);
            }
            NAL_TYPE_STAP_A => self.process_stap_a(&pkt),
            NAL_TYPE_FU_A => self.process_fu_a(&pkt),
            // STAP-B, MTAP16, MTAP24, FU-B: not produced by the sources we
            // pull from; counted so the gap is visible.
            25..=27 | 29 => self.dropped += 1,
            _ => self.dropped += 1,
        }

        if pkt.marker && !self.pending.is_empty() {
            self.emit(pkt.timestamp);
        }
    }

    /// Force emission of the buffered access unit. Used by the owner when
    /// neither the marker bit nor a timestamp change has arrived in time.
    pub fn flush(&mut self) {
        if let Some(ts) = self.pending_timestamp {
            if !self.pending.is_empty() {
                self.emit(ts);
            }
        }
    }

    fn push_nalu(&mut self, nalu: Bytes, timestamp: u32) {
        if nalu.is_empty() {
            self.dropped += 1;
            return;
        }
        self.pending.push(nalu);
        self.pending_timestamp = Some(timestamp);
    }

    /// STAP-A: one header byte, then length-prefixed NAL units.
    fn process_stap_a(&mut self, pkt: &RtpPacket<'_>) {
        let mut rest = &pkt.payload[1..];
        let mut units = Vec::new();
        while !rest.is_empty() {
            if rest.len() < 2 {
                self.dropped += 1;
                return;
            }
            let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if size == 0 || rest.len() < size {
                self.dropped += 1;
                return;
            }
            units.push(Bytes::copy_from_slice(&rest[..size]));
            rest = &rest[size..];
        }
        for unit in units {
            self.push_nalu(unit, pkt.timestamp);
        }
    }

    /// FU-A: indicator byte (F/NRI), header byte (S/E bits + original NAL
    /// type), fragment payload. The original NAL header is rebuilt from
    /// indicator NRI + header type.
    fn process_fu_a(&mut self, pkt: &RtpPacket<'_>) {
        if pkt.payload.len() < 2 {
            self.dropped += 1;
            return;
        }
        let indicator = pkt.payload[0];
        let header = pkt.payload[1];
        let start = header & 0x80 != 0;
        let end = header & 0x40 != 0;

        if start {
            if self.fragment.take().is_some() {
                // Start before the previous End: the old train is lost.
                self.dropped += 1;
            }
            let nal_header = (indicator & 0xe0) | (header & 0x1f);
            let mut buf = BytesMut::with_capacity(pkt.payload.len() - 1);
            buf.extend_from_slice(&[nal_header]);
            buf.extend_from_slice(&pkt.payload[2..]);
            self.fragment = Some(Fragment { buf });
        } else {
            match self.fragment.as_mut() {
                Some(frag) => frag.buf.extend_from_slice(&pkt.payload[2..]),
                None => {
                    // Continuation without a Start (head of train lost).
                    self.dropped += 1;
                    return;
                }
            }
        }

        if end {
            if let Some(frag) = self.fragment.take() {
                self.push_nalu(frag.buf.freeze(), pkt.timestamp);
            }
        }
    }

    fn emit(&mut self, rtp_timestamp: u32) {
        let mut nalus = std::mem::take(&mut self.pending);
        self.pending_timestamp = None;

        if !self.emitted_any {
            self.emitted_any = true;
            if let Some((sps, pps)) = self.param_sets.clone() {
                nalus.splice(0..0, [sps, pps]);
            }
        }

        let is_keyframe = nalus.iter().any(|n| n[0] & 0x1f == NAL_TYPE_IDR);
        self.sink.on_access_unit(AccessUnit {
            nalus,
            rtp_timestamp,
            is_keyframe,
        });
    }
}
