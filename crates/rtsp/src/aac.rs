//! AAC RTP depacketization (RFC 3640, AAC-hbr mode).
//!
//! AU-headers are 16 bits each: a 13-bit size and a 3-bit index. Most
//! packets carry one or more whole access units; a single oversized AU may
//! be fragmented across packets and is reassembled here. The relay parses
//! audio so the interleaved stream stays in sync, but frames are counted
//! rather than forwarded (the SFU side expects Opus).

use bytes::{Bytes, BytesMut};

use crate::RtpPacket;

/// One AAC access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub rtp_timestamp: u32,
}

pub trait AudioFrameSink {
    fn on_frame(&mut self, frame: AudioFrame);
}

impl<F: FnMut(AudioFrame)> AudioFrameSink for F {
    fn on_frame(&mut self, frame: AudioFrame) {
        self(frame)
    }
}

struct AacFragment {
    rtp_timestamp: u32,
    size: usize,
    buf: BytesMut,
}

pub struct AacDepacketizer<S> {
    sink: S,
    frag: Option<AacFragment>,
    dropped: u64,
}

impl<S: AudioFrameSink> AacDepacketizer<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            frag: None,
            dropped: 0,
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn process_packet(&mut self, pkt: RtpPacket<'_>) {
        if pkt.payload.len() < 2 {
            self.dropped += 1;
            return;
        }
        let header_bits = u16::from_be_bytes([pkt.payload[0], pkt.payload[1]]) as usize;
        // AAC-hbr AU headers are exactly 16 bits each.
        if header_bits == 0 || header_bits % 16 != 0 {
            self.dropped += 1;
            return;
        }
        let count = header_bits / 16;
        let headers_end = 2 + count * 2;
        if pkt.payload.len() < headers_end {
            self.dropped += 1;
            return;
        }

        let first_size =
            (u16::from_be_bytes([pkt.payload[2], pkt.payload[3]]) >> 3) as usize;
        let mut data = &pkt.payload[headers_end..];

        if let Some(mut frag) = self.frag.take() {
            // Only a lone continuation of the same AU extends a fragment.
            if count == 1 && frag.rtp_timestamp == pkt.timestamp && frag.size == first_size {
                frag.buf.extend_from_slice(data);
                match frag.buf.len().cmp(&frag.size) {
                    std::cmp::Ordering::Less => self.frag = Some(frag),
                    std::cmp::Ordering::Equal => self.sink.on_frame(AudioFrame {
                        data: frag.buf.freeze(),
                        rtp_timestamp: frag.rtp_timestamp,
                    }),
                    std::cmp::Ordering::Greater => self.dropped += 1,
                }
                return;
            }
            // Anything else means the fragment can never complete.
            self.dropped += 1;
        }

        for i in 0..count {
            let header =
                u16::from_be_bytes([pkt.payload[2 + i * 2], pkt.payload[3 + i * 2]]);
            let size = (header >> 3) as usize;
            if data.len() < size {
                // A single AU larger than the packet starts a fragment.
                if count == 1 && !pkt.marker {
                    let mut buf = BytesMut::with_capacity(size);
                    buf.extend_from_slice(data);
                    self.frag = Some(AacFragment {
                        rtp_timestamp: pkt.timestamp,
                        size,
                        buf,
                    });
                } else {
                    self.dropped += 1;
                }
                return;
            }
            self.sink.on_frame(AudioFrame {
                data: Bytes::copy_from_slice(&data[..size]),
                rtp_timestamp: pkt.timestamp,
            });
            data = &data[size..];
        }
    }
}
