//! RTSP 1.0 client (interleaved TCP transport) and RTP depacketizers.
//!
//! The client pulls RTP over a single TCP socket (RFC 2326 section 10.12)
//! and hands interleaved payloads to the caller by channel id. The
//! depacketizers reassemble H.264 access units (RFC 6184) and AAC frames
//! (RFC 3640) from those payloads.

pub mod aac;
pub mod client;
pub mod h264;
pub mod message;
pub mod sdp;

use thiserror::Error;

/// Media kind advertised by an SDP media section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
        }
    }
}

/// One negotiated media track. `channel_id` is the interleaved RTP channel
/// accepted by the server at SETUP time (RTCP rides on `channel_id + 1`).
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub channel_id: u8,
    pub media_type: MediaType,
    pub control_uri: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    /// Raw `a=fmtp:` parameter string, if the server sent one.
    pub codec_params: Option<String>,
}

/// Borrowed view of one parsed RTP packet, as handed to a depacketizer.
/// The transport parses headers; depacketizers only care about these
/// four fields.
#[derive(Debug, Clone, Copy)]
pub struct RtpPacket<'a> {
    pub sequence_number: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: &'a [u8],
}

#[derive(Debug, Error)]
pub enum RtspError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("{method} failed: {status} {reason}")]
    Status {
        method: &'static str,
        status: u16,
        reason: String,
    },
    #[error("connection closed")]
    Closed,
    #[error("no response within deadline")]
    Timeout,
}

impl RtspError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        RtspError::Protocol(msg.into())
    }
}
