//! Wire-level classification of the interleaved RTSP byte stream.
//!
//! A single TCP socket carries both `$`-framed binary frames (RTP/RTCP)
//! and CRLFCRLF-terminated RTSP responses. [`MessageParser`] accumulates
//! bytes and yields complete events in arrival order.

use bytes::{Buf, Bytes, BytesMut};

use crate::RtspError;

/// Interleaved frame marker byte (`$`).
const FRAME_MARKER: u8 = 0x24;

/// Largest response head (status line + headers) we accept before
/// declaring the stream corrupt.
const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug)]
pub enum RtspEvent {
    /// Binary frame from an interleaved channel (RTP on even, RTCP on odd).
    Frame { channel: u8, payload: Bytes },
    Response(RtspResponse),
}

#[derive(Debug)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    /// Case-insensitive header lookup; returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    /// Session id and `timeout=N` seconds from the `Session:` header.
    pub fn session(&self) -> Option<(String, Option<u64>)> {
        let value = self.header("Session")?;
        let mut parts = value.split(';');
        let id = parts.next()?.trim();
        if id.is_empty() {
            return None;
        }
        let mut timeout = None;
        for part in parts {
            if let Some(v) = part.trim().strip_prefix("timeout=") {
                timeout = v.trim().parse().ok();
            }
        }
        Some((id.to_string(), timeout))
    }

    /// The `interleaved=a-b` channel pair from the `Transport:` header.
    pub fn interleaved_channels(&self) -> Option<(u8, u8)> {
        let transport = self.header("Transport")?;
        for part in transport.split(';') {
            if let Some(value) = part.trim().strip_prefix("interleaved=") {
                let mut range = value.split('-');
                let rtp = range.next()?.trim().parse().ok()?;
                let rtcp = match range.next() {
                    Some(v) => v.trim().parse().ok()?,
                    None => rtp + 1,
                };
                return Some((rtp, rtcp));
            }
        }
        None
    }

    /// Methods advertised by an OPTIONS response's `Public:` header.
    pub fn public_methods(&self) -> Vec<String> {
        self.header("Public")
            .map(|v| v.split(',').map(|m| m.trim().to_ascii_uppercase()).collect())
            .unwrap_or_default()
    }
}

/// Incremental parser over the socket byte stream.
#[derive(Default)]
pub struct MessageParser {
    buf: BytesMut,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes and drain every complete event.
    pub fn append(&mut self, data: &[u8]) -> Result<Vec<RtspEvent>, RtspError> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    fn next_event(&mut self) -> Result<Option<RtspEvent>, RtspError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == FRAME_MARKER {
            return self.next_frame();
        }
        self.next_response()
    }

    fn next_frame(&mut self) -> Result<Option<RtspEvent>, RtspError> {
        // $ + channel + 2-byte big-endian length + payload
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let channel = self.buf[1];
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(RtspEvent::Frame { channel, payload }))
    }

    fn next_response(&mut self) -> Result<Option<RtspEvent>, RtspError> {
        let head_end = match find_crlfcrlf(&self.buf) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > MAX_HEAD {
                    return Err(RtspError::protocol("response head exceeds limit"));
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| RtspError::protocol("response head is not UTF-8"))?;
        let (status, reason, headers) = parse_head(head)?;

        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let total = head_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(head_end + 4);
        let body = self.buf.split_to(content_length).to_vec();

        Ok(Some(RtspEvent::Response(RtspResponse {
            status,
            reason,
            headers,
            body,
        })))
    }
}

fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

type Head = (u16, String, Vec<(String, String)>);

fn parse_head(head: &str) -> Result<Head, RtspError> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| RtspError::protocol("empty response"))?;

    // "RTSP/1.0 200 OK"
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("RTSP/") {
        return Err(RtspError::protocol(format!(
            "bad status line: {status_line:?}"
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RtspError::protocol(format!("bad status line: {status_line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RtspError::protocol(format!("bad header line: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((status, reason, headers))
}
