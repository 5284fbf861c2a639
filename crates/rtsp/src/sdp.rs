//! Minimal SDP parsing, just enough of RFC 4566 to drive SETUP and the
//! depacketizers: media sections, payload types, control URIs, rtpmap and
//! fmtp attributes. Everything else is ignored.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};

use crate::{MediaType, RtspError};

#[derive(Debug, Clone)]
pub struct SdpSession {
    /// Session-level `a=control:`, if present.
    pub session_control: Option<String>,
    pub media: Vec<MediaSection>,
}

#[derive(Debug, Clone)]
pub struct MediaSection {
    pub media_type: MediaType,
    /// First payload type advertised on the `m=` line.
    pub payload_type: u8,
    pub control: Option<String>,
    /// Codec name from `a=rtpmap:` (e.g. `H264`, `MPEG4-GENERIC`).
    pub codec: Option<String>,
    pub clock_rate: u32,
    /// Raw parameter string from `a=fmtp:`.
    pub fmtp: Option<String>,
}

impl MediaSection {
    /// Look up a single `name=value` parameter inside the fmtp string.
    pub fn fmtp_param(&self, name: &str) -> Option<&str> {
        let fmtp = self.fmtp.as_deref()?;
        for param in fmtp.split(';') {
            if let Some((k, v)) = param.trim().split_once('=') {
                if k.eq_ignore_ascii_case(name) {
                    return Some(v);
                }
            }
        }
        None
    }

    /// Decoded `sprop-parameter-sets` (H.264 SPS and PPS) from the fmtp.
    pub fn sprop_parameter_sets(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let value = self.fmtp_param("sprop-parameter-sets")?;
        let mut sets = value.split(',');
        let sps = decode_base64(sets.next()?)?;
        let pps = decode_base64(sets.next()?)?;
        if sps.is_empty() || pps.is_empty() {
            return None;
        }
        Some((sps, pps))
    }
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    STANDARD
        .decode(s)
        .or_else(|_| STANDARD_NO_PAD.decode(s.trim_end_matches('=')))
        .ok()
}

pub fn parse(body: &str) -> Result<SdpSession, RtspError> {
    let mut session = SdpSession {
        session_control: None,
        media: Vec::new(),
    };

    for raw_line in body.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.len() < 2 || line.as_bytes()[1] != b'=' {
            continue;
        }
        let (kind, value) = line.split_at(2);
        match kind {
            "m=" => {
                if let Some(media) = parse_media_line(value) {
                    session.media.push(media);
                }
            }
            "a=" => {
                if let Some(last) = session.media.last_mut() {
                    apply_media_attribute(last, value);
                } else if let Some(control) = value.strip_prefix("control:") {
                    session.session_control = Some(control.trim().to_string());
                }
            }
            _ => {}
        }
    }

    if session.media.is_empty() {
        return Err(RtspError::protocol("SDP advertises no media sections"));
    }
    Ok(session)
}

fn parse_media_line(value: &str) -> Option<MediaSection> {
    // "video 0 RTP/AVP 96"
    let mut parts = value.split_ascii_whitespace();
    let media_type = match parts.next()? {
        "video" => MediaType::Video,
        "audio" => MediaType::Audio,
        _ => return None,
    };
    let _port = parts.next()?;
    let _proto = parts.next()?;
    let payload_type = parts.next()?.parse().ok()?;
    Some(MediaSection {
        media_type,
        payload_type,
        control: None,
        codec: None,
        clock_rate: 0,
        fmtp: None,
    })
}

fn apply_media_attribute(media: &mut MediaSection, value: &str) {
    if let Some(control) = value.strip_prefix("control:") {
        media.control = Some(control.trim().to_string());
    } else if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
        // "96 H264/90000" or "97 MPEG4-GENERIC/48000/2"
        let mut parts = rtpmap.split_ascii_whitespace();
        let pt: Option<u8> = parts.next().and_then(|p| p.parse().ok());
        if pt != Some(media.payload_type) {
            return;
        }
        if let Some(encoding) = parts.next() {
            let mut fields = encoding.split('/');
            media.codec = fields.next().map(|c| c.to_string());
            media.clock_rate = fields.next().and_then(|r| r.parse().ok()).unwrap_or(0);
        }
    } else if let Some(fmtp) = value.strip_prefix("fmtp:") {
        if let Some((pt, params)) = fmtp.split_once(' ') {
            if pt.trim().parse::<u8>().ok() == Some(media.payload_type) {
                media.fmtp = Some(params.trim().to_string());
            }
        }
    }
}

/// Resolve a control URI against the DESCRIBE Content-Base. An absolute
/// URL wins; `*` or nothing means the base itself; anything else is
/// concatenated.
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("*") | Some("") => base.to_string(),
        Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
        Some(c) => {
            if base.ends_with('/') {
                format!("{base}{c}")
            } else {
                format!("{base}/{c}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEST_LIKE_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 0.0.0.0\r\n\
        s=Session\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;profile-level-id=4d4029;sprop-parameter-sets=Z01AKQ==,aO48gA==\r\n\
        a=control:track1\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
        a=fmtp:97 streamtype=5;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3;config=1188\r\n\
        a=control:track2\r\n";

    #[test]
    fn parses_two_media_sections() {
        let sdp = parse(NEST_LIKE_SDP).unwrap();
        assert_eq!(sdp.session_control.as_deref(), Some("*"));
        assert_eq!(sdp.media.len(), 2);

        let video = &sdp.media[0];
        assert_eq!(video.media_type, MediaType::Video);
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.codec.as_deref(), Some("H264"));
        assert_eq!(video.clock_rate, 90_000);
        assert_eq!(video.control.as_deref(), Some("track1"));

        let audio = &sdp.media[1];
        assert_eq!(audio.media_type, MediaType::Audio);
        assert_eq!(audio.payload_type, 97);
        assert_eq!(audio.codec.as_deref(), Some("MPEG4-GENERIC"));
        assert_eq!(audio.clock_rate, 48_000);
        assert_eq!(audio.fmtp_param("sizelength"), Some("13"));
    }

    #[test]
    fn decodes_sprop_parameter_sets() {
        let sdp = parse(NEST_LIKE_SDP).unwrap();
        let (sps, pps) = sdp.media[0].sprop_parameter_sets().unwrap();
        assert_eq!(sps, vec![0x67, 0x4d, 0x40, 0x29]);
        assert_eq!(pps, vec![0x68, 0xee, 0x3c, 0x80]);
    }

    #[test]
    fn missing_sprop_is_none() {
        let sdp = parse(
            "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\na=fmtp:96 packetization-mode=1\r\n",
        )
        .unwrap();
        assert!(sdp.media[0].sprop_parameter_sets().is_none());
    }

    #[test]
    fn ignores_unknown_attributes_and_media() {
        let sdp = parse(
            "v=0\r\n\
             a=tool:something\r\n\
             m=application 0 RTP/AVP 98\r\n\
             m=video 0 RTP/AVP 96\r\n\
             a=rtpmap:96 H264/90000\r\n\
             a=recvonly\r\n",
        )
        .unwrap();
        assert_eq!(sdp.media.len(), 1);
        assert_eq!(sdp.media[0].codec.as_deref(), Some("H264"));
    }

    #[test]
    fn empty_sdp_is_an_error() {
        assert!(parse("v=0\r\ns=empty\r\n").is_err());
    }

    #[test]
    fn control_resolution_absolute_wins() {
        assert_eq!(
            resolve_control("rtsp://host/base", Some("rtsp://other/stream")),
            "rtsp://other/stream"
        );
    }

    #[test]
    fn control_resolution_concatenates() {
        assert_eq!(
            resolve_control("rtsp://host/base", Some("track1")),
            "rtsp://host/base/track1"
        );
        assert_eq!(
            resolve_control("rtsp://host/base/", Some("track1")),
            "rtsp://host/base/track1"
        );
    }

    #[test]
    fn control_resolution_star_keeps_base() {
        assert_eq!(resolve_control("rtsp://host/base", Some("*")), "rtsp://host/base");
        assert_eq!(resolve_control("rtsp://host/base", None), "rtsp://host/base");
    }
}
