//! Cloudflare Calls bridge: REST control plane plus the outbound
//! PeerConnection that carries one sendonly H.264 track per camera.
//!
//! Negotiation: create session -> add local track with our SDP offer ->
//! apply the SFU's answer -> wait for the PeerConnection to reach
//! Connected. `tracks/new` is the only retried call; the other control
//! calls mutate visible SFU state and run exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{RelayError, Result};

pub const CALLS_ENDPOINT: &str = "https://rtc.live.cloudflare.com/v1";

const STUN_SERVER: &str = "stun:stun.cloudflare.com:3478";

/// `tracks/new` retry schedule: 100 ms doubling to a 10 s cap.
const TRACKS_NEW_ATTEMPTS: usize = 8;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(10);

/// How long negotiation may take from offer to ICE connected.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SfuState {
    New = 0,
    Negotiating = 1,
    Connected = 2,
    Failed = 3,
    Closed = 4,
}

impl SfuState {
    pub fn from_u8(v: u8) -> SfuState {
        match v {
            1 => SfuState::Negotiating,
            2 => SfuState::Connected,
            3 => SfuState::Failed,
            4 => SfuState::Closed,
            _ => SfuState::New,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SfuState::New => "new",
            SfuState::Negotiating => "negotiating",
            SfuState::Connected => "connected",
            SfuState::Failed => "failed",
            SfuState::Closed => "closed",
        }
    }
}

#[derive(Clone)]
pub struct CallsConfig {
    pub endpoint: String,
    pub app_id: String,
    pub api_token: String,
}

impl CallsConfig {
    pub fn new(app_id: &str, api_token: &str) -> Self {
        Self {
            endpoint: CALLS_ENDPOINT.to_string(),
            app_id: app_id.to_string(),
            api_token: api_token.to_string(),
        }
    }
}

// --- wire types -----------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct SessionDescription {
    sdp: String,
    #[serde(rename = "type")]
    sdp_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalTrack {
    location: &'static str,
    mid: String,
    track_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewTracksRequest {
    session_description: SessionDescription,
    tracks: Vec<LocalTrack>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResponse {
    session_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TracksResponse {
    session_description: Option<SessionDescription>,
    requires_immediate_renegotiation: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenegotiateRequest {
    session_description: SessionDescription,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseTracksRequest {
    tracks: Vec<CloseTrack>,
    force: bool,
}

#[derive(Debug, Serialize)]
struct CloseTrack {
    mid: String,
}

// --- REST client ----------------------------------------------------------

struct CallsApi {
    http: reqwest::Client,
    endpoint: String,
    app_id: String,
    api_token: String,
}

impl CallsApi {
    fn new(http: reqwest::Client, config: &CallsConfig) -> Self {
        Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            api_token: config.api_token.clone(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/apps/{}/{suffix}", self.endpoint, self.app_id)
    }

    async fn new_session(&self) -> Result<String> {
        let response = self
            .http
            .post(self.url("sessions/new"))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let response = check_status(response).await?;
        let parsed: NewSessionResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Negotiation(format!("bad session response: {e}")))?;
        Ok(parsed.session_id)
    }

    /// Add local tracks. Retried with exponential backoff; a cancellation
    /// signal aborts between attempts.
    async fn new_tracks(
        &self,
        session_id: &str,
        request: &NewTracksRequest,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<TracksResponse> {
        let url = self.url(&format!("sessions/{session_id}/tracks/new"));
        let delays = backoff_delays(TRACKS_NEW_ATTEMPTS);
        let mut last_err = RelayError::Negotiation("tracks/new never attempted".into());

        for (attempt, delay) in delays.iter().copied().map(Some).chain([None]).enumerate() {
            match self.try_new_tracks(&url, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(attempt = attempt + 1, "tracks/new failed: {e}");
                    last_err = e;
                }
            }
            let Some(delay) = delay else { break };
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = cancel.changed() => {
                        if changed.is_err() || *cancel.borrow() {
                            return Err(RelayError::Cancelled);
                        }
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn try_new_tracks(
        &self,
        url: &str,
        request: &NewTracksRequest,
    ) -> Result<TracksResponse> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_token)
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| RelayError::Negotiation(format!("bad tracks response: {e}")))
    }

    async fn renegotiate(&self, session_id: &str, answer_sdp: String) -> Result<()> {
        let url = self.url(&format!("sessions/{session_id}/renegotiate"));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.api_token)
            .json(&RenegotiateRequest {
                session_description: SessionDescription {
                    sdp: answer_sdp,
                    sdp_type: "answer".to_string(),
                },
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn close_tracks(&self, session_id: &str, mids: Vec<String>) -> Result<()> {
        let url = self.url(&format!("sessions/{session_id}/tracks/close"));
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.api_token)
            .json(&CloseTracksRequest {
                tracks: mids.into_iter().map(|mid| CloseTrack { mid }).collect(),
                force: true,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

fn backoff_delays(attempts: usize) -> Vec<Duration> {
    let mut delays = Vec::new();
    let mut delay = RETRY_BASE;
    for _ in 1..attempts {
        delays.push(delay);
        delay = (delay * 2).min(RETRY_CAP);
    }
    delays
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(RelayError::Transport(format!("SFU error: {status}: {body}")))
    } else {
        Err(RelayError::Negotiation(format!(
            "SFU rejected request: {status}: {body}"
        )))
    }
}

// --- bridge ---------------------------------------------------------------

pub struct SfuBridge {
    api: CallsApi,
    pub session_id: String,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    video_mid: String,
    pub track_name: String,
    state_tx: Arc<watch::Sender<SfuState>>,
    state_rx: watch::Receiver<SfuState>,
    samples_dropped: AtomicU64,
}

impl SfuBridge {
    /// Create a Calls session, negotiate the sendonly video track and wait
    /// until media can flow.
    pub async fn connect(
        config: &CallsConfig,
        http: reqwest::Client,
        camera_id: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<SfuBridge> {
        let api = CallsApi::new(http, config);
        let session_id = api.new_session().await?;
        debug!(%session_id, camera_id, "SFU session created");

        let mut bridge = Self::build(api, session_id, camera_id).await?;
        match bridge.negotiate(cancel).await {
            Ok(()) => Ok(bridge),
            Err(e) => {
                bridge.state_tx.send_replace(SfuState::Failed);
                bridge.pc.close().await.ok();
                Err(e)
            }
        }
    }

    /// Assemble the PeerConnection and local track (no network yet).
    async fn build(api: CallsApi, session_id: String, camera_id: &str) -> Result<SfuBridge> {
        let mut media_engine = MediaEngine::default();
        // H.264 only. The sources hand us H.264 as-is and nothing else is
        // ever sent, so offering more codecs just invites a mismatch.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_string(),
                    clock_rate: 90_000,
                    channels: 0,
                    sdp_fmtp_line:
                        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                            .to_string(),
                    rtcp_feedback: vec![],
                },
                payload_type: 102,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let webrtc_api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(webrtc_api.new_peer_connection(pc_config).await?);

        let track_name = format!("camera-{camera_id}-{}", Uuid::new_v4());
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video".to_string(),
            format!("camrelay-{camera_id}"),
        ));
        pc.add_transceiver_from_track(
            Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Sendonly,
                send_encodings: vec![],
            }),
        )
        .await?;

        let (state_tx, state_rx) = watch::channel(SfuState::New);
        let state_tx = Arc::new(state_tx);

        let pc_state_tx = Arc::clone(&state_tx);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            match state {
                RTCPeerConnectionState::Connected => {
                    pc_state_tx.send_replace(SfuState::Connected);
                }
                RTCPeerConnectionState::Failed => {
                    warn!("SFU peer connection failed");
                    pc_state_tx.send_replace(SfuState::Failed);
                }
                RTCPeerConnectionState::Closed => {
                    pc_state_tx.send_replace(SfuState::Closed);
                }
                _ => debug!(?state, "SFU peer connection state"),
            }
            Box::pin(async {})
        }));

        Ok(SfuBridge {
            api,
            session_id,
            pc,
            video_track,
            video_mid: String::new(),
            track_name,
            state_tx,
            state_rx,
            samples_dropped: AtomicU64::new(0),
        })
    }

    async fn negotiate(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        self.state_tx.send_replace(SfuState::Negotiating);

        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;

        // The mid is assigned during offer creation.
        let transceivers = self.pc.get_transceivers().await;
        let mid = match transceivers.first() {
            Some(t) => t.mid().map(|s| s.to_string()).unwrap_or_default(),
            None => String::new(),
        };
        if mid.is_empty() {
            return Err(RelayError::Negotiation(
                "video transceiver has no mid after offer".into(),
            ));
        }
        self.video_mid = mid.clone();

        let request = NewTracksRequest {
            session_description: SessionDescription {
                sdp: offer.sdp,
                sdp_type: "offer".to_string(),
            },
            tracks: vec![LocalTrack {
                location: "local",
                mid,
                track_name: self.track_name.clone(),
            }],
        };
        let response = self
            .api
            .new_tracks(&self.session_id, &request, cancel)
            .await?;

        let description = response.session_description.ok_or_else(|| {
            RelayError::Negotiation("tracks/new response carried no sessionDescription".into())
        })?;
        match description.sdp_type.as_str() {
            "answer" => {
                let answer = RTCSessionDescription::answer(description.sdp)?;
                self.pc.set_remote_description(answer).await?;
            }
            // The SFU may instead hand back a fresh offer that must be
            // answered through the renegotiate call.
            "offer" => {
                self.apply_remote_offer(description.sdp).await?;
            }
            other => {
                return Err(RelayError::Negotiation(format!(
                    "unexpected sessionDescription type {other:?}"
                )));
            }
        }
        if response.requires_immediate_renegotiation {
            debug!(session_id = %self.session_id, "SFU requires immediate renegotiation");
        }

        self.wait_connected(cancel).await?;
        info!(
            session_id = %self.session_id,
            track = %self.track_name,
            mid = %self.video_mid,
            "SFU bridge connected"
        );
        Ok(())
    }

    /// Answer a remote offer on the established session (track changes on
    /// the SFU side).
    pub async fn apply_remote_offer(&self, offer_sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(offer_sdp)?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.api.renegotiate(&self.session_id, answer.sdp).await
    }

    async fn wait_connected(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            match *self.state_rx.borrow() {
                SfuState::Connected => return Ok(()),
                SfuState::Failed | SfuState::Closed => {
                    return Err(RelayError::Negotiation(
                        "peer connection failed during negotiation".into(),
                    ));
                }
                _ => {}
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RelayError::Negotiation(format!(
                        "ICE not connected within {CONNECT_TIMEOUT:?}"
                    )));
                }
                changed = self.state_rx.changed() => {
                    if changed.is_err() {
                        return Err(RelayError::Negotiation("state channel closed".into()));
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(RelayError::Cancelled);
                    }
                }
            }
        }
    }

    pub fn state(&self) -> SfuState {
        *self.state_rx.borrow()
    }

    /// Watch for Failed/Closed transitions after connect.
    pub fn subscribe_state(&self) -> watch::Receiver<SfuState> {
        self.state_rx.clone()
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped.load(Ordering::Relaxed)
    }

    /// Write one access unit. Returns `Ok(false)` (and counts the drop)
    /// while the peer connection is not Connected; `duration` paces the
    /// track's 90 kHz RTP clock.
    pub async fn write_video_sample(&self, data: Bytes, duration: Duration) -> Result<bool> {
        if *self.state_rx.borrow() != SfuState::Connected {
            self.samples_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        self.video_track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| RelayError::Negotiation(format!("write_sample: {e}")))?;
        Ok(true)
    }

    /// Close the track on the SFU (best effort) and the PeerConnection.
    pub async fn close(&self) {
        if !self.video_mid.is_empty() {
            let close = self
                .api
                .close_tracks(&self.session_id, vec![self.video_mid.clone()]);
            match tokio::time::timeout(Duration::from_secs(5), close).await {
                Ok(Ok(())) => debug!(session_id = %self.session_id, "SFU track closed"),
                Ok(Err(e)) => debug!("SFU track close failed: {e}"),
                Err(_) => debug!("SFU track close timed out"),
            }
        }
        self.pc.close().await.ok();
        self.state_tx.send_replace(SfuState::Closed);
    }
}
