//! Per-camera pipeline: source lifetime manager + SFU bridge + RTSP
//! session + depacketizers, composed with a supervisor-of-one restart
//! policy.
//!
//! Startup order: mint stream -> connect SFU -> connect RTSP -> PLAY.
//! Teardown order on any trigger (RTSP closed, SFU failed, stream
//! expired): SFU first, then RTSP. Every rebuild starts a new generation;
//! work stamped with an older generation is discarded so late callbacks
//! from a torn-down attempt cannot touch fresh state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use camrelay_rtsp::client::RtspSession;
use camrelay_rtsp::h264::{AccessUnit, H264Depacketizer};
use camrelay_rtsp::aac::{AacDepacketizer, AudioFrame};
use camrelay_rtsp::{MediaType, RtpPacket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, Semaphore, mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::error::{RelayError, Result};
use crate::sdm::SdmClient;
use crate::sfu::{CallsConfig, SfuBridge, SfuState};
use crate::source::{self, LifetimeManager, SharedSource, SourceEvent};
use crate::stats::PipelineStats;

/// Restart backoff bounds.
const RESTART_BASE: Duration = Duration::from_secs(1);
const RESTART_CAP: Duration = Duration::from_secs(60);

/// Force access-unit emission when neither the marker bit nor a timestamp
/// change has arrived this long after the last NAL.
const AU_WATCHDOG: Duration = Duration::from_millis(500);

/// Assumed frame spacing until RTP timestamps establish the real one.
const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(33);

/// Depth of the access-unit queue between the RTSP dispatcher and the
/// sample writer; overflow drops frames instead of stalling the socket.
const AU_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Starting = 0,
    Running = 1,
    Restarting = 2,
    Stopped = 3,
}

impl PipelineState {
    pub fn from_u8(v: u8) -> PipelineState {
        match v {
            1 => PipelineState::Running,
            2 => PipelineState::Restarting,
            3 => PipelineState::Stopped,
            _ => PipelineState::Starting,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Restarting => "restarting",
            PipelineState::Stopped => "stopped",
        }
    }
}

pub struct Pipeline {
    pub camera_id: String,
    pub display_name: String,
    project_id: String,
    sdm: Arc<SdmClient>,
    calls: CallsConfig,
    http: reqwest::Client,
    pub stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        camera_id: String,
        display_name: String,
        project_id: String,
        sdm: Arc<SdmClient>,
        calls: CallsConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            camera_id,
            display_name,
            project_id,
            sdm,
            calls,
            http,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    /// Run until shutdown. Failures rebuild the whole dataflow with
    /// exponential backoff; one successfully written sample counts as
    /// forward progress and resets the backoff.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, startups: Arc<Semaphore>) {
        let mut backoff = RESTART_BASE;
        let mut first_attempt = true;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if !first_attempt {
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            }
            first_attempt = false;

            let generation = self.stats.begin_generation();
            self.stats.set_state(PipelineState::Starting);
            let progressed = Arc::new(AtomicBool::new(false));

            match self
                .run_once(generation, &mut shutdown, &startups, &progressed)
                .await
            {
                Ok(()) | Err(RelayError::Cancelled) => break,
                Err(e) => {
                    self.stats.set_state(PipelineState::Restarting);
                    let (sleep_for, next) = next_backoff(backoff, progressed.load(Ordering::Relaxed));
                    warn!(
                        camera = %self.camera_id,
                        generation,
                        retry_in_secs = sleep_for.as_secs(),
                        "pipeline failed: {e}"
                    );
                    backoff = next;
                    if !sleep_or_shutdown(&mut shutdown, sleep_for).await {
                        break;
                    }
                }
            }
        }
        self.stats.set_state(PipelineState::Stopped);
        info!(camera = %self.camera_id, "pipeline stopped");
    }

    /// One full build-and-relay attempt.
    async fn run_once(
        &self,
        generation: u64,
        shutdown: &mut watch::Receiver<bool>,
        startups: &Arc<Semaphore>,
        progressed: &Arc<AtomicBool>,
    ) -> Result<()> {
        // The permit bounds concurrent control-plane bursts (token mint,
        // stream generation, SFU negotiation) across the fleet.
        let permit = match startups.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(RelayError::Cancelled),
        };

        let handle = source::acquire(&self.sdm, &self.project_id, &self.camera_id).await?;
        self.stats.set_expires_at(Some(handle.expires_at));
        let shared: SharedSource = Arc::new(RwLock::new(Arc::new(handle)));

        // The lifetime manager lives exactly as long as this attempt.
        let (manager_cancel_tx, manager_cancel_rx) = watch::channel(false);
        let (source_events_tx, mut source_events) = mpsc::channel(1);
        let manager = LifetimeManager::new(
            Arc::clone(&self.sdm),
            Arc::clone(&shared),
            Arc::clone(&self.stats),
            source_events_tx,
            manager_cancel_rx,
        );
        let manager_task = tokio::spawn(manager.run());

        let result = self
            .relay_media(generation, &shared, &mut source_events, shutdown, progressed, permit)
            .await;

        manager_cancel_tx.send(true).ok();
        if tokio::time::timeout(Duration::from_secs(2), manager_task)
            .await
            .is_err()
        {
            debug!(camera = %self.camera_id, "lifetime manager slow to exit");
        }

        // Release the cloud stream. A clean stop waits; a rebuild must not
        // delay the fresh GenerateRtspStream, so it detaches.
        let current = shared.read().await.clone();
        match &result {
            Ok(()) | Err(RelayError::Cancelled) => source::stop(&self.sdm, &current).await,
            Err(_) => {
                let sdm = Arc::clone(&self.sdm);
                tokio::spawn(async move {
                    source::stop(&sdm, &current).await;
                });
            }
        }
        self.stats.set_expires_at(None);
        result
    }

    /// SFU + RTSP dataflow for one generation. Returns `Ok` only on
    /// cooperative shutdown.
    async fn relay_media(
        &self,
        generation: u64,
        shared: &SharedSource,
        source_events: &mut mpsc::Receiver<SourceEvent>,
        shutdown: &mut watch::Receiver<bool>,
        progressed: &Arc<AtomicBool>,
        startup_permit: tokio::sync::SemaphorePermit<'_>,
    ) -> Result<()> {
        let bridge = Arc::new(
            SfuBridge::connect(&self.calls, self.http.clone(), &self.camera_id, shutdown).await?,
        );
        self.stats.set_sfu_state(bridge.state());

        let result = self
            .relay_rtsp(generation, shared, &bridge, source_events, shutdown, progressed, startup_permit)
            .await;

        // relay_rtsp closes the bridge on its main path (SFU before RTSP);
        // this covers the early-error returns.
        if bridge.state() != SfuState::Closed {
            bridge.close().await;
        }
        self.stats.set_sfu_state(SfuState::Closed);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_rtsp(
        &self,
        generation: u64,
        shared: &SharedSource,
        bridge: &Arc<SfuBridge>,
        source_events: &mut mpsc::Receiver<SourceEvent>,
        shutdown: &mut watch::Receiver<bool>,
        progressed: &Arc<AtomicBool>,
        startup_permit: tokio::sync::SemaphorePermit<'_>,
    ) -> Result<()> {
        let url = shared.read().await.rtsp_url.clone();
        if url.is_empty() {
            return Err(RelayError::Protocol("source handle has no RTSP URL".into()));
        }
        let mut rtsp = RtspSession::connect(&url).await?;

        let video_channel = rtsp
            .tracks
            .iter()
            .find(|t| t.media_type == MediaType::Video)
            .map(|t| t.channel_id);
        let audio_channel = rtsp
            .tracks
            .iter()
            .find(|t| t.media_type == MediaType::Audio)
            .map(|t| t.channel_id);
        if video_channel.is_none() {
            rtsp.teardown().await;
            return Err(RelayError::Protocol("source advertises no video track".into()));
        }
        let sps_pps = rtsp
            .sdp
            .media
            .iter()
            .find(|m| m.media_type == MediaType::Video)
            .and_then(|m| m.sprop_parameter_sets());

        // Sinks are fixed here, before PLAY, so no sample can arrive
        // without a destination.
        let (au_tx, au_rx) = mpsc::channel::<AccessUnit>(AU_QUEUE);
        let sink_stats = Arc::clone(&self.stats);
        let mut h264 = H264Depacketizer::new(sps_pps, move |au: AccessUnit| {
            match au_tx.try_send(au) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // Prefer dropping a frame over stalling the socket.
                    sink_stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        });
        let audio_stats = Arc::clone(&self.stats);
        let mut aac = AacDepacketizer::new(move |_frame: AudioFrame| {
            audio_stats.audio_frames.fetch_add(1, Ordering::Relaxed);
        });

        let writer = tokio::spawn(write_samples(
            Arc::clone(bridge),
            au_rx,
            Arc::clone(&self.stats),
            generation,
            Arc::clone(progressed),
            self.camera_id.clone(),
        ));

        rtsp.play().await?;
        self.stats.set_state(PipelineState::Running);
        drop(startup_permit);
        info!(camera = %self.camera_id, generation, "relay running");

        let mut sfu_state = bridge.subscribe_state();
        let mut manager_alive = true;
        let result = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                event = source_events.recv(), if manager_alive => {
                    match event {
                        Some(SourceEvent::RebuildRequired) => break Err(RelayError::Expiry),
                        None => manager_alive = false,
                    }
                }
                changed = sfu_state.changed() => {
                    if changed.is_err() {
                        break Err(RelayError::Negotiation("SFU state channel closed".into()));
                    }
                    let state = *sfu_state.borrow();
                    self.stats.set_sfu_state(state);
                    if matches!(state, SfuState::Failed | SfuState::Closed) {
                        break Err(RelayError::Negotiation("SFU peer connection failed".into()));
                    }
                }
                frame = rtsp.recv_frame() => {
                    let Some(frame) = frame else {
                        break Err(RelayError::Transport("RTSP connection closed".into()));
                    };
                    let channel = Some(frame.channel);
                    if channel == video_channel {
                        if let Some(view) = parse_rtp(&frame.payload) {
                            self.stats.video_packets.fetch_add(1, Ordering::Relaxed);
                            h264.process_packet(as_view(&view));
                            self.stats.rtp_losses.store(h264.loss_count(), Ordering::Relaxed);
                        }
                    } else if channel == audio_channel {
                        if let Some(view) = parse_rtp(&frame.payload) {
                            self.stats.audio_packets.fetch_add(1, Ordering::Relaxed);
                            aac.process_packet(as_view(&view));
                        }
                    }
                    // Odd channels carry RTCP; nothing to do with it here.
                }
                _ = tokio::time::sleep(AU_WATCHDOG), if h264.has_pending() => {
                    // Neither marker nor timestamp change showed up.
                    h264.flush();
                }
            }
        };

        debug!(
            camera = %self.camera_id,
            generation,
            dropped_pre_connect = bridge.samples_dropped(),
            "tearing down relay"
        );
        // Teardown order: the SFU leg first, then the RTSP session.
        bridge.close().await;
        rtsp.teardown().await;
        // Dropping the depacketizers drops their sinks; the writer drains
        // the queue and exits.
        drop(h264);
        drop(aac);
        writer.await.ok();
        result
    }
}

/// `(sleep_now, next_backoff)`; forward progress resets the schedule.
fn next_backoff(backoff: Duration, progressed: bool) -> (Duration, Duration) {
    let current = if progressed { RESTART_BASE } else { backoff };
    (current, (current * 2).min(RESTART_CAP))
}

async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    let sleep = tokio::time::sleep(wait);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
}

fn parse_rtp(payload: &[u8]) -> Option<Packet> {
    let mut buf = payload;
    match Packet::unmarshal(&mut buf) {
        Ok(packet) => Some(packet),
        Err(e) => {
            debug!("unparseable RTP packet: {e}");
            None
        }
    }
}

fn as_view(packet: &Packet) -> RtpPacket<'_> {
    RtpPacket {
        sequence_number: packet.header.sequence_number,
        timestamp: packet.header.timestamp,
        marker: packet.header.marker,
        payload: &packet.payload,
    }
}

/// Frame spacing from consecutive RTP timestamps at the 90 kHz clock;
/// nonsense deltas (reordering, >1 s jumps) fall back to the default.
fn sample_duration(prev: Option<u32>, now: u32) -> Duration {
    match prev {
        Some(prev) => {
            let delta = now.wrapping_sub(prev);
            if delta == 0 || delta > 90_000 {
                DEFAULT_FRAME_DURATION
            } else {
                Duration::from_nanos(delta as u64 * 1_000_000_000 / 90_000)
            }
        }
        None => DEFAULT_FRAME_DURATION,
    }
}

/// Drain reassembled access units into the SFU track. Exits when the
/// queue closes or the pipeline has moved on to a newer generation.
async fn write_samples(
    bridge: Arc<SfuBridge>,
    mut au_rx: mpsc::Receiver<AccessUnit>,
    stats: Arc<PipelineStats>,
    generation: u64,
    progressed: Arc<AtomicBool>,
    camera_id: String,
) {
    let mut prev_ts: Option<u32> = None;
    let mut written = 0u64;
    let mut errors = 0u64;
    let mut seen_keyframe = false;

    while let Some(au) = au_rx.recv().await {
        // A rebuild bumped the generation: this writer is stale.
        if stats.generation.load(Ordering::Relaxed) != generation {
            debug!(camera = %camera_id, generation, "stale writer exiting");
            return;
        }

        let duration = sample_duration(prev_ts, au.rtp_timestamp);
        prev_ts = Some(au.rtp_timestamp);
        if au.is_keyframe && !seen_keyframe {
            seen_keyframe = true;
            info!(camera = %camera_id, generation, "first keyframe from source");
        }

        match bridge.write_video_sample(au.annex_b(), duration).await {
            Ok(true) => {
                written += 1;
                progressed.store(true, Ordering::Relaxed);
                stats.video_frames.fetch_add(1, Ordering::Relaxed);
                if written == 1 {
                    info!(camera = %camera_id, generation, "first sample written to SFU");
                } else if written % 1800 == 0 {
                    debug!(camera = %camera_id, written, "samples written to SFU");
                }
            }
            Ok(false) => {
                stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                errors += 1;
                if errors <= 3 || errors % 100 == 0 {
                    warn!(camera = %camera_id, errors, "sample write failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            PipelineState::Starting,
            PipelineState::Running,
            PipelineState::Restarting,
            PipelineState::Stopped,
        ] {
            assert_eq!(PipelineState::from_u8(state as u8), state);
        }
        assert_eq!(PipelineState::from_u8(200), PipelineState::Starting);
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets_on_progress() {
        let (sleep1, next) = next_backoff(RESTART_BASE, false);
        assert_eq!(sleep1, Duration::from_secs(1));
        assert_eq!(next, Duration::from_secs(2));

        let mut backoff = RESTART_BASE;
        for _ in 0..10 {
            let (_, next) = next_backoff(backoff, false);
            backoff = next;
        }
        assert_eq!(backoff, RESTART_CAP);

        // One good sample write collapses the schedule back to base.
        let (sleep_now, next) = next_backoff(backoff, true);
        assert_eq!(sleep_now, RESTART_BASE);
        assert_eq!(next, Duration::from_secs(2));
    }

    #[test]
    fn sample_duration_follows_rtp_clock() {
        assert_eq!(sample_duration(None, 9000), DEFAULT_FRAME_DURATION);
        // 3000 ticks at 90 kHz = one 30 fps frame.
        assert_eq!(
            sample_duration(Some(6000), 9000),
            Duration::from_nanos(3000 * 1_000_000_000 / 90_000)
        );
        // Wrap-around still yields the right spacing.
        assert_eq!(
            sample_duration(Some(u32::MAX - 1499), 1500),
            Duration::from_nanos(3000 * 1_000_000_000 / 90_000)
        );
        // Reordered or absurd deltas fall back.
        assert_eq!(sample_duration(Some(9000), 9000), DEFAULT_FRAME_DURATION);
        assert_eq!(sample_duration(Some(9000), 8000), DEFAULT_FRAME_DURATION);
        assert_eq!(
            sample_duration(Some(0), 10_000_000),
            DEFAULT_FRAME_DURATION
        );
    }

    #[test]
    fn rtp_parse_rejects_garbage() {
        assert!(parse_rtp(&[0x01, 0x02]).is_none());
        // Minimal valid RTP header (version 2).
        let mut packet = vec![0x80, 96, 0x00, 0x01, 0, 0, 0, 1, 0, 0, 0, 2];
        packet.extend_from_slice(&[0x41, 0xaa]);
        let parsed = parse_rtp(&packet).unwrap();
        assert_eq!(parsed.header.sequence_number, 1);
        assert_eq!(parsed.payload.as_ref(), &[0x41, 0xaa]);
    }
}
