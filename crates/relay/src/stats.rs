//! Per-pipeline counters: lock-free monotone atomics, reset only on
//! rebuild. The supervisor's snapshot is best-effort consistent (each
//! field is read independently).

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::PipelineState;
use crate::sfu::SfuState;

#[derive(Default)]
pub struct PipelineStats {
    pub video_packets: AtomicU64,
    pub video_frames: AtomicU64,
    pub audio_packets: AtomicU64,
    pub audio_frames: AtomicU64,
    /// Samples dropped before the SFU reached Connected (plus queue-full
    /// drops between the depacketizer and the writer).
    pub samples_dropped: AtomicU64,
    pub rtp_losses: AtomicU64,
    pub restarts: AtomicU64,
    /// Bumped on every rebuild; events stamped with an older generation
    /// are discarded by their consumers.
    pub generation: AtomicU64,
    state: AtomicU8,
    sfu_state: AtomicU8,
    /// Source-stream expiry as unix millis; 0 = no active stream.
    expires_at_ms: AtomicI64,
}

impl PipelineStats {
    pub fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_sfu_state(&self, state: SfuState) {
        self.sfu_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_expires_at(&self, expires_at: Option<DateTime<Utc>>) {
        let ms = expires_at.map(|t| t.timestamp_millis()).unwrap_or(0);
        self.expires_at_ms.store(ms, Ordering::Relaxed);
    }

    /// A rebuild starts a new generation: counters restart from zero and
    /// the restart total advances. Returns the new generation.
    pub fn begin_generation(&self) -> u64 {
        self.video_packets.store(0, Ordering::Relaxed);
        self.video_frames.store(0, Ordering::Relaxed);
        self.audio_packets.store(0, Ordering::Relaxed);
        self.audio_frames.store(0, Ordering::Relaxed);
        self.samples_dropped.store(0, Ordering::Relaxed);
        self.rtp_losses.store(0, Ordering::Relaxed);
        self.expires_at_ms.store(0, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self, camera_id: &str, display_name: &str) -> StatsSnapshot {
        let expires_ms = self.expires_at_ms.load(Ordering::Relaxed);
        let expires_in_secs = if expires_ms == 0 {
            None
        } else {
            Some((expires_ms - Utc::now().timestamp_millis()) / 1000)
        };
        StatsSnapshot {
            camera_id: camera_id.to_string(),
            display_name: display_name.to_string(),
            state: self.state().as_str(),
            sfu_state: SfuState::from_u8(self.sfu_state.load(Ordering::Relaxed)).as_str(),
            generation: self.generation.load(Ordering::Relaxed),
            video_packets: self.video_packets.load(Ordering::Relaxed),
            video_frames: self.video_frames.load(Ordering::Relaxed),
            audio_packets: self.audio_packets.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            rtp_losses: self.rtp_losses.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            expires_in_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub camera_id: String,
    pub display_name: String,
    pub state: &'static str,
    pub sfu_state: &'static str,
    pub generation: u64,
    pub video_packets: u64,
    pub video_frames: u64,
    pub audio_packets: u64,
    pub audio_frames: u64,
    pub samples_dropped: u64,
    pub rtp_losses: u64,
    pub restarts: u64,
    pub expires_in_secs: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_reset_clears_counters_and_bumps() {
        let stats = PipelineStats::default();
        stats.video_packets.fetch_add(10, Ordering::Relaxed);
        stats.video_frames.fetch_add(3, Ordering::Relaxed);
        stats.restarts.fetch_add(1, Ordering::Relaxed);

        let generation = stats.begin_generation();
        assert_eq!(generation, 1);
        let snap = stats.snapshot("cam", "Cam");
        assert_eq!(snap.video_packets, 0);
        assert_eq!(snap.video_frames, 0);
        // Restart total survives rebuilds.
        assert_eq!(snap.restarts, 1);
        assert_eq!(snap.generation, 1);

        assert_eq!(stats.begin_generation(), 2);
    }

    #[test]
    fn expiry_is_reported_relative() {
        let stats = PipelineStats::default();
        assert_eq!(stats.snapshot("c", "c").expires_in_secs, None);

        stats.set_expires_at(Some(Utc::now() + chrono::Duration::seconds(300)));
        let secs = stats.snapshot("c", "c").expires_in_secs.unwrap();
        assert!((298..=300).contains(&secs), "{secs}");
    }
}
