//! Source-stream lifetime management.
//!
//! A camera's RTSP URL lives for about five minutes. The lifetime manager
//! owns one [`SourceHandle`], extends it ahead of the deadline and swaps
//! the shared handle atomically; readers clone the inner `Arc` and never
//! block the writer. If the deadline passes without a successful
//! extension, exactly one rebuild event is emitted and the manager exits;
//! the pipeline restarts with a freshly generated stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::sdm::SdmClient;
use crate::stats::PipelineStats;

/// Renewal retry backoff bounds.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);

/// Bound on the best-effort StopRtspStream call.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The current short-lived stream grant for one camera.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub rtsp_url: String,
    pub stream_token: String,
    pub extension_token: String,
    pub expires_at: DateTime<Utc>,
    pub project_id: String,
    pub device_id: String,
}

/// Readers clone the inner `Arc`; the lifetime manager is the only writer
/// and publishes by swapping.
pub type SharedSource = Arc<RwLock<Arc<SourceHandle>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    RebuildRequired,
}

/// Mint a fresh stream for the camera.
pub async fn acquire(
    sdm: &SdmClient,
    project_id: &str,
    device_id: &str,
) -> Result<SourceHandle> {
    let grant = sdm.generate_stream(device_id).await?;
    let rtsp_url = grant.rtsp_url.unwrap_or_default();
    info!(
        device_id,
        expires_at = %grant.expires_at,
        "generated live stream"
    );
    Ok(SourceHandle {
        rtsp_url,
        stream_token: grant.stream_token,
        extension_token: grant.extension_token,
        expires_at: grant.expires_at,
        project_id: project_id.to_string(),
        device_id: device_id.to_string(),
    })
}

/// Best-effort StopRtspStream with a bounded deadline.
pub async fn stop(sdm: &SdmClient, handle: &SourceHandle) {
    let call = sdm.stop_stream(&handle.device_id, &handle.extension_token);
    match tokio::time::timeout(STOP_TIMEOUT, call).await {
        Ok(Ok(())) => debug!(device_id = %handle.device_id, "stream stopped"),
        Ok(Err(e)) => debug!(device_id = %handle.device_id, "stream stop failed: {e}"),
        Err(_) => debug!(device_id = %handle.device_id, "stream stop timed out"),
    }
}

/// `renew_at = expires_at - max(60 s, 0.25 x ttl)`.
fn renewal_margin(ttl: Duration) -> Duration {
    (ttl / 4).max(Duration::from_secs(60))
}

fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct LifetimeManager {
    sdm: Arc<SdmClient>,
    handle: SharedSource,
    stats: Arc<PipelineStats>,
    events: mpsc::Sender<SourceEvent>,
    cancel: watch::Receiver<bool>,
    /// Grant lifetime as observed at the last publication.
    ttl: Duration,
}

impl LifetimeManager {
    pub fn new(
        sdm: Arc<SdmClient>,
        handle: SharedSource,
        stats: Arc<PipelineStats>,
        events: mpsc::Sender<SourceEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            sdm,
            handle,
            stats,
            events,
            cancel,
            ttl: Duration::ZERO,
        }
    }

    pub async fn run(mut self) {
        {
            let current = self.handle.read().await.clone();
            self.ttl = until(current.expires_at);
            self.stats.set_expires_at(Some(current.expires_at));
        }

        loop {
            let expires_at = self.handle.read().await.expires_at;
            let renew_at = expires_at
                - chrono::Duration::from_std(renewal_margin(self.ttl))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));

            if !self.sleep_or_cancel(until(renew_at)).await {
                return;
            }

            if !self.renew_until_success_or_expiry(expires_at).await {
                return;
            }
        }
    }

    /// Extend the stream, retrying with backoff. Returns false when the
    /// manager should exit (deadline elapsed and the rebuild event was
    /// emitted, or cancellation).
    async fn renew_until_success_or_expiry(&mut self, expires_at: DateTime<Utc>) -> bool {
        let mut backoff = RETRY_BASE;
        loop {
            let current = self.handle.read().await.clone();
            match self
                .sdm
                .extend_stream(&current.device_id, &current.extension_token)
                .await
            {
                // A successful renewal must advance the deadline; one that
                // does not is useless and treated as a failed attempt.
                Ok(grant) if grant.expires_at > current.expires_at => {
                    let renewed = Arc::new(SourceHandle {
                        rtsp_url: current.rtsp_url.clone(),
                        stream_token: grant.stream_token,
                        extension_token: grant.extension_token,
                        expires_at: grant.expires_at,
                        project_id: current.project_id.clone(),
                        device_id: current.device_id.clone(),
                    });
                    self.ttl = until(grant.expires_at);
                    self.stats.set_expires_at(Some(grant.expires_at));
                    *self.handle.write().await = renewed;
                    debug!(
                        device_id = %current.device_id,
                        expires_at = %grant.expires_at,
                        "stream extended"
                    );
                    return true;
                }
                Ok(grant) => warn!(
                    device_id = %current.device_id,
                    old = %current.expires_at,
                    new = %grant.expires_at,
                    "extension did not advance expiry"
                ),
                Err(e) => warn!(device_id = %current.device_id, "extension failed: {e}"),
            }

            if Utc::now() >= expires_at {
                warn!(
                    device_id = %current.device_id,
                    "stream expired before renewal, requesting rebuild"
                );
                self.events.send(SourceEvent::RebuildRequired).await.ok();
                return false;
            }
            let wait = backoff.min(until(expires_at));
            if !self.sleep_or_cancel(wait).await {
                return false;
            }
            backoff = (backoff * 2).min(RETRY_CAP);
        }
    }

    /// Sleep, returning false if cancelled first.
    async fn sleep_or_cancel(&mut self, wait: Duration) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                changed = self.cancel.changed() => {
                    if changed.is_err() || *self.cancel.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenCache;
    use crate::config::Config;
    use crate::testutil::spawn_http;

    fn test_config() -> Config {
        Config {
            client_id: "cid".into(),
            client_secret: "cs".into(),
            project_id: "proj".into(),
            refresh_token: "rt".into(),
            app_id: "app".into(),
            api_token: "at".into(),
        }
    }

    async fn scripted_sdm(responses: Vec<(u16, String)>) -> Arc<SdmClient> {
        let mut all = vec![(200, r#"{"access_token":"tok","expires_in":3600}"#.to_string())];
        all.extend(responses);
        let (base, _exchanges) = spawn_http(all).await;
        let http = reqwest::Client::new();
        let tokens = Arc::new(TokenCache::with_endpoint(http.clone(), &test_config(), &base));
        Arc::new(SdmClient::with_endpoint(http, tokens, "proj", &base))
    }

    fn handle_expiring_in(ms: i64) -> SourceHandle {
        SourceHandle {
            rtsp_url: "rtsps://stream.example/cam?auth=tok".into(),
            stream_token: "g.0.tok".into(),
            extension_token: "ext.1".into(),
            expires_at: Utc::now() + chrono::Duration::milliseconds(ms),
            project_id: "proj".into(),
            device_id: "cam-1".into(),
        }
    }

    #[test]
    fn margin_is_quarter_ttl_with_a_minute_floor() {
        assert_eq!(
            renewal_margin(Duration::from_secs(300)),
            Duration::from_secs(75)
        );
        assert_eq!(
            renewal_margin(Duration::from_secs(240)),
            Duration::from_secs(60)
        );
        assert_eq!(
            renewal_margin(Duration::from_secs(30)),
            Duration::from_secs(60)
        );
        assert_eq!(renewal_margin(Duration::ZERO), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn successful_renewal_swaps_handle_and_advances_expiry() {
        let future_expiry = Utc::now() + chrono::Duration::seconds(300);
        let extend_body = format!(
            r#"{{"results":{{"streamToken":"g.0.tok2","streamExtensionToken":"ext.2",
                "expiresAt":"{}"}}}}"#,
            future_expiry.to_rfc3339()
        );
        let sdm = scripted_sdm(vec![(200, extend_body)]).await;

        // Expires almost immediately, so renewal is due at once.
        let initial = handle_expiring_in(200);
        let old_expiry = initial.expires_at;
        let shared: SharedSource = Arc::new(RwLock::new(Arc::new(initial)));
        let stats = Arc::new(PipelineStats::default());
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let manager = LifetimeManager::new(
            Arc::clone(&sdm),
            Arc::clone(&shared),
            stats,
            events_tx,
            cancel_rx,
        );
        let task = tokio::spawn(manager.run());

        // Wait for the swap to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let current = shared.read().await.clone();
                if current.extension_token == "ext.2" {
                    assert!(current.expires_at > old_expiry);
                    assert_eq!(current.stream_token, "g.0.tok2");
                    // The URL never changes on extension.
                    assert_eq!(current.rtsp_url, "rtsps://stream.example/cam?auth=tok");
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "renewal never published"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(events_rx.try_recv().is_err(), "no rebuild expected");
        cancel_tx.send(true).ok();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn deadline_elapse_emits_exactly_one_rebuild() {
        // Every extension attempt fails with a server error.
        let sdm = scripted_sdm(vec![
            (500, r#"{"error":"boom"}"#.to_string()),
            (500, r#"{"error":"boom"}"#.to_string()),
            (500, r#"{"error":"boom"}"#.to_string()),
        ])
        .await;

        let shared: SharedSource = Arc::new(RwLock::new(Arc::new(handle_expiring_in(150))));
        let stats = Arc::new(PipelineStats::default());
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let manager =
            LifetimeManager::new(sdm, shared, stats, events_tx, cancel_rx);
        let task = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("rebuild event in time")
            .expect("event present");
        assert_eq!(event, SourceEvent::RebuildRequired);

        // The manager exits after the single event; the channel closes.
        task.await.unwrap();
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn non_advancing_expiry_is_a_failed_attempt() {
        let stale_expiry = Utc::now() - chrono::Duration::seconds(10);
        let extend_body = format!(
            r#"{{"results":{{"streamToken":"g.0.tok2","streamExtensionToken":"ext.2",
                "expiresAt":"{}"}}}}"#,
            stale_expiry.to_rfc3339()
        );
        let sdm = scripted_sdm(vec![(200, extend_body)]).await;

        let shared: SharedSource = Arc::new(RwLock::new(Arc::new(handle_expiring_in(150))));
        let stats = Arc::new(PipelineStats::default());
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let manager = LifetimeManager::new(
            sdm,
            Arc::clone(&shared),
            stats,
            events_tx,
            cancel_rx,
        );
        let task = tokio::spawn(manager.run());

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("rebuild event in time")
            .expect("event present");
        assert_eq!(event, SourceEvent::RebuildRequired);
        // The stale grant was never published.
        assert_eq!(shared.read().await.extension_token, "ext.1");
        task.await.unwrap();
    }
}
