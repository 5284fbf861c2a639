//! Fleet-level lifecycle: one pipeline task per camera, bounded startup
//! concurrency, aggregate statistics and bounded-grace shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pipeline::Pipeline;
use crate::stats::{PipelineStats, StatsSnapshot};

/// Default bound on concurrent pipeline (re)starts. Keeps initial
/// bring-up from bursting the SFU control plane and the token endpoint.
pub const DEFAULT_STARTUP_LIMIT: usize = 4;

/// How long pipelines get to stop cooperatively before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct PipelineHandle {
    camera_id: String,
    display_name: String,
    stats: Arc<PipelineStats>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    pipelines: Vec<PipelineHandle>,
    shutdown_tx: watch::Sender<bool>,
}

impl Supervisor {
    /// Spawn every pipeline. Startups are gated by a semaphore of
    /// `startup_limit` permits shared across the fleet.
    pub fn start(pipelines: Vec<Pipeline>, startup_limit: usize) -> Supervisor {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let startups = Arc::new(Semaphore::new(startup_limit.max(1)));

        let handles = pipelines
            .into_iter()
            .map(|pipeline| {
                let camera_id = pipeline.camera_id.clone();
                let display_name = pipeline.display_name.clone();
                let stats = Arc::clone(&pipeline.stats);
                let task = tokio::spawn(
                    pipeline.run(shutdown_rx.clone(), Arc::clone(&startups)),
                );
                PipelineHandle {
                    camera_id,
                    display_name,
                    stats,
                    task,
                }
            })
            .collect::<Vec<_>>();

        info!(
            cameras = handles.len(),
            startup_limit,
            "supervisor started"
        );
        Supervisor {
            pipelines: handles,
            shutdown_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Best-effort-consistent counters for every pipeline.
    pub fn snapshot(&self) -> Vec<StatsSnapshot> {
        self.pipelines
            .iter()
            .map(|p| p.stats.snapshot(&p.camera_id, &p.display_name))
            .collect()
    }

    /// Signal every pipeline, wait up to the grace period for cooperative
    /// termination, then abort whatever is left.
    pub async fn shutdown(mut self) {
        info!("stopping all pipelines");
        self.shutdown_tx.send(true).ok();

        let drain = async {
            for handle in self.pipelines.iter_mut() {
                (&mut handle.task).await.ok();
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            for handle in &self.pipelines {
                if !handle.task.is_finished() {
                    warn!(camera = %handle.camera_id, "pipeline missed shutdown grace, aborting");
                    handle.task.abort();
                }
            }
        }
        info!("supervisor stopped");
    }
}
