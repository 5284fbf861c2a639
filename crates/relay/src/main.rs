mod auth;
mod config;
mod error;
mod pipeline;
mod sdm;
mod sfu;
mod source;
mod stats;
mod supervisor;
#[cfg(test)]
mod testutil;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::TokenCache;
use crate::pipeline::Pipeline;
use crate::sdm::SdmClient;
use crate::sfu::CallsConfig;
use crate::supervisor::{DEFAULT_STARTUP_LIMIT, Supervisor};

/// Deadline attached to every outbound HTTP call.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

struct Args {
    config_path: PathBuf,
    startup_limit: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("./config/camrelay.conf");
    let mut startup_limit = DEFAULT_STARTUP_LIMIT;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-V" | "--version" => {
                println!("camrelay {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("camrelay - relay cloud cameras to a WebRTC SFU");
                println!();
                println!("USAGE:");
                println!("    camrelay [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <PATH>          Config file [default: ./config/camrelay.conf]");
                println!("    --startup-limit <N>          Concurrent pipeline startups [default: 4]");
                println!("    -V, --version                Print version and exit");
                println!("    -h, --help                   Print this help and exit");
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                config_path = args
                    .get(i)
                    .map(PathBuf::from)
                    .context("Missing --config value")?;
            }
            "--startup-limit" => {
                i += 1;
                startup_limit = args
                    .get(i)
                    .context("Missing --startup-limit value")?
                    .parse()
                    .context("Invalid --startup-limit value")?;
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }

    Ok(Args {
        config_path,
        startup_limit,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (TLS to the device cloud and SFU)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;

    let config = match config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    // Auth at startup is the one remote call allowed to kill the process.
    let tokens = Arc::new(TokenCache::new(http.clone(), &config));
    if let Err(e) = tokens.bearer().await {
        error!("startup authentication failed: {e}");
        std::process::exit(1);
    }

    let sdm = Arc::new(SdmClient::new(http.clone(), tokens, &config.project_id));
    let cameras = match sdm.list_cameras().await {
        Ok(cameras) => cameras,
        Err(e) => {
            error!("camera enumeration failed: {e}");
            std::process::exit(1);
        }
    };
    for camera in &cameras {
        info!(
            camera = %camera.device_id,
            name = %camera.display_name,
            "discovered camera"
        );
    }

    let calls = CallsConfig::new(&config.app_id, &config.api_token);
    let pipelines = cameras
        .iter()
        .map(|camera| {
            Pipeline::new(
                camera.device_id.clone(),
                camera.display_name.clone(),
                config.project_id.clone(),
                Arc::clone(&sdm),
                calls.clone(),
                http.clone(),
            )
        })
        .collect();
    let supervisor = Supervisor::start(pipelines, args.startup_limit);
    if supervisor.is_empty() {
        warn!("no cameras advertise a live stream; nothing to relay");
    } else {
        info!(cameras = supervisor.len(), "camrelay running");
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
    stats_ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = stats_ticker.tick() => {
                log_stats(&supervisor);
            }
        }
    }

    supervisor.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn log_stats(supervisor: &Supervisor) {
    for snap in supervisor.snapshot() {
        info!(
            camera = %snap.camera_id,
            state = snap.state,
            sfu = snap.sfu_state,
            generation = snap.generation,
            video_packets = snap.video_packets,
            video_frames = snap.video_frames,
            audio_packets = snap.audio_packets,
            audio_frames = snap.audio_frames,
            dropped = snap.samples_dropped,
            losses = snap.rtp_losses,
            restarts = snap.restarts,
            expires_in_secs = snap.expires_in_secs,
            "pipeline stats"
        );
    }
}
