//! Smart Device Management REST client: camera enumeration and the
//! CameraLiveStream commands that mint, extend and stop RTSP URLs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::auth::TokenCache;
use crate::error::{RelayError, Result};

pub const SDM_ENDPOINT: &str = "https://smartdevicemanagement.googleapis.com/v1";

const CAMERA_LIVE_STREAM_TRAIT: &str = "sdm.devices.traits.CameraLiveStream";
const INFO_TRAIT: &str = "sdm.devices.traits.Info";

pub struct SdmClient {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    tokens: Arc<TokenCache>,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub device_id: String,
    pub display_name: String,
}

/// One minted (or extended) live stream. `rtsp_url` is present only on
/// GenerateRtspStream; ExtendRtspStream rotates the tokens and deadline.
#[derive(Debug, Clone)]
pub struct StreamGrant {
    pub rtsp_url: Option<String>,
    pub stream_token: String,
    pub extension_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct Device {
    name: String,
    #[serde(default)]
    traits: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResponse {
    results: Option<CommandResults>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResults {
    stream_urls: Option<StreamUrls>,
    stream_token: Option<String>,
    stream_extension_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamUrls {
    rtsp_url: Option<String>,
}

/// Strictly validate `enterprises/{p}/devices/{d}` and return `{d}`.
/// Malformed names are rejected, never guessed at.
pub fn extract_device_id(name: &str) -> Result<&str> {
    let parts: Vec<&str> = name.split('/').collect();
    match parts.as_slice() {
        ["enterprises", project, "devices", device]
            if !project.is_empty() && !device.is_empty() =>
        {
            Ok(*device)
        }
        _ => Err(RelayError::Protocol(format!(
            "device name {name:?} does not match enterprises/{{p}}/devices/{{d}}"
        ))),
    }
}

impl SdmClient {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenCache>, project_id: &str) -> Self {
        Self::with_endpoint(http, tokens, project_id, SDM_ENDPOINT)
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        tokens: Arc<TokenCache>,
        project_id: &str,
        endpoint: &str,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            tokens,
        }
    }

    /// Devices advertising the CameraLiveStream trait, in listing order.
    pub async fn list_cameras(&self) -> Result<Vec<Camera>> {
        let url = format!("{}/enterprises/{}/devices", self.endpoint, self.project_id);
        let bearer = self.tokens.bearer().await?;
        let response = self.http.get(&url).bearer_auth(bearer).send().await?;
        let list: DeviceList = check_status(response).await?.json().await
            .map_err(|e| RelayError::Protocol(format!("bad device list: {e}")))?;

        let mut cameras = Vec::new();
        for device in list.devices {
            if device.traits.get(CAMERA_LIVE_STREAM_TRAIT).is_none() {
                continue;
            }
            let device_id = extract_device_id(&device.name)?.to_string();
            let display_name = device
                .traits
                .get(INFO_TRAIT)
                .and_then(|info| info.get("customName"))
                .and_then(|n| n.as_str())
                .filter(|n| !n.is_empty())
                .unwrap_or(&device_id)
                .to_string();
            cameras.push(Camera {
                device_id,
                display_name,
            });
        }
        Ok(cameras)
    }

    pub async fn generate_stream(&self, device_id: &str) -> Result<StreamGrant> {
        let grant = self
            .execute_command(
                device_id,
                "sdm.devices.commands.CameraLiveStream.GenerateRtspStream",
                json!({}),
            )
            .await?;
        if grant.rtsp_url.is_none() {
            return Err(RelayError::Protocol(
                "GenerateRtspStream response carried no rtspUrl".into(),
            ));
        }
        Ok(grant)
    }

    pub async fn extend_stream(
        &self,
        device_id: &str,
        extension_token: &str,
    ) -> Result<StreamGrant> {
        self.execute_command(
            device_id,
            "sdm.devices.commands.CameraLiveStream.ExtendRtspStream",
            json!({ "streamExtensionToken": extension_token }),
        )
        .await
    }

    pub async fn stop_stream(&self, device_id: &str, extension_token: &str) -> Result<()> {
        let url = self.command_url(device_id);
        let bearer = self.tokens.bearer().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&json!({
                "command": "sdm.devices.commands.CameraLiveStream.StopRtspStream",
                "params": { "streamExtensionToken": extension_token },
            }))
            .send()
            .await?;
        check_status(response).await?;
        debug!(device_id, "live stream stopped");
        Ok(())
    }

    async fn execute_command(
        &self,
        device_id: &str,
        command: &str,
        params: serde_json::Value,
    ) -> Result<StreamGrant> {
        let url = self.command_url(device_id);
        let bearer = self.tokens.bearer().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(bearer)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await?;
        let parsed: CommandResponse = check_status(response).await?.json().await
            .map_err(|e| RelayError::Protocol(format!("bad {command} response: {e}")))?;

        let results = parsed.results.ok_or_else(|| {
            RelayError::Protocol(format!("{command} response carried no results"))
        })?;
        let stream_token = results.stream_token.ok_or_else(|| {
            RelayError::Protocol(format!("{command} response carried no streamToken"))
        })?;
        let extension_token = results.stream_extension_token.ok_or_else(|| {
            RelayError::Protocol(format!(
                "{command} response carried no streamExtensionToken"
            ))
        })?;
        let expires_at = results.expires_at.ok_or_else(|| {
            RelayError::Protocol(format!("{command} response carried no expiresAt"))
        })?;
        Ok(StreamGrant {
            rtsp_url: results.stream_urls.and_then(|u| u.rtsp_url),
            stream_token,
            extension_token,
            expires_at,
        })
    }

    fn command_url(&self, device_id: &str) -> String {
        format!(
            "{}/enterprises/{}/devices/{}:executeCommand",
            self.endpoint, self.project_id, device_id
        )
    }
}

/// Map HTTP refusals onto the error taxonomy: 401/403 are identity
/// problems, other failures are the remote's.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        Err(RelayError::Auth(format!("device cloud refused: {status}: {body}")))
    } else if status.is_server_error() {
        Err(RelayError::Transport(format!("device cloud error: {status}: {body}")))
    } else {
        Err(RelayError::Protocol(format!("device cloud rejected request: {status}: {body}")))
    }
}
