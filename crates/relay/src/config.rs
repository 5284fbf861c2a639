//! Flat `key=value` configuration file, `#` for comments, values
//! percent-decoded best-effort (an invalid escape is kept literally).
//! All six keys are required; anything missing is fatal at startup.

use std::path::Path;

use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// OAuth2 client credentials for the device cloud.
    pub client_id: String,
    pub client_secret: String,
    /// Device Access project id.
    pub project_id: String,
    pub refresh_token: String,
    /// Cloudflare Calls application id and API token.
    pub app_id: String,
    pub api_token: String,
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        RelayError::Config(format!("cannot read {}: {e}", path.display()))
    })?;
    let config = parse(&contents)?;
    tracing::info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

pub fn parse(contents: &str) -> Result<Config> {
    let mut client_id = None;
    let mut client_secret = None;
    let mut project_id = None;
    let mut refresh_token = None;
    let mut app_id = None;
    let mut api_token = None;

    for (lineno, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            RelayError::Config(format!("line {}: expected key=value", lineno + 1))
        })?;
        let value = percent_decode(value.trim());
        match key.trim() {
            "client_id" => client_id = Some(value),
            "client_secret" => client_secret = Some(value),
            "project_id" => project_id = Some(value),
            "refresh_token" => refresh_token = Some(value),
            "app_id" => app_id = Some(value),
            "api_token" => api_token = Some(value),
            other => tracing::warn!(key = other, "ignoring unknown config key"),
        }
    }

    let require = |name: &str, v: Option<String>| {
        v.ok_or_else(|| RelayError::Config(format!("missing required key {name:?}")))
    };
    Ok(Config {
        client_id: require("client_id", client_id)?,
        client_secret: require("client_secret", client_secret)?,
        project_id: require("project_id", project_id)?,
        refresh_token: require("refresh_token", refresh_token)?,
        app_id: require("app_id", app_id)?,
        api_token: require("api_token", api_token)?,
    })
}

/// Render a config back to the file format, percent-encoding the
/// characters the parser treats specially, so `parse(serialize(c)) == c`.
#[cfg(test)]
fn serialize(config: &Config) -> String {
    let entries = [
        ("client_id", &config.client_id),
        ("client_secret", &config.client_secret),
        ("project_id", &config.project_id),
        ("refresh_token", &config.refresh_token),
        ("app_id", &config.app_id),
        ("api_token", &config.api_token),
    ];
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(key);
        out.push('=');
        out.push_str(&percent_encode(value));
        out.push('\n');
    }
    out
}

/// Best-effort percent decoding: a malformed escape stays literal.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).copied().and_then(hex_val),
                bytes.get(i + 2).copied().and_then(hex_val),
            ) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' | '=' | '#' | '\r' | '\n' => out.push_str(&format!("%{:02X}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}
