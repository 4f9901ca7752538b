//! Account surface: login, logout, device management
//!
//! All of this speaks plain HTTP to the cloud API base; nothing here touches
//! the persistent WebSocket.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{TokenManager, TokenSnapshot};
use crate::config::Config;
use crate::{Error, Result};

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Serialize)]
struct DeviceRegisterRequest<'a> {
    name: &'a str,
    platform: &'a str,
}

#[derive(Deserialize)]
struct DeviceRegisterResponse {
    device_id: String,
}

/// One registered device as reported by the cloud.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Device identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Operating system tag
    #[serde(default)]
    pub platform: String,
    /// Last time the device connected
    #[serde(default)]
    pub last_seen: Option<String>,
}

#[derive(Deserialize)]
struct DeviceListResponse {
    devices: Vec<Device>,
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Internal(format!("HTTP client: {e}")))
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Interactive login: exchange credentials for a token pair, register this
/// machine as a device, and persist everything.
pub async fn login(config_path: &Path, email: Option<String>) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;

    let email = match email {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = prompt("Password (input is not hidden): ")?;
    if email.is_empty() || password.is_empty() {
        return Err(Error::Auth("email and password are required".to_string()));
    }

    let client = http_client()?;
    let api_base = config.cloud.api_base.trim_end_matches('/').to_string();

    let response = client
        .post(format!("{api_base}/api/auth/login"))
        .json(&LoginRequest {
            email: &email,
            password: &password,
        })
        .send()
        .await?;
    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::Auth("invalid credentials".to_string()));
    }
    if !status.is_success() {
        return Err(Error::Transport(format!("login failed: HTTP {status}")));
    }
    let tokens: LoginResponse = response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("bad login response: {e}")))?;

    // Register this machine so the cloud can tell devices apart. Older
    // deployments without the endpoint still work token-only.
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    let device_id = match client
        .post(format!("{api_base}/api/auth/device/register"))
        .bearer_auth(&tokens.access_token)
        .json(&DeviceRegisterRequest {
            name: &host,
            platform: std::env::consts::OS,
        })
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response
            .json::<DeviceRegisterResponse>()
            .await
            .map(|r| Some(r.device_id))
            .unwrap_or(None),
        Ok(response) => {
            debug!(status = %response.status(), "device registration unavailable");
            None
        }
        Err(e) => {
            debug!(error = %e, "device registration unavailable");
            None
        }
    };

    config.auth.access_token = tokens.access_token;
    config.auth.refresh_token = tokens.refresh_token;
    config.auth.expires_at = chrono::Utc::now().timestamp() + tokens.expires_in.max(0);
    config.auth.device_id = device_id.clone();
    config.save(config_path)?;

    match device_id {
        Some(id) => println!("Logged in as {email} (device {id})."),
        None => println!("Logged in as {email}."),
    }
    Ok(())
}

/// Revoke this device (best effort) and drop the cached credentials.
pub async fn logout(config_path: &Path) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if !config.auth.is_logged_in() {
        println!("Not logged in.");
        return Ok(());
    }

    if let Some(device_id) = config.auth.device_id.clone() {
        let client = http_client()?;
        let api_base = config.cloud.api_base.trim_end_matches('/').to_string();
        let revoked = client
            .delete(format!("{api_base}/api/devices/{device_id}"))
            .bearer_auth(&config.auth.access_token)
            .send()
            .await;
        if let Err(e) = revoked {
            warn!(error = %e, "device revoke failed, clearing credentials anyway");
        }
    }

    config.auth.clear();
    config.save(config_path)?;
    println!("Logged out.");
    Ok(())
}

/// A refresh-if-needed access token for one-shot API calls.
async fn fresh_access_token(config: &mut Config, config_path: &Path) -> Result<String> {
    if !config.auth.is_logged_in() {
        return Err(Error::Auth(
            "no credentials - run 'clara-companion login' first".to_string(),
        ));
    }
    let manager = TokenManager::new(
        &config.cloud.api_base,
        TokenSnapshot::from(config.auth.clone()),
        Box::new(|_| {}),
    )?;
    if manager.expiring_within(Duration::from_secs(60)) {
        let rotated = manager.refresh().await.map_err(Error::from)?;
        config.auth = (&rotated).into();
        config.save(config_path)?;
    }
    Ok(manager.current().access_token)
}

/// Print all registered devices.
pub async fn devices_list(config_path: &Path) -> Result<()> {
    let mut config = Config::load(config_path)?;
    let token = fresh_access_token(&mut config, config_path).await?;
    let api_base = config.cloud.api_base.trim_end_matches('/');

    let response = http_client()?
        .get(format!("{api_base}/api/devices"))
        .bearer_auth(&token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "device list failed: HTTP {}",
            response.status()
        )));
    }
    let list: DeviceListResponse = response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("bad device list: {e}")))?;

    if list.devices.is_empty() {
        println!("No devices registered.");
        return Ok(());
    }
    let this_device = config.auth.device_id.as_deref();
    for device in &list.devices {
        let marker = if Some(device.id.as_str()) == this_device {
            " (this device)"
        } else {
            ""
        };
        let last_seen = device.last_seen.as_deref().unwrap_or("never");
        println!(
            "{}  {}  {}  last seen {}{}",
            device.id, device.name, device.platform, last_seen, marker
        );
    }
    Ok(())
}

/// Rename a device.
pub async fn devices_rename(config_path: &Path, id: &str, name: &str) -> Result<()> {
    let mut config = Config::load(config_path)?;
    let token = fresh_access_token(&mut config, config_path).await?;
    let api_base = config.cloud.api_base.trim_end_matches('/');

    let response = http_client()?
        .post(format!("{api_base}/api/devices/{id}/rename"))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "name": name }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "rename failed: HTTP {}",
            response.status()
        )));
    }
    println!("Renamed {id} to {name}.");
    Ok(())
}

/// Revoke a device. Revoking the current device also clears local
/// credentials.
pub async fn devices_revoke(config_path: &Path, id: &str) -> Result<()> {
    let mut config = Config::load(config_path)?;
    let token = fresh_access_token(&mut config, config_path).await?;
    let api_base = config.cloud.api_base.trim_end_matches('/');

    let response = http_client()?
        .delete(format!("{api_base}/api/devices/{id}"))
        .bearer_auth(&token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "revoke failed: HTTP {}",
            response.status()
        )));
    }

    if config.auth.device_id.as_deref() == Some(id) {
        config.auth.clear();
        config.save(config_path)?;
        println!("Revoked {id}; local credentials cleared.");
    } else {
        println!("Revoked {id}.");
    }
    Ok(())
}
