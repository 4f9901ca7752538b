//! CLI command bodies that talk to a running bridge
//!
//! `status` and `list` read the local endpoint; `add`, `remove`, and
//! `toggle` prefer the running bridge (so the change applies immediately)
//! and fall back to editing the configuration file when it is down.

use std::path::Path;

use crate::config::{Config, ProviderConfig};
use crate::control::client::LocalClient;
use crate::control::probe;
use crate::protocol::{
    AddServerPayload, LocalFrame, RemoveServerPayload, StatusPayload, ToggleServerPayload,
};
use crate::{Error, Result};

/// `status`: print the running bridge's snapshot.
pub async fn status(json: bool) -> Result<()> {
    let mut client = LocalClient::connect().await?;
    let status = client.wait_status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        render_status(&status);
    }
    Ok(())
}

fn render_status(status: &StatusPayload) {
    println!("clara-companion {} (up {}s)", status.version, status.uptime_secs);
    if status.connection == "auth_failed" {
        println!("cloud: auth failed - re-login required");
    } else {
        println!("cloud: {} ({})", status.connection, status.cloud_url);
    }
    if let Some(device) = &status.device_id {
        println!("device: {device}");
    }
    if status.providers.is_empty() {
        println!("providers: none configured");
        return;
    }
    println!("providers:");
    for provider in &status.providers {
        let state = match (provider.enabled, provider.running) {
            (true, true) => format!("running, {} tools", provider.tools),
            (true, false) if provider.error.is_empty() => "not running".to_string(),
            (true, false) => format!("not running ({})", provider.error),
            (false, _) => "disabled".to_string(),
        };
        println!("  {:<20} {state}", provider.name);
    }
}

/// `add`: register a provider, live when possible.
pub async fn add(
    config_path: &Path,
    name: String,
    command: String,
    args: Vec<String>,
) -> Result<()> {
    let payload = AddServerPayload {
        request_id: String::new(),
        name: name.clone(),
        description: String::new(),
        command,
        args,
        enabled: true,
    };

    if probe().await {
        let mut client = LocalClient::connect().await?;
        client.request_ok(&LocalFrame::AddServer(payload)).await?;
        println!("Added provider {name}.");
        return Ok(());
    }

    let mut config = Config::load_or_default(config_path)?;
    if config.provider(&name).is_some() {
        return Err(Error::Config(format!("provider {name} already exists")));
    }
    config.providers.push(ProviderConfig {
        name: name.clone(),
        description: payload.description,
        command: payload.command,
        args: payload.args,
        transport: "stdio".to_string(),
        enabled: true,
    });
    config.save(config_path)?;
    println!("Added provider {name} (bridge not running; applies on next start).");
    Ok(())
}

/// `remove`: drop a provider, live when possible.
pub async fn remove(config_path: &Path, name: String) -> Result<()> {
    if probe().await {
        let mut client = LocalClient::connect().await?;
        client
            .request_ok(&LocalFrame::RemoveServer(RemoveServerPayload {
                request_id: String::new(),
                name: name.clone(),
            }))
            .await?;
        println!("Removed provider {name}.");
        return Ok(());
    }

    let mut config = Config::load(config_path)?;
    if config.provider(&name).is_none() {
        return Err(Error::Config(format!("no such provider: {name}")));
    }
    config.providers.retain(|p| p.name != name);
    config.save(config_path)?;
    println!("Removed provider {name}.");
    Ok(())
}

/// `toggle`: enable/disable a provider, live when possible.
pub async fn toggle(config_path: &Path, name: String, state: Option<String>) -> Result<()> {
    let enabled = state.as_deref().map(|s| s == "on");

    if probe().await {
        let mut client = LocalClient::connect().await?;
        client
            .request_ok(&LocalFrame::ToggleServer(ToggleServerPayload {
                request_id: String::new(),
                name: name.clone(),
                enabled,
            }))
            .await?;
        println!("Toggled provider {name}.");
        return Ok(());
    }

    let mut config = Config::load(config_path)?;
    let Some(provider) = config.provider_mut(&name) else {
        return Err(Error::Config(format!("no such provider: {name}")));
    };
    provider.enabled = enabled.unwrap_or(!provider.enabled);
    let now_enabled = provider.enabled;
    config.save(config_path)?;
    println!(
        "Provider {name} is now {}.",
        if now_enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// `list`: show configured providers, with live state when available.
pub async fn list(config_path: &Path) -> Result<()> {
    if probe().await {
        let mut client = LocalClient::connect().await?;
        let status = client.wait_status().await?;
        render_status(&status);
        return Ok(());
    }

    let config = Config::load_or_default(config_path)?;
    if config.providers.is_empty() {
        println!("No providers configured.");
        return Ok(());
    }
    for provider in &config.providers {
        println!(
            "{:<20} {} {}  [{}]",
            provider.name,
            provider.command,
            provider.args.join(" "),
            if provider.enabled { "enabled" } else { "disabled" }
        );
    }
    Ok(())
}
