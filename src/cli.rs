//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ClaraVerse companion bridge
#[derive(Parser, Debug)]
#[command(name = "clara-companion")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, env = "CLARA_COMPANION_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "CLARA_COMPANION_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true, env = "CLARA_COMPANION_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// What to do
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Log in to the ClaraVerse cloud and register this device
    Login {
        /// Account email (prompted when omitted)
        #[arg(long)]
        email: Option<String>,
    },
    /// Run the bridge in the foreground
    Start,
    /// Show the running bridge's status
    Status {
        /// Print the raw status payload as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a tool provider
    Add {
        /// Provider name
        name: String,
        /// Executable (or a full command line when no args are given)
        command: String,
        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Remove a tool provider
    Remove {
        /// Provider name
        name: String,
    },
    /// Enable or disable a tool provider
    Toggle {
        /// Provider name
        name: String,
        /// Desired state; omitted flips the current one
        #[arg(value_parser = ["on", "off"])]
        state: Option<String>,
    },
    /// List configured providers
    List,
    /// Manage the background service
    Service {
        /// Service operation
        #[command(subcommand)]
        action: ServiceAction,
    },
    /// Manage registered devices
    Devices {
        /// Device operation
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Drop cached credentials and revoke this device
    Logout,
}

/// `service` operations
#[derive(Subcommand, Debug)]
pub enum ServiceAction {
    /// Write and enable the service definition
    Install,
    /// Disable and remove the service definition
    Uninstall,
    /// Start the installed service
    Start,
    /// Stop the installed service
    Stop,
    /// Show the service manager's status
    Status,
}

/// `devices` operations
#[derive(Subcommand, Debug)]
pub enum DeviceAction {
    /// List registered devices
    List,
    /// Rename a device
    Rename {
        /// Device id
        id: String,
        /// New display name
        name: String,
    },
    /// Revoke a device's credentials
    Revoke {
        /// Device id
        id: String,
    },
}
