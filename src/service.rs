//! Background service management
//!
//! Installs the bridge as a user-level service: a systemd user unit on
//! Linux, a launchd agent on macOS. Windows users run `start` in a terminal
//! or use the Task Scheduler manually.

#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::path::PathBuf;
#[cfg(any(target_os = "linux", target_os = "macos"))]
use std::process::Command;

use crate::{Error, Result};

#[cfg(target_os = "linux")]
const SERVICE_NAME: &str = "clara-companion";
#[cfg(target_os = "macos")]
const LAUNCHD_LABEL: &str = "ai.claraverse.companion";

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn current_exe() -> Result<PathBuf> {
    std::env::current_exe().map_err(|e| Error::Internal(format!("cannot resolve binary: {e}")))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_manager(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .status()
        .map_err(|e| Error::Internal(format!("{program}: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "{program} {} exited with {status}",
            args.join(" ")
        )))
    }
}

#[cfg(target_os = "linux")]
fn unit_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("no user config directory".to_string()))?;
    Ok(config_dir
        .join("systemd")
        .join("user")
        .join(format!("{SERVICE_NAME}.service")))
}

#[cfg(target_os = "macos")]
fn plist_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| Error::Config("no home directory".to_string()))?;
    Ok(home
        .join("Library")
        .join("LaunchAgents")
        .join(format!("{LAUNCHD_LABEL}.plist")))
}

/// Write the service definition and enable it.
pub fn install() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let exe = current_exe()?;
        let unit = format!(
            "[Unit]\n\
             Description=ClaraVerse companion bridge\n\
             After=network-online.target\n\n\
             [Service]\n\
             ExecStart={} start\n\
             Restart=on-failure\n\
             RestartSec=5\n\n\
             [Install]\n\
             WantedBy=default.target\n",
            exe.display()
        );
        let path = unit_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, unit)?;
        run_manager("systemctl", &["--user", "daemon-reload"])?;
        run_manager("systemctl", &["--user", "enable", SERVICE_NAME])?;
        println!("Installed {}.", path.display());
        Ok(())
    }
    #[cfg(target_os = "macos")]
    {
        let exe = current_exe()?;
        let plist = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
             \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
             <plist version=\"1.0\">\n<dict>\n\
             \t<key>Label</key><string>{LAUNCHD_LABEL}</string>\n\
             \t<key>ProgramArguments</key>\n\t<array>\n\
             \t\t<string>{}</string>\n\t\t<string>start</string>\n\t</array>\n\
             \t<key>RunAtLoad</key><true/>\n\
             \t<key>KeepAlive</key><true/>\n\
             </dict>\n</plist>\n",
            exe.display()
        );
        let path = plist_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, plist)?;
        println!("Installed {}.", path.display());
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Config(
            "service install is supported on Linux and macOS only".to_string(),
        ))
    }
}

/// Stop the service and remove its definition.
pub fn uninstall() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let _ = run_manager("systemctl", &["--user", "stop", SERVICE_NAME]);
        let _ = run_manager("systemctl", &["--user", "disable", SERVICE_NAME]);
        let path = unit_path()?;
        let _ = std::fs::remove_file(&path);
        let _ = run_manager("systemctl", &["--user", "daemon-reload"]);
        println!("Uninstalled.");
        Ok(())
    }
    #[cfg(target_os = "macos")]
    {
        let path = plist_path()?;
        let _ = run_manager("launchctl", &["unload", &path.display().to_string()]);
        let _ = std::fs::remove_file(&path);
        println!("Uninstalled.");
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Config(
            "service uninstall is supported on Linux and macOS only".to_string(),
        ))
    }
}

/// Start the installed service.
pub fn start() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        run_manager("systemctl", &["--user", "start", SERVICE_NAME])
    }
    #[cfg(target_os = "macos")]
    {
        let path = plist_path()?;
        run_manager("launchctl", &["load", &path.display().to_string()])
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Config(
            "service start is supported on Linux and macOS only".to_string(),
        ))
    }
}

/// Stop the installed service.
pub fn stop() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        run_manager("systemctl", &["--user", "stop", SERVICE_NAME])
    }
    #[cfg(target_os = "macos")]
    {
        let path = plist_path()?;
        run_manager("launchctl", &["unload", &path.display().to_string()])
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Config(
            "service stop is supported on Linux and macOS only".to_string(),
        ))
    }
}

/// Show the service manager's view of the bridge.
pub fn status() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        run_manager("systemctl", &["--user", "status", "--no-pager", SERVICE_NAME])
    }
    #[cfg(target_os = "macos")]
    {
        run_manager("launchctl", &["list", LAUNCHD_LABEL])
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(Error::Config(
            "service status is supported on Linux and macOS only".to_string(),
        ))
    }
}
