//! Local endpoint locations
//!
//! POSIX: a filesystem socket in the user runtime directory. Windows: a
//! loopback TCP port published through a sibling port file. A PID file sits
//! next to either.

use std::path::PathBuf;

/// Directory for the socket and PID files.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    #[cfg(unix)]
    {
        if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
    }
    std::env::temp_dir()
}

/// Filesystem socket path (POSIX).
#[must_use]
pub fn socket_path() -> PathBuf {
    runtime_dir().join("clara_companion.sock")
}

/// Port file path (Windows).
#[must_use]
pub fn port_file_path() -> PathBuf {
    std::env::temp_dir().join("clara_companion.port")
}

/// PID file path.
#[must_use]
pub fn pid_file_path() -> PathBuf {
    runtime_dir().join("clara_companion.pid")
}
