use kpx_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Endpoint name the proxy listens on.
pub const SERVER_NAME: &str = "org.keepassxc.KeePassXC.BrowserServer";

const FLATPAK_APP_DIR: &str = "app/org.keepassxc.KeePassXC";
const STORE_FILE: &str = "associations.json";

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// Read a whole number of seconds from the environment.
pub fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| Error::config(format!("{} must be a number of seconds, got `{}`", name, value))),
        Err(_) => Ok(None),
    }
}

/// Locate the proxy endpoint for this platform.
///
/// On Linux the socket lives under `$XDG_RUNTIME_DIR`, inside the flatpak app
/// directory when KeePassXC runs sandboxed. Snap installs use their own common
/// directory. Everything else falls back to `$TMPDIR` or `/tmp`.
pub fn default_socket_path() -> PathBuf {
    if cfg!(windows) {
        let user = std::env::var("USERNAME").unwrap_or_default();
        return PathBuf::from(format!(r"\\.\pipe\{}_{}", SERVER_NAME, user));
    }

    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let tmp_dir = std::env::var_os("TMPDIR").map(PathBuf::from);

    if cfg!(target_os = "macos") {
        return tmp_dir.unwrap_or_else(|| PathBuf::from("/tmp")).join(SERVER_NAME);
    }

    socket_candidates(runtime_dir.as_deref(), home.as_deref(), tmp_dir.as_deref())
        .into_iter()
        .find(|path| path.exists())
        .unwrap_or_else(|| {
            runtime_dir
                .map(|dir| dir.join(FLATPAK_APP_DIR).join(SERVER_NAME))
                .unwrap_or_else(|| PathBuf::from("/tmp").join(SERVER_NAME))
        })
}

/// Unix socket locations in lookup order.
pub fn socket_candidates(
    runtime_dir: Option<&Path>,
    home: Option<&Path>,
    tmp_dir: Option<&Path>,
) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(dir) = runtime_dir {
        candidates.push(dir.join(FLATPAK_APP_DIR).join(SERVER_NAME));
        candidates.push(dir.join(SERVER_NAME));
    }
    if let Some(home) = home {
        candidates.push(home.join("snap/keepassxc/common").join(SERVER_NAME));
    }
    if let Some(dir) = tmp_dir {
        candidates.push(dir.join(SERVER_NAME));
    }
    candidates.push(PathBuf::from("/tmp").join(SERVER_NAME));
    candidates
}

/// `$XDG_CONFIG_HOME/kpx/associations.json`, or the platform equivalent.
pub fn default_store_path() -> PathBuf {
    let base = if cfg!(windows) {
        std::env::var_os("APPDATA").map(PathBuf::from)
    } else if cfg!(target_os = "macos") {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join("Library/Application Support"))
    } else {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    };
    base.unwrap_or_else(|| PathBuf::from("."))
        .join("kpx")
        .join(STORE_FILE)
}
