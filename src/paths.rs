//! Application directory structure for modforge.
//!
//! Provides a single `ForgePaths` struct that resolves all standard
//! directories and ensures they exist on first launch:
//!
//! - Config:  `~/.config/modforge/`            (kernels.toml, human-editable)
//! - Data:    `$XDG_DATA_HOME/modforge/` or `~/.local/share/modforge/`
//! - Logs:    `<data>/logs/`
//! - Daemon:  `<data>/daemon/` (job database, TLS material, bare repos,
//!   per-job log artifacts)
//! - Tmp:     `<data>/tmp/` (build scratch directories, removed per run)

use std::path::{Path, PathBuf};

use tracing::info;

const APP_NAME: &str = "modforge";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct ForgePaths {
    /// Human-editable config: `~/.config/modforge/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Per-run log files (`logs/<tag>/…`)
    pub logs: PathBuf,
    /// Daemon state root
    pub daemon: PathBuf,
    /// Daemon per-job log artifacts (`daemon/logs/<uuid>/…`)
    pub daemon_logs: PathBuf,
    /// Bare git repositories served by the daemon
    pub repos: PathBuf,
    /// Build scratch space
    pub tmp: PathBuf,
}

impl ForgePaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories — call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let daemon = data.join("daemon");

        Some(Self {
            config,
            logs: data.join("logs"),
            daemon_logs: daemon.join("logs"),
            repos: daemon.join("repos"),
            tmp: data.join("tmp"),
            daemon,
            data,
        })
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.data,
            &self.logs,
            &self.daemon,
            &self.daemon_logs,
            &self.repos,
            &self.tmp,
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        Ok(())
    }

    /// Default path of the kernel list.
    pub fn kernels_config(&self) -> PathBuf {
        self.config.join("kernels.toml")
    }

    /// Daemon job database.
    pub fn daemon_db(&self) -> PathBuf {
        self.daemon.join("daemon.db")
    }

    /// TLS certificate shared between daemon and clients.
    pub fn tls_cert(&self) -> PathBuf {
        self.daemon.join("cert.pem")
    }

    /// TLS private key.
    pub fn tls_key(&self) -> PathBuf {
        self.daemon.join("key.pem")
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}
