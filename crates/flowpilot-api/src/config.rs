// Server configuration and base directory layout
//
// Everything lives under one base directory (default ~/.flowpilot,
// overridable via FLOWPILOT_HOME): workflow documents, the executions
// database, the scheduler job database, daemon logs, and the PID file.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

const DEFAULT_BIND: &str = "127.0.0.1:8450";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let base_dir = match std::env::var("FLOWPILOT_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME")
                    .or_else(|_| std::env::var("USERPROFILE"))
                    .context("neither FLOWPILOT_HOME nor HOME is set")?;
                PathBuf::from(home).join(".flowpilot")
            }
        };

        let bind_addr = std::env::var("FLOWPILOT_BIND")
            .unwrap_or_else(|_| DEFAULT_BIND.to_string())
            .parse()
            .context("FLOWPILOT_BIND is not a valid socket address")?;

        Ok(Self {
            base_dir,
            bind_addr,
        })
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            bind_addr: DEFAULT_BIND.parse().expect("static address"),
        }
    }

    pub fn workflows_dir(&self) -> PathBuf {
        self.base_dir.join("workflows")
    }

    pub fn database_path(&self) -> PathBuf {
        self.base_dir.join("flowpilot.db")
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.base_dir.join("scheduler.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.base_dir.join("flowpilot.pid")
    }

    /// Create the directory layout.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(self.workflows_dir())
            .with_context(|| format!("failed to create {}", self.workflows_dir().display()))?;
        std::fs::create_dir_all(self.logs_dir())
            .with_context(|| format!("failed to create {}", self.logs_dir().display()))?;
        Ok(())
    }
}
