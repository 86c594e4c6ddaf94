//! Process settings.
//!
//! Settings are loaded from environment variables with defaults derived from
//! the application directory.

use std::path::PathBuf;
use yurt_core::AppPaths;

/// Runtime settings for the `yurt` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Application directory layout.
    pub paths: AppPaths,

    /// Account the SSH probe logs in as.
    pub ssh_user: String,

    /// Private key the SSH probe authenticates with.
    pub ssh_key: PathBuf,

    /// Probe remembered ports before rewriting NAT rules.
    pub reuse_forwards: bool,
}

impl Settings {
    /// Defaults for a given application directory.
    pub fn new(paths: AppPaths) -> Self {
        Self {
            ssh_key: paths.ssh_private_key_file(),
            ssh_user: "yurt".to_string(),
            reuse_forwards: false,
            paths,
        }
    }

    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `YURT_ENV` | `production` (development, test) |
    /// | `YURT_SSH_USER` | `yurt` |
    /// | `YURT_SSH_KEY` | `<app dir>/id_rsa` |
    /// | `YURT_REUSE_FORWARDS` | `false` |
    pub fn from_env() -> yurt_core::Result<Self> {
        let default = Self::new(AppPaths::from_env()?);

        Ok(Self {
            ssh_user: std::env::var("YURT_SSH_USER")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(default.ssh_user),
            ssh_key: std::env::var("YURT_SSH_KEY")
                .map(PathBuf::from)
                .unwrap_or(default.ssh_key),
            reuse_forwards: std::env::var("YURT_REUSE_FORWARDS")
                .map(|v| parse_flag(&v))
                .unwrap_or(default.reuse_forwards),
            paths: default.paths,
        })
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
