//! Application directory layout.

use crate::config::CONFIG_FILE_NAME;
use crate::error::{CoreError, Result};
use std::path::{Path, PathBuf};

/// Base name of the application directory.
pub const APP_NAME: &str = "yurt";

/// Deployment flavour selected by `YURT_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Development,
    Test,
}

impl Environment {
    /// Parse a `YURT_ENV` value. Anything unrecognized is production.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "development" => Self::Development,
            "test" => Self::Test,
            _ => Self::Production,
        }
    }

    /// Read `YURT_ENV`.
    pub fn from_env() -> Self {
        std::env::var("YURT_ENV")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    /// Directory name used for this flavour, without any leading dot.
    pub fn dir_name(&self) -> String {
        match self {
            Self::Production => APP_NAME.to_string(),
            Self::Development => format!("{APP_NAME}-dev"),
            Self::Test => format!("{APP_NAME}-test"),
        }
    }
}

/// Locations of everything yurt keeps on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Layout rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the application directory for the current user.
    ///
    /// `%LOCALAPPDATA%\<name>` on Windows, `$HOME/.<name>` elsewhere.
    pub fn from_env() -> Result<Self> {
        let name = Environment::from_env().dir_name();

        let root = if cfg!(windows) {
            dirs::data_local_dir().map(|base| base.join(&name))
        } else {
            dirs::home_dir().map(|home| home.join(format!(".{name}")))
        };

        root.map(Self::new).ok_or_else(|| {
            tracing::error!("Home directory is not set");
            CoreError::ConfigRead("cannot determine the user's home directory".into())
        })
    }

    /// Application directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted config file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Host keys trusted by the SSH probe.
    pub fn known_hosts_file(&self) -> PathBuf {
        self.root.join("known_hosts")
    }

    /// Default private key used to log into the guest.
    pub fn ssh_private_key_file(&self) -> PathBuf {
        self.root.join("id_rsa")
    }
}
