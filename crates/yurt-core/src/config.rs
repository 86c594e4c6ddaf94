//! Persisted operational state.
//!
//! A single flat JSON object keyed by [`Key`] names. The file is created
//! lazily, replaced atomically on every write, and restored to its previous
//! contents when a write fails.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Name of the config file inside the application directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Distinguishes temp files of concurrent writers within one process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Known config entries. Serialized by name, never by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Key {
    /// Name of the managed VM in the hypervisor
    VmName,
    /// Host-only network interface name
    Interface,
    /// IP address of the host-only interface
    InterfaceIpAddress,
    /// Netmask of the host-only interface
    InterfaceNetmask,
    /// Host port forwarded to guest SSH
    SshPort,
    /// Host port forwarded to the guest container-management endpoint
    LxdPort,
    /// Whether the container runtime in the guest has been initialized
    IsLxdInitialized,
}

impl Key {
    /// All keys, in declaration order.
    pub const ALL: [Key; 7] = [
        Key::VmName,
        Key::Interface,
        Key::InterfaceIpAddress,
        Key::InterfaceNetmask,
        Key::SshPort,
        Key::LxdPort,
        Key::IsLxdInitialized,
    ];

    /// Name under which the key is stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            Key::VmName => "vm_name",
            Key::Interface => "interface",
            Key::InterfaceIpAddress => "interface_ip_address",
            Key::InterfaceNetmask => "interface_netmask",
            Key::SshPort => "ssh_port",
            Key::LxdPort => "lxd_port",
            Key::IsLxdInitialized => "is_lxd_initialized",
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw storage behind a [`ConfigStore`].
pub trait ConfigBackend: Send + Sync {
    /// Current contents. A missing store is created as `{}` first.
    fn load(&self) -> io::Result<String>;

    /// Replace the contents as a whole.
    fn commit(&self, contents: &str) -> io::Result<()>;

    /// Human-readable location used in error messages.
    fn location(&self) -> String {
        "config".to_string()
    }
}

/// JSON file on disk, replaced via a temp file and rename.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    /// Backend for the file at `path`. Nothing is touched until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
            _ => Ok(()),
        }
    }

    /// Create the file as `{}` unless it exists.
    ///
    /// The content is written to a temp file first and linked into place,
    /// which fails if another writer got there first. The file is therefore
    /// never visible half-written, and an existing store is never replaced.
    fn ensure_exists(&self) -> io::Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        self.ensure_parent()?;

        let tmp_path = self.temp_path();
        fs::write(&tmp_path, b"{}")?;
        let linked = match fs::hard_link(&tmp_path, &self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Created empty config file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            // Filesystems without hard links.
            Err(_) if !self.path.exists() => fs::rename(&tmp_path, &self.path),
            Err(_) => Ok(()),
        };
        let _ = fs::remove_file(&tmp_path);
        linked
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| CONFIG_FILE_NAME.to_string());
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!(".{name}.tmp.{}.{seq}", std::process::id()))
    }
}

impl ConfigBackend for JsonFile {
    fn load(&self) -> io::Result<String> {
        self.ensure_exists()?;
        fs::read_to_string(&self.path)
    }

    fn commit(&self, contents: &str) -> io::Result<()> {
        self.ensure_parent()?;
        let tmp_path = self.temp_path();
        if let Err(e) = fs::write(&tmp_path, contents) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &self.path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp_path);
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Key/value view over a [`ConfigBackend`].
///
/// Reads always go to the backend; nothing is cached, so every call sees
/// what the last successful write committed.
#[derive(Debug, Clone)]
pub struct ConfigStore<B: ConfigBackend = JsonFile> {
    backend: B,
}

impl ConfigStore<JsonFile> {
    /// Store backed by the JSON file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(JsonFile::new(path))
    }
}

impl<B: ConfigBackend> ConfigStore<B> {
    /// Store over a custom backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Value stored under `key`, or `None` when the key is absent.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigRead`] if the store exists but cannot be parsed.
    pub fn get(&self, key: Key) -> Result<Option<String>> {
        let snapshot = self.read_snapshot()?;
        Ok(snapshot.and_then(|map| map.get(key.as_str()).map(render_value)))
    }

    /// Every entry currently stored, including names outside [`Key`].
    pub fn entries(&self) -> Result<BTreeMap<String, String>> {
        let snapshot = self.read_snapshot()?.unwrap_or_default();
        Ok(snapshot
            .iter()
            .map(|(name, value)| (name.clone(), render_value(value)))
            .collect())
    }

    /// Store `value` under `key`.
    ///
    /// When the store cannot be read, nothing is written and `Ok(())` is
    /// returned. When the commit fails, the previous snapshot is committed
    /// again before the error is returned.
    ///
    /// # Errors
    ///
    /// [`CoreError::ConfigWrite`] if the new snapshot could not be committed.
    pub fn set(&self, key: Key, value: impl Into<String>) -> Result<()> {
        let old = match self.read_snapshot() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::debug!(%key, "Config holds no object, skipping write");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Config unreadable, skipping write");
                return Ok(());
            }
        };

        let mut new = old.clone();
        new.insert(key.as_str().to_string(), Value::String(value.into()));

        if let Err(e) = self.write_snapshot(&new) {
            tracing::error!(%key, error = %e, "Error writing config, restoring previous contents");
            if let Err(rollback) = self.write_snapshot(&old) {
                tracing::error!(error = %rollback, "Failed to restore previous config");
            }
            return Err(e);
        }

        tracing::debug!(%key, "Config updated");
        Ok(())
    }

    /// Replace the whole store with an empty object.
    pub fn clear(&self) -> Result<()> {
        tracing::debug!("Clearing config");
        self.write_snapshot(&Map::new())
    }

    fn read_snapshot(&self) -> Result<Option<Map<String, Value>>> {
        let contents = self.backend.load().map_err(|e| {
            let msg = format!("cannot read {}: {e}", self.backend.location());
            tracing::error!("{msg}");
            CoreError::ConfigRead(msg)
        })?;

        if contents.trim().is_empty() {
            tracing::debug!(location = %self.backend.location(), "Config is empty, treating as {{}}");
            return Ok(Some(Map::new()));
        }

        match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(Value::Null) => Ok(None),
            Ok(_) | Err(_) => {
                let msg = format!("malformed config file: {}", self.backend.location());
                tracing::error!("{msg}");
                Err(CoreError::ConfigRead(msg))
            }
        }
    }

    fn write_snapshot(&self, snapshot: &Map<String, Value>) -> Result<()> {
        let contents = serde_json::to_string(snapshot)?;
        self.backend.commit(&contents).map_err(|e| {
            CoreError::ConfigWrite(format!("cannot write {}: {e}", self.backend.location()))
        })
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
