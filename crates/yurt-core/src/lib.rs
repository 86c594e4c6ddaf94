//! # yurt-core
//!
//! Host-side plumbing shared by the yurt VM tooling.
//!
//! This crate runs external commands with timeouts and captured output,
//! retries transient failures, renders a progress ticker while slow work
//! runs, and persists small amounts of operational state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     yurt-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ ProcessExecutor │────▶│  tokio::process::Command │   │
//! │  │  - execute()    │     │  (timeout, kill_on_drop) │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    retry()      │────▶│   Spinner (stderr)       │   │
//! │  │  fixed delay    │     │   100ms frames           │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  ConfigStore    │────▶│  config.json (atomic     │   │
//! │  │  get/set/clear  │     │  replace, rollback)      │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use yurt_core::{CommandSpec, ConfigStore, Executor, Key, ProcessExecutor};
//!
//! # async fn example() -> yurt_core::Result<()> {
//! let executor = ProcessExecutor::new();
//! let spec = CommandSpec::new("VBoxManage")
//!     .args(["list", "vms"])
//!     .timeout(Duration::from_secs(30));
//! let stdout = executor.execute(&spec).await?;
//! println!("{stdout}");
//!
//! let store = ConfigStore::open("/home/me/.yurt/config.json");
//! store.set(Key::SshPort, "4050")?;
//! assert_eq!(store.get(Key::SshPort)?.as_deref(), Some("4050"));
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod exec;
mod interrupt;
mod paths;
mod retry;
mod spinner;

pub use config::{ConfigBackend, ConfigStore, JsonFile, Key, CONFIG_FILE_NAME};
pub use error::{CoreError, Result};
pub use exec::{CommandSpec, Executor, ProcessExecutor};
pub use interrupt::Interrupt;
pub use paths::{AppPaths, Environment, APP_NAME};
pub use retry::{retry, retry_if, RetryPolicy};
pub use spinner::{show_while, sleep_for, Spinner, FRAMES, FRAME_INTERVAL};
