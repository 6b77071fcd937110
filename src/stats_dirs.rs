//! Application directory paths for the statistics agent.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | State | `~/Library/Application Support/device-stats/` | `~/.local/share/device-stats/` |
//! | Config | `~/Library/Application Support/device-stats/` | `~/.config/device-stats/` |
//!
//! Overrides: `DEVICE_STATS_DATA_DIR` for [`data_dir`], `DEVICE_STATS_CONFIG_DIR`
//! for [`config_dir`].

use std::path::PathBuf;

const APP_DIR_NAME: &str = "device-stats";

/// Persistent state root (checkpoint and scheduled job records).
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DEVICE_STATS_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("/tmp/device-stats-data"))
}

/// Directory holding `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DEVICE_STATS_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("/tmp/device-stats-config"))
}
