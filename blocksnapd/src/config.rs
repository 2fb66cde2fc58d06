use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use log::warn;

const DEFAULT_CONFIG_PATH: &str = "/etc/blocksnap/blocksnapd.toml";
const ENV_CONFIG_PATH: &str = "BLOCKSNAP_CONFIG";

pub const DEFAULT_SNAP_DEVICES: u32 = 24;
pub const MAX_SNAP_DEVICES: u32 = 255;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `BLOCKSNAP_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(PathBuf::from(path))
    }

    pub fn load_from(path: PathBuf) -> Self {
        let mut config: Config = match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        };
        config.engine.clamp_max_devices();
        config
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Number of tracer slots available.
    #[serde(default = "default_max_snap_devices")]
    pub max_snap_devices: u32,
    /// Section cache ceiling used when a request passes 0 (in bytes).
    #[serde(default = "default_cow_max_memory")]
    pub cow_max_memory_default: u64,
    /// COW file ceiling as a percentage of the device when a request
    /// passes 0 fallocated megabytes.
    #[serde(default = "default_cow_fallocate_percentage")]
    pub cow_fallocate_percentage: u64,
    /// Snapshot device name prefix; devices surface as `<prefix><minor>`.
    #[serde(default = "default_device_prefix")]
    pub device_prefix: String,
}

impl EngineConfig {
    fn clamp_max_devices(&mut self) {
        if self.max_snap_devices == 0 || self.max_snap_devices > MAX_SNAP_DEVICES {
            let nr_devices = if self.max_snap_devices == 0 {
                DEFAULT_SNAP_DEVICES
            } else {
                MAX_SNAP_DEVICES
            };
            warn!(
                "invalid number of snapshot devices ({}), setting to {}",
                self.max_snap_devices, nr_devices
            );
            self.max_snap_devices = nr_devices;
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_snap_devices: default_max_snap_devices(),
            cow_max_memory_default: default_cow_max_memory(),
            cow_fallocate_percentage: default_cow_fallocate_percentage(),
            device_prefix: default_device_prefix(),
        }
    }
}

fn default_max_snap_devices() -> u32 {
    DEFAULT_SNAP_DEVICES
}
fn default_cow_max_memory() -> u64 {
    300 * 1024 * 1024
}
fn default_cow_fallocate_percentage() -> u64 {
    10
}
fn default_device_prefix() -> String {
    "blocksnap".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Interval between mount-table polls, in milliseconds.
    #[serde(default = "default_mount_poll_ms")]
    pub mount_poll_ms: u64,
    #[serde(default = "default_mount_watcher")]
    pub mount_watcher: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            mount_poll_ms: default_mount_poll_ms(),
            mount_watcher: default_mount_watcher(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:3090".to_string()
}
fn default_mount_poll_ms() -> u64 {
    500
}
fn default_mount_watcher() -> bool {
    true
}
