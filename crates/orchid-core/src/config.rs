// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::time::Duration;

/// Capabilities advertised by a hypervisor driver.
///
/// Placement and resize preconditions consult these; unknown drivers get
/// the conservative all-false default.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmmFeatures {
    /// The driver can resize CPU/memory of a running guest.
    pub live_resize: bool,
    /// The driver can live-migrate across system datastores.
    pub ds_live_migration: bool,
    /// The driver can take incremental backups.
    pub incremental_backup: bool,
}

/// Orchid core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the object store.
    pub database_url: String,
    /// First VNC port handed out by cluster bitmaps.
    pub vnc_base_port: u16,
    /// Width of each cluster's VNC bitmap, in ports.
    pub vnc_ports: u32,
    /// How long to wait for a driver reply before failing the request.
    pub driver_timeout: Duration,
    /// Default device prefix for disk target probing.
    pub dev_prefix: String,
    /// Per-driver feature table.
    pub vmm_features: HashMap<String, VmmFeatures>,
}

impl Default for Config {
    fn default() -> Self {
        let mut vmm_features = HashMap::new();
        vmm_features.insert(
            "kvm".to_string(),
            VmmFeatures {
                live_resize: true,
                ds_live_migration: true,
                incremental_backup: true,
            },
        );
        Self {
            database_url: "sqlite::memory:".to_string(),
            vnc_base_port: 5900,
            vnc_ports: 8192,
            driver_timeout: Duration::from_secs(90),
            dev_prefix: "vd".to_string(),
            vmm_features,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `ORCHID_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `ORCHID_VNC_BASE_PORT`: first VNC port (default: 5900)
    /// - `ORCHID_VNC_PORTS`: bitmap width per cluster (default: 8192)
    /// - `ORCHID_DRIVER_TIMEOUT_SECS`: driver reply timeout (default: 90)
    /// - `ORCHID_DEV_PREFIX`: disk target prefix (default: "vd")
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ORCHID_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ORCHID_DATABASE_URL"))?;

        let vnc_base_port: u16 = std::env::var("ORCHID_VNC_BASE_PORT")
            .unwrap_or_else(|_| "5900".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("ORCHID_VNC_BASE_PORT", "must be a valid port number")
            })?;

        let vnc_ports: u32 = std::env::var("ORCHID_VNC_PORTS")
            .unwrap_or_else(|_| "8192".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("ORCHID_VNC_PORTS", "must be a positive integer"))?;

        let driver_timeout_secs: u64 = std::env::var("ORCHID_DRIVER_TIMEOUT_SECS")
            .unwrap_or_else(|_| "90".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("ORCHID_DRIVER_TIMEOUT_SECS", "must be a positive integer")
            })?;

        let dev_prefix = std::env::var("ORCHID_DEV_PREFIX").unwrap_or_else(|_| "vd".to_string());

        Ok(Self {
            database_url,
            vnc_base_port,
            vnc_ports,
            driver_timeout: Duration::from_secs(driver_timeout_secs),
            dev_prefix,
            ..Self::default()
        })
    }

    /// Features for the named hypervisor driver; all-false when unknown.
    pub fn features(&self, driver: &str) -> VmmFeatures {
        self.vmm_features.get(driver).copied().unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
