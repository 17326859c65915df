//! Connection parameters.

use std::time::Duration;

use rexec_device::DeviceConfig;

use crate::error::{Error, Result};

const DEFAULT_ARCH: &str = "v68";

/// Where the device lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A device instance owned by the session itself.
    Loopback(DeviceConfig),
    /// A `rexec-device-server` at `host:port`.
    Tcp(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Read and write timeout for every round-trip. Exceeding it leaves the
    /// session degraded.
    pub io_timeout: Duration,
    /// Stage each artifact instance once and hand later executors the same
    /// device module.
    pub reuse_staged_modules: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::loopback(DEFAULT_ARCH)
    }
}

impl ConnectionParams {
    /// In-process accelerator with default capacities.
    pub fn loopback(arch: impl Into<String>) -> Self {
        Self::loopback_with(DeviceConfig::accelerator(arch))
    }

    /// In-process host CPU device, the usual reference target.
    pub fn loopback_host() -> Self {
        Self::loopback_with(DeviceConfig::host_cpu())
    }

    pub fn loopback_with(config: DeviceConfig) -> Self {
        Self::with_endpoint(Endpoint::Loopback(config))
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        Self::with_endpoint(Endpoint::Tcp(addr.into()))
    }

    fn with_endpoint(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            reuse_staged_modules: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_module_reuse(mut self, reuse: bool) -> Self {
        self.reuse_staged_modules = reuse;
        self
    }

    /// Read the connection from the environment.
    ///
    /// - `REXEC_DEVICE`: `loopback` (default), `loopback:host` or `tcp://host:port`
    /// - `REXEC_ARCH`: accelerator arch for `loopback`, default `v68`
    /// - `REXEC_IO_TIMEOUT_MS`: round-trip timeout in milliseconds
    /// - `REXEC_REUSE_MODULES`: `1`/`true` to reuse staged modules
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let device = lookup("REXEC_DEVICE").unwrap_or_else(|| "loopback".to_string());
        let mut params = match device.trim() {
            "loopback" => Self::loopback(lookup("REXEC_ARCH").unwrap_or_else(|| DEFAULT_ARCH.to_string())),
            "loopback:host" => Self::loopback_host(),
            other => match other.strip_prefix("tcp://") {
                Some(addr) if !addr.is_empty() => Self::tcp(addr),
                _ => {
                    return Err(Error::Config(format!(
                        "REXEC_DEVICE must be `loopback`, `loopback:host` or `tcp://host:port`, got `{other}`"
                    )))
                }
            },
        };

        if let Some(value) = lookup("REXEC_IO_TIMEOUT_MS") {
            let millis: u64 = value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("REXEC_IO_TIMEOUT_MS must be a number of milliseconds, got `{value}`")))?;
            if millis == 0 {
                return Err(Error::Config("REXEC_IO_TIMEOUT_MS must be positive".into()));
            }
            params.io_timeout = Duration::from_millis(millis);
        }
        if let Some(value) = lookup("REXEC_REUSE_MODULES") {
            params.reuse_staged_modules = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(Error::Config(format!("REXEC_REUSE_MODULES must be a boolean, got `{value}`"))),
            };
        }
        Ok(params)
    }
}
