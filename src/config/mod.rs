// Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::driver::DriverKind;
use crate::scheduler::SchedulerDefaults;
use crate::store::ClusterSize;

pub const PROD: &str = "prod";
#[allow(dead_code)]
pub const DEV: &str = "dev";
#[allow(dead_code)]
pub const DEBUG: &str = "debug";
#[allow(dead_code)]
pub const TEST: &str = "test";

/// Default instance size, e.g. `4` or `CPU`.
pub const CLUSTER_ENV: &str = "STRONGLOOP_CLUSTER";
/// Enables tracing on new instances when set to a truthy value.
pub const TRACING_ENV: &str = "STRONGLOOP_TRACING";

pub const DEFAULT_PORT: u16 = 8701;
pub const DEFAULT_BASE_DIR: &str = ".strong-central";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Central {
    #[serde(rename = "central")]
    pub central: CentralBox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CentralBox {
    pub env: String,
    pub logs: Option<Logs>,
    pub api: Option<Api>,
    pub base_dir: Option<PathBuf>,
    pub driver: Option<Driver>,
    pub store: Option<Store>,
    pub scheduler: Option<Scheduler>,
    pub control: Option<Control>,
    pub shutdown: Option<Shutdown>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logs {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Api {
    pub name: Option<String>,
    pub port: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

/// Driver selection plus the driver options file contents.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Driver {
    pub kind: Option<String>,
    pub supervisor_url: Option<String>,
    pub registration_uri: Option<String>,
    pub api_user: Option<String>,
    #[serde(skip_serializing)]
    pub api_password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Store {
    /// Directory for table snapshots; in-memory only when unset.
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scheduler {
    pub cluster_size: Option<String>,
    pub tracing: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Control {
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub reconnect_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Shutdown {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

// Config trait
pub trait ConfigTrait {
    fn logs(&self) -> Option<&Logs>;
    fn is_prod(&self) -> bool;
    #[allow(dead_code)]
    fn is_debug(&self) -> bool;
    #[allow(dead_code)]
    fn is_dev(&self) -> bool;
    #[allow(dead_code)]
    fn is_test(&self) -> bool;
    fn api(&self) -> Option<&Api>;
    fn port(&self) -> u16;
    fn base_dir(&self) -> PathBuf;
    fn driver(&self) -> Option<&Driver>;
    fn driver_kind(&self) -> Result<DriverKind>;
    fn supervisor_url(&self) -> Result<Option<Url>>;
    fn store(&self) -> Option<&Store>;
    fn scheduler_defaults(&self) -> SchedulerDefaults;
    fn request_timeout(&self) -> Duration;
    fn reconnect_timeout(&self) -> Duration;
    fn shutdown_timeout(&self) -> Duration;
}

// Config type alias for convenience
pub type Config = Central;

impl ConfigTrait for Config {
    fn logs(&self) -> Option<&Logs> {
        self.central.logs.as_ref()
    }

    fn is_prod(&self) -> bool {
        self.central.env == PROD
    }

    fn is_debug(&self) -> bool {
        self.central.env == DEBUG
    }

    fn is_dev(&self) -> bool {
        self.central.env == DEV
    }

    fn is_test(&self) -> bool {
        self.central.env == TEST
    }

    fn api(&self) -> Option<&Api> {
        self.central.api.as_ref()
    }

    fn port(&self) -> u16 {
        self.api().and_then(|a| a.port).unwrap_or(DEFAULT_PORT)
    }

    fn base_dir(&self) -> PathBuf {
        self.central
            .base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR))
    }

    fn driver(&self) -> Option<&Driver> {
        self.central.driver.as_ref()
    }

    fn driver_kind(&self) -> Result<DriverKind> {
        match self.driver().and_then(|d| d.kind.as_deref()) {
            Some(kind) => kind.parse::<DriverKind>().map_err(anyhow::Error::msg),
            None => Ok(DriverKind::Executor),
        }
    }

    /// Control URI handed to cloud containers; defaults to this server's
    /// supervisor endpoint.
    fn supervisor_url(&self) -> Result<Option<Url>> {
        if !self.driver_kind()?.requires_scheduler() {
            let raw = self
                .driver()
                .and_then(|d| d.supervisor_url.clone())
                .unwrap_or_else(|| format!("ws://localhost:{}/supervisor-control", self.port()));
            let url = Url::parse(&raw).with_context(|| format!("invalid supervisor url {raw:?}"))?;
            return Ok(Some(url));
        }
        Ok(None)
    }

    fn store(&self) -> Option<&Store> {
        self.central.store.as_ref()
    }

    fn scheduler_defaults(&self) -> SchedulerDefaults {
        let cfg = self.central.scheduler.as_ref();
        let cluster_size = std::env::var(CLUSTER_ENV)
            .ok()
            .or_else(|| cfg.and_then(|s| s.cluster_size.clone()))
            .map(|raw| ClusterSize::parse(&raw))
            .unwrap_or_default();
        let tracing = match std::env::var(TRACING_ENV) {
            Ok(raw) => is_truthy(&raw),
            Err(_) => cfg.and_then(|s| s.tracing).unwrap_or(false),
        };
        SchedulerDefaults { cluster_size, tracing }
    }

    fn request_timeout(&self) -> Duration {
        self.central
            .control
            .as_ref()
            .and_then(|c| c.request_timeout)
            .unwrap_or(Duration::from_secs(30))
    }

    fn reconnect_timeout(&self) -> Duration {
        self.central
            .control
            .as_ref()
            .and_then(|c| c.reconnect_timeout)
            .unwrap_or(Duration::from_secs(10))
    }

    fn shutdown_timeout(&self) -> Duration {
        self.central
            .shutdown
            .as_ref()
            .and_then(|s| s.timeout)
            .unwrap_or(Duration::from_secs(60))
    }
}

fn is_truthy(raw: &str) -> bool {
    !matches!(raw.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no" | "off")
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let abs_path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve absolute config filepath: {:?}", path))?;

        let data = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("read config yaml file {:?}", abs_path))?;

        let cfg: Central = serde_yaml::from_str(&data)
            .with_context(|| format!("unmarshal yaml from {:?}", abs_path))?;

        // Fail at startup rather than on first use.
        cfg.driver_kind()?;
        cfg.supervisor_url()?;

        Ok(cfg)
    }

    /// Merges a JSON driver options file over the `driver` section.
    pub fn apply_driver_options<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let data = std::fs::read(path).with_context(|| format!("read driver options {:?}", path))?;
        let opts: Driver =
            serde_json::from_slice(&data).with_context(|| format!("parse driver options {:?}", path))?;

        let driver = self.central.driver.get_or_insert_with(Driver::default);
        if opts.kind.is_some() {
            driver.kind = opts.kind;
        }
        if opts.supervisor_url.is_some() {
            driver.supervisor_url = opts.supervisor_url;
        }
        if opts.registration_uri.is_some() {
            driver.registration_uri = opts.registration_uri;
        }
        if opts.api_user.is_some() {
            driver.api_user = opts.api_user;
        }
        if opts.api_password.is_some() {
            driver.api_password = opts.api_password;
        }
        self.driver_kind()?;
        Ok(())
    }

    pub fn set_driver_kind(&mut self, kind: DriverKind) {
        self.central.driver.get_or_insert_with(Driver::default).kind = Some(kind.name().to_string());
    }

    pub fn set_base_dir(&mut self, dir: PathBuf) {
        self.central.base_dir = Some(dir);
    }

    pub fn set_port(&mut self, port: u16) {
        match self.central.api.as_mut() {
            Some(api) => api.port = Some(port),
            None => {
                self.central.api = Some(Api {
                    name: None,
                    port: Some(port),
                    timeout: None,
                })
            }
        }
    }
}


// Test config is always available for integration tests
mod test_config;
#[allow(dead_code)]
pub use test_config::new_test_config;
