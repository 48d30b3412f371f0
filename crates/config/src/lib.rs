//! Layered configuration.
//!
//! Later layers win: built-in defaults, then a config file (TOML, YAML or
//! JSON, picked by extension), then `PICSMAP_` environment variables with
//! nested keys separated by `__` (`PICSMAP_FETCH__BATCH_SIZE=100`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_NAME: &str = "picsmap";
pub const ENV_PREFIX: &str = "PICSMAP_";
pub const OUTPUT_FILE: &str = "pics_depot_mappings.json";
const CONFIG_STEM: &str = "config";
const CONFIG_EXTENSIONS: [&str; 4] = ["toml", "yaml", "yml", "json"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the index is read from and written to.
    pub output: PathBuf,
    pub gateway: GatewayConfig,
    pub fetch: FetchConfig,
    pub enumeration: EnumerationConfig,
    pub listing: ListingConfig,
    pub persistence: PersistenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: default_output(),
            gateway: GatewayConfig::default(),
            fetch: FetchConfig::default(),
            enumeration: EnumerationConfig::default(),
            listing: ListingConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// The catalog gateway the line transport connects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub address: SocketAddr,
    pub connect_timeout_secs: u64,
    pub login_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 27060)),
            connect_timeout_secs: 30,
            login_timeout_secs: 30,
        }
    }
}

impl GatewayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Timeout of calls answered by a single response.
    pub call_timeout_secs: u64,
    /// Timeout of a whole multi-part product info exchange.
    pub product_info_timeout_secs: u64,
    pub progress_every: usize,
    pub discover_sub_products: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            batch_delay_ms: 150,
            call_timeout_secs: 5 * 60,
            product_info_timeout_secs: 10 * 60,
            progress_every: 10,
            discover_sub_products: true,
        }
    }
}

impl FetchConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn product_info_timeout(&self) -> Duration {
        Duration::from_secs(self.product_info_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationConfig {
    pub window: u32,
    pub max_apps: usize,
    pub max_full_update_signals: u32,
    pub poll_delay_ms: u64,
    pub stall_step: u32,
    pub stall_delay_ms: u64,
    pub full_update_delay_ms: u64,
    pub bootstrap_from_full_listing: bool,
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            window: 50_000,
            max_apps: 500_000,
            max_full_update_signals: 3,
            poll_delay_ms: 100,
            stall_step: 500,
            stall_delay_ms: 100,
            full_update_delay_ms: 1000,
            bootstrap_from_full_listing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            url: "https://api.steampowered.com/ISteamApps/GetAppList/v2/".to_string(),
            timeout_secs: 2 * 60,
        }
    }
}

impl ListingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Distance between `lastUpdated` and `nextUpdateDue`.
    pub update_interval_hours: u32,
    /// Provenance tag written on every depot entry.
    pub source_tag: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            update_interval_hours: 48,
            source_tag: "pics".to_string(),
        }
    }
}

impl Config {
    /// Reject values that would make a run misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.fetch.batch_size == 0, "fetch.batch_size must be at least 1"),
            (self.fetch.progress_every == 0, "fetch.progress_every must be at least 1"),
            (
                self.enumeration.max_full_update_signals == 0,
                "enumeration.max_full_update_signals must be at least 1",
            ),
            (self.enumeration.stall_step == 0, "enumeration.stall_step must be at least 1"),
            (self.listing.url.trim().is_empty(), "listing.url must not be empty"),
            (self.output.as_os_str().is_empty(), "output must not be empty"),
        ];
        if let Some((_, message)) = checks.into_iter().find(|(failed, _)| *failed) {
            exn::bail!(ErrorKind::Invalid(message.to_string()));
        }
        Ok(())
    }
}

/// Load configuration, reading `path` if given (it must exist) or the
/// platform default config file if one is present.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let file = match path {
        Some(path) if !path.is_file() => exn::bail!(ErrorKind::MissingFile(path.to_path_buf())),
        Some(path) => Some(path.to_path_buf()),
        None => default_config_file(),
    };
    load_from(file.as_deref())
}

/// Load configuration from defaults, `file` (if any) and the environment.
pub fn load_from(file: Option<&Path>) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(file) = file {
        tracing::debug!(path = %file.display(), "reading config file");
        figment = merge_file(figment, file)?;
    }
    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .or_raise(|| ErrorKind::Load)?;
    config.validate()?;
    Ok(config)
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
    })
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// `<data dir>/pics_depot_mappings.json`, or the bare file name when no home
/// directory can be determined.
pub fn default_output() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().join(OUTPUT_FILE))
        .unwrap_or_else(|| PathBuf::from(OUTPUT_FILE))
}

/// The first existing `config.{toml,yaml,yml,json}` in the platform config dir.
pub fn default_config_file() -> Option<PathBuf> {
    let dirs = project_dirs()?;
    CONFIG_EXTENSIONS
        .iter()
        .map(|ext| dirs.config_dir().join(format!("{CONFIG_STEM}.{ext}")))
        .find(|path| path.is_file())
}
