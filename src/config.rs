//! Process configuration: resolution, precedence, and atomic persistence.
//!
//! Layering mirrors the flag > env > file > default precedence the engine
//! is configured with everywhere else in this ecosystem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_SERVER_URL: &str = "https://example-content-service.test";
const CONFIG_PATH_ENV: &str = "SITESYNC_CONFIG_PATH";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_key: String,
    pub username: String,
    pub sync_folder: PathBuf,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    pub device_id: String,

    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

/// Lenient counterpart used while resolving a config file that might be
/// partially filled in, or missing fields later backfilled from env/flags.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    sync_folder: String,
    #[serde(default)]
    server_url: String,
    #[serde(default)]
    device_id: String,
}

#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub sync_folder: Option<PathBuf>,
    pub server_url: Option<String>,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let config_path = resolve_config_path(overrides.config_path.as_deref())?;

        let mut partial = if config_path.exists() {
            let data = std::fs::read_to_string(&config_path)
                .with_context(|| format!("read {}", config_path.display()))?;
            serde_json::from_str(&data).context("parse config file")?
        } else {
            PartialConfig::default()
        };

        if let Some(v) = std::env::var("SITESYNC_API_KEY").ok().filter(|s| !s.is_empty()) {
            partial.api_key = v;
        }
        if let Some(v) = std::env::var("SITESYNC_USERNAME").ok().filter(|s| !s.is_empty()) {
            partial.username = v;
        }
        if let Some(v) = std::env::var("SITESYNC_FOLDER").ok().filter(|s| !s.is_empty()) {
            partial.sync_folder = v;
        }
        if let Some(v) = std::env::var("SITESYNC_SERVER_URL").ok().filter(|s| !s.is_empty()) {
            partial.server_url = v;
        }
        if let Some(v) = std::env::var("SITESYNC_DEVICE_ID").ok().filter(|s| !s.is_empty()) {
            partial.device_id = v;
        }

        if let Some(v) = overrides.api_key {
            partial.api_key = v;
        }
        if let Some(v) = overrides.username {
            partial.username = v;
        }
        if let Some(v) = overrides.sync_folder {
            partial.sync_folder = v.to_string_lossy().into_owned();
        }
        if let Some(v) = overrides.server_url {
            partial.server_url = v;
        }

        if partial.api_key.trim().is_empty() {
            anyhow::bail!("missing api_key: set it in the config file, SITESYNC_API_KEY, or --api-key");
        }
        if partial.username.trim().is_empty() {
            anyhow::bail!("missing username: set it in the config file, SITESYNC_USERNAME, or --username");
        }
        if partial.sync_folder.trim().is_empty() {
            anyhow::bail!("missing sync_folder: set it in the config file, SITESYNC_FOLDER, or --sync-folder");
        }

        let sync_folder = absolutize_path(&partial.sync_folder)?;
        let server_url = if partial.server_url.trim().is_empty() {
            DEFAULT_SERVER_URL.to_string()
        } else {
            partial.server_url
        };
        let device_id = if partial.device_id.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            partial.device_id
        };

        let cfg = Config {
            api_key: partial.api_key,
            username: partial.username,
            sync_folder,
            server_url,
            device_id,
            config_path,
        };

        cfg.validate()?;
        cfg.save()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        validate_url(&self.server_url).context("server_url")
    }

    /// Writes the config atomically: temp file in the same directory, then
    /// rename over the target, so a crash mid-write never corrupts it.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("serialize config")?;
        let tmp_path = self
            .config_path
            .with_extension(format!("{}.tmp", rand_suffix()));
        std::fs::write(&tmp_path, json.as_bytes())
            .with_context(|| format!("write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.config_path)
            .with_context(|| format!("rename into {}", self.config_path.display()))?;
        Ok(())
    }

}

fn rand_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:08x}", rng.gen::<u32>())
}

/// Resolves the config path the same way `load_with_overrides` would,
/// without requiring a full load — used by `sitesync config-path`.
pub fn resolved_config_path(flag: Option<&Path>) -> Result<PathBuf> {
    resolve_config_path(flag)
}

fn resolve_config_path(flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = flag {
        return Ok(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    default_config_path()
}

fn default_config_path() -> Result<PathBuf> {
    let home = dirs_home()?;
    Ok(home.join(".sitesync").join("config.json"))
}

fn dirs_home() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")
}

fn expand_tilde(raw: &str) -> String {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{home}/{rest}");
        }
    }
    raw.to_string()
}

fn absolutize_path(raw: &str) -> Result<PathBuf> {
    let expanded = expand_tilde(raw);
    let path = PathBuf::from(&expanded);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir().context("resolve current directory")?;
        Ok(cwd.join(path))
    }
}

pub(crate) fn validate_url(url: &str) -> Result<()> {
    url::Url::parse(url)
        .map(|_| ())
        .with_context(|| format!("invalid url: {url}"))
}
