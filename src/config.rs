use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// User agent attached to every relayed request. Matches Safari 15.5 on macOS.
pub const SAFARI_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.5 Safari/605.1.15";

/// Global scripts evaluated into the runtime at startup, in load order.
const DEFAULT_BOOTSTRAP: &[&str] = &[
    "jscontext_shim.js",
    "url-polyfill.js",
    "zotero_config.js",
    "zotero.js",
    "i18n.js",
    "translate/promise.js",
    "prefs.js",
    "api.js",
    "http.js",
    "http_global.js",
    "oauthsimple.js",
    "proxy.js",
    "connector.js",
    "repo.js",
    "utilities/date.js",
    "utilities/openurl.js",
    "utilities/xregexp-all.js",
    "utilities/utilities.js",
    "utilities/utilities_item.js",
    "utilities/resource/zoteroTypeSchemaData.js",
    "utilities.js",
    "translate/debug.js",
    "translate/tlds.js",
    "translate/translator.js",
    "itemSaver_background.js",
    "translators.js",
    "zotero-google-docs-integration/api.js",
    "cachedTypes.js",
    "errors_webkit.js",
    "messages.js",
    "messaging.js",
    "messaging_global.js",
    "global.js",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub resources: ResourcesConfig,
    pub host: HostConfig,
    pub http: HttpConfig,
    pub protocol: ProtocolConfig,
    pub prefs: PrefsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Root of the bundled extension resources
    pub root: PathBuf,
    /// Second location tried when a resource is missing under `root`
    pub fallback_subdir: String,
    /// Scripts loaded into the runtime at startup, in order
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long to wait for a host completion handler before treating it as "none"
    pub callback_timeout_ms: u64,
    /// Period of the background liveness sweep (0 disables it)
    pub sweep_interval_secs: u64,
    /// Poll period used to notice windows closing
    pub window_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Default request timeout when the caller gives none
    pub timeout_ms: u64,
    pub user_agent: String,
    /// Honour the system proxy settings
    pub system_proxy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Prefix marking message names answered natively
    pub native_prefix: String,
    /// Reported when the host does not know its own version
    pub fallback_version: String,
    pub default_locale: String,
    /// Label of the last context menu slot
    pub preferences_label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefsConfig {
    pub path: PathBuf,
    /// Key the preferences blob is stored under
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write logs to the data directory
    pub file: bool,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("resources"),
            fallback_subdir: "safari".to_string(),
            bootstrap: DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            callback_timeout_ms: 2000,
            sweep_interval_secs: 60,
            window_poll_ms: 1000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            user_agent: SAFARI_USER_AGENT.to_string(),
            system_proxy: true,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            native_prefix: "Swift.".to_string(),
            fallback_version: "5.1".to_string(),
            default_locale: "en".to_string(),
            preferences_label: "Zotero Preferences".to_string(),
        }
    }
}

impl Default for PrefsConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("prefs.json"),
            key: "ConnectorPrefs".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
        }
    }
}

impl HostConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    /// `None` when the periodic sweep is disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    pub fn window_poll(&self) -> Duration {
        Duration::from_millis(self.window_poll_ms)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Per-user data directory of the bridge
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("connector-bridge")
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("connector-bridge")
            .join("config.toml")
    }

    /// Load config from the default path, or return defaults if not found
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults on any failure
    pub fn load_from(path: &Path) -> Self {
        let mut config = if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config {}: {}", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config {}: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.validate();
        config
    }

    /// Parse config from TOML text, applying the same clamping as `load`
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.validate();
        Ok(config)
    }

    /// Validate and clamp config values to acceptable ranges
    fn validate(&mut self) {
        self.host.callback_timeout_ms = self.host.callback_timeout_ms.clamp(100, 30_000);
        self.host.window_poll_ms = self.host.window_poll_ms.clamp(100, 60_000);

        // 0 switches the periodic sweep off, anything else is at least 5s
        if self.host.sweep_interval_secs != 0 {
            self.host.sweep_interval_secs = self.host.sweep_interval_secs.max(5);
        }

        self.http.timeout_ms = self.http.timeout_ms.clamp(1, 600_000);

        if self.protocol.default_locale.trim().is_empty() {
            self.protocol.default_locale = ProtocolConfig::default().default_locale;
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(path, content).map_err(|e| format!("Failed to write config file: {}", e))?;

        Ok(())
    }

    /// Save config to the default path
    pub fn save(&self) -> Result<(), String> {
        self.save_to(&Self::config_path())
    }
}
