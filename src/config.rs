use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub monitoring: MonitoringConfig,
    pub trust: TrustConfig,
    pub alerts: AlertConfig,
    pub integrity: IntegrityConfig,
    pub cache: CacheConfig,
    pub retention: RetentionConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub enable_sri_validation: bool,
    /// Store id → store origin URL, used for same-origin partitioning.
    pub store_urls: HashMap<String, String>,
    /// Pages the scheduled scan path visits.
    pub monitored_pages: Vec<String>,
    /// Substrings identifying bundled local libraries.
    pub local_library_patterns: Vec<String>,
    /// Marker identifying the monitoring agent's own script.
    pub agent_script_marker: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrustConfig {
    /// Hosts allowed limited auto-remediation (digest auto-adoption).
    pub trusted_domains: Vec<String>,
    /// Keywords marking a URL as payment-provider-related.
    pub payment_providers: Vec<String>,
    /// Whether trusted domains may have a missing digest adopted automatically.
    pub allow_auto_update: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub enable_notifications: bool,
    /// Trailing window within which a same-(type, script, page) alert is a duplicate.
    pub dedup_window_hours: u64,
    /// Minimum hours between notifications for similar alerts.
    pub max_alert_frequency_hours: u64,
    /// Minimum seconds between any two desktop notifications.
    pub notification_cooldown_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IntegrityConfig {
    pub default_algorithm: String,
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub expiration_minutes: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days after which an unverified script counts as expired.
    pub verification_expiry_days: u64,
    pub log_retention_days: u64,
    pub alert_retention_days: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitoring: MonitoringConfig::default(),
            trust: TrustConfig::default(),
            alerts: AlertConfig::default(),
            integrity: IntegrityConfig::default(),
            cache: CacheConfig::default(),
            retention: RetentionConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enable_sri_validation: true,
            store_urls: HashMap::new(),
            monitored_pages: vec![
                "/checkout".into(),
                "/onepagecheckout".into(),
                "/cart".into(),
            ],
            local_library_patterns: vec![
                "/lib/".into(),
                "/js/".into(),
                "/scripts/".into(),
                "/assets/".into(),
                "lib_npm".into(),
                "jquery.min.js".into(),
                "jquery-ui.min.js".into(),
                "jquery.validate".into(),
                "jquery-migrate".into(),
                "bootstrap.min.js".into(),
                "bootstrap.bundle.min.js".into(),
            ],
            agent_script_marker: "scriptguard".into(),
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trusted_domains: Vec::new(),
            payment_providers: vec![
                "stripe".into(),
                "paypal".into(),
                "braintree".into(),
                "adyen".into(),
                "klarna".into(),
                "checkout.com".into(),
            ],
            allow_auto_update: true,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enable_notifications: true,
            dedup_window_hours: 1,
            max_alert_frequency_hours: 24,
            notification_cooldown_seconds: 30,
        }
    }
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            default_algorithm: "sha384".into(),
            fetch_timeout_secs: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiration_minutes: 60,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            verification_expiry_days: 30,
            log_retention_days: 90,
            alert_retention_days: 30,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/scriptguard.db".into(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Origin URL configured for a store, if any.
    pub fn store_url(&self, store_id: i64) -> Option<&str> {
        self.monitoring
            .store_urls
            .get(&store_id.to_string())
            .map(String::as_str)
    }

    /// Store ids with a configured origin, for scheduled maintenance sweeps.
    pub fn store_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .monitoring
            .store_urls
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.integrity.fetch_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.expiration_minutes * 60)
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.alerts.dedup_window_hours as i64)
    }
}
