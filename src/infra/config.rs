//! Configuration loading from TOML files
//!
//! The file is chosen by `--config`, else `CONFIG_FILE`, else `config/dev.toml`.
//! A missing or unreadable file falls back to built-in defaults so a bare
//! `sharkwatch` still starts.

use crate::domain::types::{AlertLevel, Point};
use crate::domain::zone::ZoneSpec;
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Deployment identifier included in egress payloads and metrics labels
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "sharkwatch".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_http_port() }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Enable the push session listener
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sessions_port")]
    pub port: u16,
    /// Per-channel outbound buffer; a full buffer counts as a missed delivery
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_sessions_port(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_sessions_port() -> u16 {
    8090
}

fn default_channel_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    /// Detections strictly above this confidence are `high` and get fanned out
    #[serde(default = "default_alert_confidence_threshold")]
    pub alert_confidence_threshold: f64,
    /// Detections below this confidence are stored but never alert
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default = "default_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            alert_confidence_threshold: default_alert_confidence_threshold(),
            min_confidence: 0.0,
            resolve_timeout_ms: default_timeout_ms(),
            store_timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_alert_confidence_threshold() -> f64 {
    70.0
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Zone created at startup from the config file
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneSeed {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_seed_radius")]
    pub radius: f64,
    #[serde(default)]
    pub alert_level: AlertLevel,
    #[serde(default)]
    pub beach_id: Option<String>,
    /// Seeded zones never expire unless this is set
    #[serde(default)]
    pub expires_in_hours: Option<u64>,
}

fn default_seed_radius() -> f64 {
    500.0
}

impl ZoneSeed {
    pub fn to_spec(&self, now: DateTime<Utc>) -> ZoneSpec {
        let center = Point { latitude: self.latitude, longitude: self.longitude };
        let mut spec =
            ZoneSpec::new(&self.name, center, self.radius).with_alert_level(self.alert_level);
        if let Some(beach_id) = &self.beach_id {
            spec = spec.with_beach_id(beach_id.clone());
        }
        match self.expires_in_hours {
            Some(hours) => spec.expiring_at(now + ChronoDuration::hours(hours as i64)),
            None => spec.permanent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZonesConfig {
    /// Lifetime applied to API-created zones without an explicit expiry (0 = none)
    #[serde(default = "default_zone_ttl_hours")]
    pub default_ttl_hours: u64,
    #[serde(default)]
    pub seed: Vec<ZoneSeed>,
}

impl Default for ZonesConfig {
    fn default() -> Self {
        Self { default_ttl_hours: default_zone_ttl_hours(), seed: Vec::new() }
    }
}

fn default_zone_ttl_hours() -> u64 {
    24
}

#[derive(Debug, Clone, Deserialize)]
pub struct JournalConfig {
    /// JSONL notification journal (empty to disable)
    #[serde(default = "default_journal_file")]
    pub file: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { file: default_journal_file() }
    }
}

fn default_journal_file() -> String {
    "notifications.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory for decoded inline detection images
    #[serde(default = "default_media_dir")]
    pub dir: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self { dir: default_media_dir() }
    }
}

fn default_media_dir() -> String {
    "uploads/shark-images".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Bounded queue between position ingestion and the presence worker
    #[serde(default = "default_presence_queue")]
    pub queue_size: usize,
    /// Locations kept per subject for the history endpoint
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { queue_size: default_presence_queue(), history_limit: default_history_limit() }
    }
}

fn default_presence_queue() -> usize {
    1000
}

fn default_history_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Run an embedded MQTT broker in-process
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: default_bind_address(), port: default_mqtt_port() }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self { host: default_mqtt_host(), port: default_mqtt_port(), username: None, password: None }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Mirror alerts, transitions and metrics to MQTT
    #[serde(default)]
    pub enabled: bool,
    /// Topic for published alerts (QoS 1)
    #[serde(default = "default_alerts_topic")]
    pub alerts_topic: String,
    /// Topic for zone entry/exit transitions (QoS 0)
    #[serde(default = "default_transitions_topic")]
    pub transitions_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            alerts_topic: default_alerts_topic(),
            transitions_topic: default_transitions_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_alerts_topic() -> String {
    "sharkwatch/alerts".to_string()
}

fn default_transitions_topic() -> String {
    "sharkwatch/transitions".to_string()
}

fn default_metrics_topic() -> String {
    "sharkwatch/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub zones: ZonesConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    http_bind_address: String,
    http_port: u16,
    sessions_enabled: bool,
    sessions_port: u16,
    channel_buffer: usize,
    alert_confidence_threshold: f64,
    min_confidence: f64,
    resolve_timeout_ms: u64,
    store_timeout_ms: u64,
    zone_default_ttl_hours: u64,
    zone_seeds: Vec<ZoneSeed>,
    journal_file: String,
    media_dir: String,
    presence_queue_size: usize,
    history_limit: usize,
    metrics_interval_secs: u64,
    log_json: bool,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    // MQTT Egress config
    mqtt_egress_enabled: bool,
    mqtt_egress_alerts_topic: String,
    mqtt_egress_transitions_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            site_id: toml_config.site.id,
            http_bind_address: toml_config.http.bind_address,
            http_port: toml_config.http.port,
            sessions_enabled: toml_config.sessions.enabled,
            sessions_port: toml_config.sessions.port,
            channel_buffer: toml_config.sessions.channel_buffer.max(1),
            alert_confidence_threshold: toml_config.alerting.alert_confidence_threshold,
            min_confidence: toml_config.alerting.min_confidence,
            resolve_timeout_ms: toml_config.alerting.resolve_timeout_ms,
            store_timeout_ms: toml_config.alerting.store_timeout_ms,
            zone_default_ttl_hours: toml_config.zones.default_ttl_hours,
            zone_seeds: toml_config.zones.seed,
            journal_file: toml_config.journal.file,
            media_dir: toml_config.media.dir,
            presence_queue_size: toml_config.presence.queue_size.max(1),
            history_limit: toml_config.presence.history_limit,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            log_json: toml_config.logging.json,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_alerts_topic: toml_config.mqtt_egress.alerts_topic,
            mqtt_egress_transitions_topic: toml_config.mqtt_egress.transitions_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_metrics_interval_secs: toml_config
                .mqtt_egress
                .metrics_publish_interval_secs,
            config_file,
        }
    }

    /// Pick the config path: explicit `--config`, then `CONFIG_FILE`, then the dev file
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| env::var("CONFIG_FILE").ok())
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, path.display().to_string())
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, config_file: String) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)?;
        Ok(Self::from_toml(toml_config, config_file))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}. Using defaults.", e);
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn sessions_enabled(&self) -> bool {
        self.sessions_enabled
    }

    pub fn sessions_port(&self) -> u16 {
        self.sessions_port
    }

    pub fn channel_buffer(&self) -> usize {
        self.channel_buffer
    }

    pub fn alert_confidence_threshold(&self) -> f64 {
        self.alert_confidence_threshold
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn resolve_timeout_ms(&self) -> u64 {
        self.resolve_timeout_ms
    }

    pub fn store_timeout_ms(&self) -> u64 {
        self.store_timeout_ms
    }

    /// Default lifetime for API-created zones, `None` when disabled
    pub fn zone_default_ttl(&self) -> Option<ChronoDuration> {
        (self.zone_default_ttl_hours > 0)
            .then(|| ChronoDuration::hours(self.zone_default_ttl_hours as i64))
    }

    pub fn zone_seeds(&self) -> &[ZoneSeed] {
        &self.zone_seeds
    }

    /// Journal path, `None` when journaling is disabled
    pub fn journal_file(&self) -> Option<&str> {
        (!self.journal_file.is_empty()).then_some(self.journal_file.as_str())
    }

    pub fn media_dir(&self) -> &str {
        &self.media_dir
    }

    pub fn presence_queue_size(&self) -> usize {
        self.presence_queue_size
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn log_json(&self) -> bool {
        self.log_json
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    // MQTT Egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_alerts_topic(&self) -> &str {
        &self.mqtt_egress_alerts_topic
    }

    pub fn mqtt_egress_transitions_topic(&self) -> &str {
        &self.mqtt_egress_transitions_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to override timeouts (tests and embedding)
    pub fn with_timeouts_ms(mut self, resolve_ms: u64, store_ms: u64) -> Self {
        self.resolve_timeout_ms = resolve_ms;
        self.store_timeout_ms = store_ms;
        self
    }

    /// Builder method to override or disable (`""`) the journal path
    pub fn with_journal_file(mut self, file: &str) -> Self {
        self.journal_file = file.to_string();
        self
    }

    /// Builder method to override the media directory
    pub fn with_media_dir(mut self, dir: &str) -> Self {
        self.media_dir = dir.to_string();
        self
    }
}
