//! Relay configuration.
//!
//! Loaded from a JSON file (path from `RELAY_CONFIG`, default
//! `config.json`), validated into a [`RelayConfig`], then patched with a few
//! environment overrides. Secrets never live in this file; the bot token is
//! read separately by the Telegram adapter.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::pipeline::connection::ReconnectPolicy;
use crate::pipeline::dedup::DEFAULT_RETENTION;
use crate::pipeline::dispatcher::RetryPolicy;
use crate::pipeline::rules::{FilterRule, MatchMode, ReplacementRule, SourceScope};
use crate::pipeline::types::{Destination, Source};

/// Config file used when `RELAY_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Name given to the rule built from the `filters.keywords` shorthand.
pub const LEGACY_KEYWORDS_RULE: &str = "keywords";

/// Upper bound for the shutdown grace period.
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(3600);

/// Upper bound for backoff delays and send pacing.
const MAX_DELAY: Duration = Duration::from_secs(24 * 3600);

/// Upper bound for dedup retention (one year).
const MAX_RETENTION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Validated relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Monitored upstream feeds, in declaration order.
    pub sources: Vec<Source>,
    /// The single destination chat/topic.
    pub destination: Destination,
    /// When false every non-empty message passes the filter.
    pub filtering_enabled: bool,
    /// Filter rules, evaluated in this order.
    pub filter_rules: Vec<FilterRule>,
    pub replacements: Vec<ReplacementRule>,
    /// How long a forwarded (source, message id) pair is remembered.
    pub dedup_retention: Duration,
    pub dedup_max_entries: Option<usize>,
    pub retry: RetryPolicy,
    /// Minimum spacing between sends to the destination.
    pub min_send_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Time allowed for in-flight work to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Port for the health server; disabled when `None`.
    pub health_port: Option<u16>,
}

impl RelayConfig {
    /// Config with default tuning and no rules (filtering enabled).
    pub fn new(sources: Vec<Source>, destination: Destination) -> Self {
        Self {
            sources,
            destination,
            filtering_enabled: true,
            filter_rules: Vec::new(),
            replacements: Vec::new(),
            dedup_retention: DEFAULT_RETENTION,
            dedup_max_entries: Some(default_max_entries()),
            retry: RetryPolicy::default(),
            min_send_interval: Duration::from_millis(default_min_send_interval_ms()),
            reconnect: ReconnectPolicy::default(),
            shutdown_grace: Duration::from_secs(default_shutdown_grace_secs()),
            health_port: None,
        }
    }

    /// Load from the file named by `RELAY_CONFIG` and apply env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path =
            std::env::var("RELAY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::MissingRequired {
                    key: path.display().to_string(),
                    hint: "Create a config file or set RELAY_CONFIG".to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let config = Self::from_json_str(&contents)?;
        info!(
            path = %path.display(),
            sources = config.sources.len(),
            filter_rules = config.filter_rules.len(),
            replacements = config.replacements.len(),
            "Loaded relay configuration"
        );
        Ok(config)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        let config = raw.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RELAY_HEALTH_PORT` and `RELAY_SHUTDOWN_GRACE_SECS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("RELAY_HEALTH_PORT") {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| ConfigError::invalid("RELAY_HEALTH_PORT", e.to_string()))?;
            debug!(port, "Health port overridden from environment");
            self.health_port = Some(port);
        }
        if let Some(secs) = lookup("RELAY_SHUTDOWN_GRACE_SECS") {
            let secs = secs
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid("RELAY_SHUTDOWN_GRACE_SECS", e.to_string()))?;
            self.shutdown_grace = Duration::from_secs(secs);
        }
        Ok(())
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "sources".into(),
                hint: "Configure at least one source chat".into(),
            });
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(ConfigError::invalid("sources", "source id must not be empty"));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::invalid(
                    "sources",
                    format!("duplicate source id {}", source.id),
                ));
            }
        }

        if self.destination.chat_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "destination.chat_id".into(),
                hint: "Set the chat that receives forwarded messages".into(),
            });
        }

        if self.filtering_enabled && self.filter_rules.is_empty() {
            return Err(ConfigError::invalid(
                "filters",
                "filtering is enabled but no rules are configured",
            ));
        }

        for rule in &self.filter_rules {
            check_scope(&format!("filters.rules[{}]", rule.name()), rule.scope(), &seen)?;
        }
        for rule in &self.replacements {
            check_scope(
                &format!("replacements[{}]", rule.pattern()),
                rule.scope(),
                &seen,
            )?;
        }

        if self.retry.max_attempts < 1 {
            return Err(ConfigError::invalid(
                "dispatch.max_attempts",
                "must be at least 1",
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::invalid(
                "dispatch.initial_backoff_ms",
                "must not exceed dispatch.max_backoff_ms",
            ));
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(ConfigError::invalid(
                "reconnect.initial_backoff_ms",
                "must not exceed reconnect.max_backoff_ms",
            ));
        }
        if self.dedup_retention.is_zero() {
            return Err(ConfigError::invalid(
                "dedup.retention_secs",
                "must be greater than zero",
            ));
        }
        check_at_most("dispatch.max_backoff_ms", self.retry.max_backoff, MAX_DELAY)?;
        check_at_most("dispatch.min_send_interval_ms", self.min_send_interval, MAX_DELAY)?;
        check_at_most("reconnect.max_backoff_ms", self.reconnect.max_backoff, MAX_DELAY)?;
        check_at_most("shutdown_grace_secs", self.shutdown_grace, MAX_SHUTDOWN_GRACE)?;
        check_at_most("dedup.retention_secs", self.dedup_retention, MAX_RETENTION)?;
        if self.dedup_max_entries == Some(0) {
            return Err(ConfigError::invalid(
                "dedup.max_entries",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

fn check_at_most(key: &str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::invalid(
            key,
            format!("must not exceed {}s", max.as_secs()),
        ));
    }
    Ok(())
}

fn check_scope(key: &str, scope: &SourceScope, known: &HashSet<&str>) -> Result<(), ConfigError> {
    match scope.source_ids().iter().find(|id| !known.contains(id.as_str())) {
        Some(unknown) => Err(ConfigError::invalid(
            key,
            format!("scope names unknown source {unknown}"),
        )),
        None => Ok(()),
    }
}

// ── Raw (file) representation ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    sources: Vec<RawSource>,
    destination: RawDestination,
    #[serde(default)]
    filters: RawFilters,
    #[serde(default)]
    replacements: Vec<RawReplacement>,
    #[serde(default)]
    dedup: RawDedup,
    #[serde(default)]
    dispatch: RawDispatch,
    #[serde(default)]
    reconnect: RawReconnect,
    #[serde(default = "default_shutdown_grace_secs")]
    shutdown_grace_secs: u64,
    #[serde(default)]
    health_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(deserialize_with = "chat_id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDestination {
    #[serde(deserialize_with = "chat_id")]
    chat_id: String,
    #[serde(default)]
    topic_id: Option<i64>,
    #[serde(default)]
    topic_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFilters {
    #[serde(default = "enabled")]
    enabled: bool,
    #[serde(default)]
    rules: Vec<RawFilterRule>,
    /// Shorthand: one `any` rule over these keywords.
    #[serde(default)]
    keywords: Vec<String>,
    /// Applies to the `keywords` shorthand only.
    #[serde(default)]
    case_sensitive: bool,
}

impl Default for RawFilters {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
            keywords: Vec::new(),
            case_sensitive: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFilterRule {
    #[serde(default)]
    name: Option<String>,
    groups: Vec<Vec<String>>,
    #[serde(default)]
    mode: MatchMode,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    ignore_emoji: bool,
}

#[derive(Debug, Deserialize)]
struct RawReplacement {
    pattern: String,
    replacement: String,
    #[serde(default)]
    order: Option<i32>,
    #[serde(default = "enabled")]
    case_sensitive: bool,
    #[serde(default)]
    sources: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawDedup {
    #[serde(default = "default_retention_secs")]
    retention_secs: u64,
    #[serde(default = "default_max_entries_opt")]
    max_entries: Option<usize>,
}

impl Default for RawDedup {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_entries: default_max_entries_opt(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDispatch {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_dispatch_initial_ms")]
    initial_backoff_ms: u64,
    #[serde(default = "default_dispatch_max_ms")]
    max_backoff_ms: u64,
    #[serde(default = "default_min_send_interval_ms")]
    min_send_interval_ms: u64,
}

impl Default for RawDispatch {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_dispatch_initial_ms(),
            max_backoff_ms: default_dispatch_max_ms(),
            min_send_interval_ms: default_min_send_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    #[serde(default = "default_reconnect_initial_ms")]
    initial_backoff_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    max_backoff_ms: u64,
}

impl Default for RawReconnect {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_reconnect_initial_ms(),
            max_backoff_ms: default_reconnect_max_ms(),
        }
    }
}

fn enabled() -> bool {
    true
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION.as_secs()
}
fn default_max_entries() -> usize {
    10_000
}
fn default_max_entries_opt() -> Option<usize> {
    Some(default_max_entries())
}
fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}
fn default_dispatch_initial_ms() -> u64 {
    RetryPolicy::default().initial_backoff.as_millis() as u64
}
fn default_dispatch_max_ms() -> u64 {
    RetryPolicy::default().max_backoff.as_millis() as u64
}
fn default_min_send_interval_ms() -> u64 {
    1_000
}
fn default_reconnect_initial_ms() -> u64 {
    ReconnectPolicy::default().initial_backoff.as_millis() as u64
}
fn default_reconnect_max_ms() -> u64 {
    ReconnectPolicy::default().max_backoff.as_millis() as u64
}

/// Telegram chat ids show up both as numbers and as strings.
fn chat_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Int(i64),
        Str(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Int(n) => n.to_string(),
        Id::Str(s) => s.trim().to_string(),
    })
}

impl RawConfig {
    fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let sources = self
            .sources
            .into_iter()
            .map(|s| {
                let name = s.name.unwrap_or_else(|| s.id.clone());
                Source::new(s.id, name)
            })
            .collect();

        let mut destination = Destination::chat(self.destination.chat_id);
        if let Some(topic_id) = self.destination.topic_id {
            destination = destination.with_topic(topic_id, self.destination.topic_name);
        }

        let mut filter_rules = Vec::with_capacity(self.filters.rules.len() + 1);
        for (i, raw) in self.filters.rules.into_iter().enumerate() {
            let name = raw.name.unwrap_or_else(|| format!("rule-{}", i + 1));
            let rule = FilterRule::new(name, raw.groups, raw.mode, raw.case_sensitive)?
                .scoped_to(SourceScope::from_ids(raw.sources))
                .ignoring_emoji(raw.ignore_emoji);
            filter_rules.push(rule);
        }
        if !self.filters.keywords.is_empty() {
            let rule = FilterRule::new(
                LEGACY_KEYWORDS_RULE,
                vec![self.filters.keywords],
                MatchMode::Any,
                self.filters.case_sensitive,
            )?
            .ignoring_emoji(true);
            filter_rules.push(rule);
        }

        let mut replacements = Vec::with_capacity(self.replacements.len());
        for (i, raw) in self.replacements.into_iter().enumerate() {
            let order = raw.order.unwrap_or(i as i32);
            let mut rule = ReplacementRule::new(raw.pattern, raw.replacement, order)?
                .scoped_to(SourceScope::from_ids(raw.sources));
            if !raw.case_sensitive {
                rule = rule.case_insensitive()?;
            }
            replacements.push(rule);
        }

        Ok(RelayConfig {
            sources,
            destination,
            filtering_enabled: self.filters.enabled,
            filter_rules,
            replacements,
            dedup_retention: Duration::from_secs(self.dedup.retention_secs),
            dedup_max_entries: self.dedup.max_entries,
            retry: RetryPolicy {
                max_attempts: self.dispatch.max_attempts,
                initial_backoff: Duration::from_millis(self.dispatch.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.dispatch.max_backoff_ms),
            },
            min_send_interval: Duration::from_millis(self.dispatch.min_send_interval_ms),
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(self.reconnect.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.reconnect.max_backoff_ms),
            },
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            health_port: self.health_port,
        })
    }
}
