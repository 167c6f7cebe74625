use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{KeepsakeError, Result};
use crate::memory::types::TierName;
use crate::memory::value::{ScoringWeights, StrategyProfile};

/// Longest span any time-window setting may describe
pub const MAX_WINDOW_DAYS: i64 = 36_500;
const MAX_WINDOW_SECS: i64 = MAX_WINDOW_DAYS * 86_400;

/// A window setting in seconds as a `chrono::Duration`, clamped to
/// `[0, MAX_WINDOW_DAYS]` so date arithmetic on it cannot overflow
pub fn window_secs(secs: i64) -> chrono::Duration {
    chrono::Duration::seconds(secs.clamp(0, MAX_WINDOW_SECS))
}

/// Main configuration structure for Keepsake
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Data directory and persistence
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retention tiers, in lock order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
    /// Tier classification and promotion
    #[serde(default)]
    pub tiering: TieringConfig,
    /// Value scoring
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Adaptive retention thresholds
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Background eviction cycle
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Backup retention
    #[serde(default)]
    pub backup: BackupConfig,
    /// Human-in-the-loop confirmation
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    /// Retrieval ranking
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Vector index backend
    #[serde(default)]
    pub vector: VectorConfig,
    /// Embedding provider
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            tiers: default_tiers(),
            tiering: TieringConfig::default(),
            scoring: ScoringConfig::default(),
            retention: RetentionConfig::default(),
            scheduler: SchedulerConfig::default(),
            backup: BackupConfig::default(),
            confirmation: ConfirmationConfig::default(),
            retrieval: RetrievalConfig::default(),
            vector: VectorConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path or the default locations.
    ///
    /// Lookup order: `path`, `~/.keepsake/config.toml`,
    /// `$XDG_CONFIG_HOME/keepsake/config.toml`, `./config.toml`.
    /// Falls back to defaults when no file exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".keepsake").join("config.toml")),
            dirs::config_dir().map(|c| c.join("keepsake").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for candidate in default_paths.iter().flatten() {
            if candidate.exists() {
                tracing::info!("Loading config from: {}", candidate.display());
                return Self::from_file(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KeepsakeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| KeepsakeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a tier by name
    pub fn tier(&self, name: &TierName) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| &t.name == name)
    }

    pub fn has_tier(&self, name: &TierName) -> bool {
        self.tier(name).is_some()
    }

    /// Reject configurations that would break store invariants
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(KeepsakeError::Config(
                "At least one tier must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tier in &self.tiers {
            if !names.insert(tier.name.clone()) {
                return Err(KeepsakeError::Config(format!(
                    "Tier '{}' is defined more than once",
                    tier.name
                )));
            }
            if tier.capacity == 0 {
                return Err(KeepsakeError::Config(format!(
                    "Tier '{}' must have a capacity above zero",
                    tier.name
                )));
            }
        }

        for tier in &self.tiers {
            for target in [&tier.promote_to, &tier.demote_to].into_iter().flatten() {
                if !names.contains(target) {
                    return Err(KeepsakeError::Config(format!(
                        "Tier '{}' refers to unknown tier '{}'",
                        tier.name, target
                    )));
                }
                if target == &tier.name {
                    return Err(KeepsakeError::Config(format!(
                        "Tier '{}' cannot move records to itself",
                        tier.name
                    )));
                }
            }
        }

        if !names.contains(&self.tiering.default_tier) {
            return Err(KeepsakeError::Config(format!(
                "Default tier '{}' is not configured",
                self.tiering.default_tier
            )));
        }

        let r = &self.retention;
        if !(0.0..=1.0).contains(&r.min_retention)
            || !(0.0..=1.0).contains(&r.max_retention)
            || r.min_retention > r.max_retention
        {
            return Err(KeepsakeError::Config(
                "Retention bounds must satisfy 0 <= min_retention <= max_retention <= 1".to_string(),
            ));
        }
        if r.min_threshold > r.max_threshold {
            return Err(KeepsakeError::Config(
                "min_threshold must not exceed max_threshold".to_string(),
            ));
        }
        if !(r.warning_ratio < r.eviction_ratio && r.eviction_ratio < r.aggressive_ratio) {
            return Err(KeepsakeError::Config(
                "Capacity ratios must satisfy warning < eviction < aggressive".to_string(),
            ));
        }

        self.scoring.profiles.conservative.validate("conservative")?;
        self.scoring.profiles.balanced.validate("balanced")?;
        self.scoring.profiles.aggressive.validate("aggressive")?;

        if self.scheduler.batch_size == 0 {
            return Err(KeepsakeError::Config(
                "scheduler.batch_size must be above zero".to_string(),
            ));
        }
        if self.confirmation.channel_capacity == 0 {
            return Err(KeepsakeError::Config(
                "confirmation.channel_capacity must be above zero".to_string(),
            ));
        }
        let windows = [
            (
                "tiering.promotion_window_hours",
                self.tiering.promotion_window_hours.saturating_mul(3_600),
            ),
            (
                "retention.activity_window_secs",
                i64::try_from(self.retention.activity_window_secs).unwrap_or(i64::MAX),
            ),
            ("scheduler.staleness_secs", self.scheduler.staleness_secs),
            ("backup.ttl_days", self.backup.ttl_days.saturating_mul(86_400)),
            ("confirmation.deadline_secs", self.confirmation.deadline_secs),
            (
                "confirmation.denial_cooldown_secs",
                self.confirmation.denial_cooldown_secs,
            ),
        ];
        for (name, secs) in windows {
            if !(0..=MAX_WINDOW_SECS).contains(&secs) {
                return Err(KeepsakeError::Config(format!(
                    "{name} must span between zero and {MAX_WINDOW_DAYS} days"
                )));
            }
        }

        if self.vector.dimension == 0 {
            return Err(KeepsakeError::Config(
                "vector.dimension must be above zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Persist records to LanceDB; when false everything lives in memory
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// zstd-compress record and backup payloads
    #[serde(default = "default_compress_payloads")]
    pub compress_payloads: bool,
    /// Environment variable holding a base64 32-byte payload key; unset means
    /// payloads are stored unencrypted
    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist: default_persist(),
            compress_payloads: default_compress_payloads(),
            encryption_key_env: default_encryption_key_env(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".keepsake"))
        .unwrap_or_else(|| PathBuf::from(".keepsake"))
}

fn default_persist() -> bool {
    true
}

fn default_compress_payloads() -> bool {
    true
}

fn default_encryption_key_env() -> String {
    "KEEPSAKE_STORE_KEY".to_string()
}

/// A single retention tier
#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub name: TierName,
    /// Maximum number of records after a completed eviction cycle
    pub capacity: usize,
    /// Tier that frequently accessed records move up to
    #[serde(default)]
    pub promote_to: Option<TierName>,
    /// Tier that `demote` moves records down to
    #[serde(default)]
    pub demote_to: Option<TierName>,
}

impl TierConfig {
    pub fn new(name: impl Into<TierName>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            promote_to: None,
            demote_to: None,
        }
    }

    pub fn promote_to(mut self, tier: impl Into<TierName>) -> Self {
        self.promote_to = Some(tier.into());
        self
    }

    pub fn demote_to(mut self, tier: impl Into<TierName>) -> Self {
        self.demote_to = Some(tier.into());
        self
    }
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new(TierName::WORKING, 50).promote_to(TierName::SHORT_TERM),
        TierConfig::new(TierName::SHORT_TERM, 500)
            .promote_to(TierName::LONG_TERM)
            .demote_to(TierName::WORKING),
        TierConfig::new(TierName::LONG_TERM, 5000).demote_to(TierName::SHORT_TERM),
        TierConfig::new(TierName::EPISODIC, 1000),
    ]
}

/// Tier classification and promotion settings
#[derive(Debug, Clone, Deserialize)]
pub struct TieringConfig {
    /// Tier for records nothing else matches
    #[serde(default = "default_default_tier")]
    pub default_tier: TierName,
    /// Tier for `MemoryKind::Episodic` records
    #[serde(default = "default_episodic_tier")]
    pub episodic_tier: TierName,
    /// Tier for long or explicitly important content
    #[serde(default = "default_long_term_tier")]
    pub long_term_tier: TierName,
    /// Phrases that route content to the long-term tier
    #[serde(default = "default_long_term_keywords")]
    pub long_term_keywords: Vec<String>,
    /// Content longer than this goes to the long-term tier
    #[serde(default = "default_long_content_chars")]
    pub long_content_chars: usize,
    /// Accesses inside the window that trigger promotion
    #[serde(default = "default_promotion_threshold")]
    pub promotion_threshold: u32,
    #[serde(default = "default_promotion_window_hours")]
    pub promotion_window_hours: i64,
    /// `link` also records the reverse edge
    #[serde(default = "default_symmetric_relations")]
    pub symmetric_relations: bool,
    /// Reject stores into a full tier instead of accepting the overflow
    #[serde(default)]
    pub synchronous_eviction: bool,
    /// Records over capacity before the store wakes the scheduler
    #[serde(default = "default_overflow_slack")]
    pub overflow_slack: usize,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            default_tier: default_default_tier(),
            episodic_tier: default_episodic_tier(),
            long_term_tier: default_long_term_tier(),
            long_term_keywords: default_long_term_keywords(),
            long_content_chars: default_long_content_chars(),
            promotion_threshold: default_promotion_threshold(),
            promotion_window_hours: default_promotion_window_hours(),
            symmetric_relations: default_symmetric_relations(),
            synchronous_eviction: false,
            overflow_slack: default_overflow_slack(),
        }
    }
}

fn default_default_tier() -> TierName {
    TierName::from(TierName::WORKING)
}

fn default_episodic_tier() -> TierName {
    TierName::from(TierName::EPISODIC)
}

fn default_long_term_tier() -> TierName {
    TierName::from(TierName::LONG_TERM)
}

fn default_long_term_keywords() -> Vec<String> {
    ["remember", "important", "never forget", "always", "learned"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_long_content_chars() -> usize {
    500
}

fn default_promotion_threshold() -> u32 {
    5
}

fn default_promotion_window_hours() -> i64 {
    24
}

fn default_symmetric_relations() -> bool {
    true
}

fn default_overflow_slack() -> usize {
    10
}

/// Value scoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Profile used when the profile provider does not choose one
    #[serde(default)]
    pub strategy: StrategyProfile,
    /// Per-profile factor weights
    #[serde(default)]
    pub profiles: ProfileWeights,
    /// Static weight per content kind
    #[serde(default)]
    pub kind_weights: KindWeights,
    #[serde(default = "default_access_half_life_hours")]
    pub access_half_life_hours: f32,
    /// Access count at which the frequency term saturates
    #[serde(default = "default_frequency_saturation")]
    pub frequency_saturation: u32,
    /// `k` in the relational factor n / (n + k)
    #[serde(default = "default_relation_saturation")]
    pub relation_saturation: f32,
    /// Context relevance used when there is no active context
    #[serde(default = "default_neutral_relevance")]
    pub neutral_relevance: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyProfile::default(),
            profiles: ProfileWeights::default(),
            kind_weights: KindWeights::default(),
            access_half_life_hours: default_access_half_life_hours(),
            frequency_saturation: default_frequency_saturation(),
            relation_saturation: default_relation_saturation(),
            neutral_relevance: default_neutral_relevance(),
        }
    }
}

fn default_access_half_life_hours() -> f32 {
    24.0
}

fn default_frequency_saturation() -> u32 {
    20
}

fn default_relation_saturation() -> f32 {
    3.0
}

fn default_neutral_relevance() -> f32 {
    0.5
}

/// Factor weights for each strategy profile
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProfileWeights {
    #[serde(default = "default_conservative_weights")]
    pub conservative: ScoringWeights,
    #[serde(default = "default_balanced_weights")]
    pub balanced: ScoringWeights,
    #[serde(default = "default_aggressive_weights")]
    pub aggressive: ScoringWeights,
}

impl Default for ProfileWeights {
    fn default() -> Self {
        Self {
            conservative: default_conservative_weights(),
            balanced: default_balanced_weights(),
            aggressive: default_aggressive_weights(),
        }
    }
}

fn default_conservative_weights() -> ScoringWeights {
    StrategyProfile::Conservative.default_weights()
}

fn default_balanced_weights() -> ScoringWeights {
    StrategyProfile::Balanced.default_weights()
}

fn default_aggressive_weights() -> ScoringWeights {
    StrategyProfile::Aggressive.default_weights()
}

/// Static type weight per content kind
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct KindWeights {
    #[serde(default = "default_episodic_weight")]
    pub episodic: f32,
    #[serde(default = "default_semantic_weight")]
    pub semantic: f32,
    #[serde(default = "default_procedural_weight")]
    pub procedural: f32,
    #[serde(default = "default_dialogue_weight")]
    pub dialogue: f32,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            episodic: default_episodic_weight(),
            semantic: default_semantic_weight(),
            procedural: default_procedural_weight(),
            dialogue: default_dialogue_weight(),
        }
    }
}

fn default_episodic_weight() -> f32 {
    0.8
}

fn default_semantic_weight() -> f32 {
    0.7
}

fn default_procedural_weight() -> f32 {
    0.6
}

fn default_dialogue_weight() -> f32 {
    0.4
}

/// Adaptive retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Base retention for the static profile provider
    #[serde(default = "default_base_retention")]
    pub base_retention: f32,
    #[serde(default = "default_min_retention")]
    pub min_retention: f32,
    #[serde(default = "default_max_retention")]
    pub max_retention: f32,
    #[serde(default = "default_min_threshold")]
    pub min_threshold: f32,
    #[serde(default = "default_max_threshold")]
    pub max_threshold: f32,
    /// Count/capacity ratio where pressure starts
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f32,
    /// Ratio where a tier becomes an eviction target
    #[serde(default = "default_eviction_ratio")]
    pub eviction_ratio: f32,
    #[serde(default = "default_aggressive_ratio")]
    pub aggressive_ratio: f32,
    /// Most negative pressure factor, reached at full capacity
    #[serde(default = "default_max_pressure_penalty")]
    pub max_pressure_penalty: f32,
    /// Magnitude of the load factor
    #[serde(default = "default_signal_weight")]
    pub load_weight: f32,
    /// Magnitude of the activity factor
    #[serde(default = "default_signal_weight")]
    pub activity_weight: f32,
    #[serde(default = "default_activity_window_secs")]
    pub activity_window_secs: u64,
    /// Interactions per window considered high activity
    #[serde(default = "default_activity_high")]
    pub activity_high: u32,
    /// Load probe plugin name (`static` or `loadavg`)
    #[serde(default = "default_load_probe")]
    pub load_probe: String,
    /// Load reported by the `static` probe
    #[serde(default = "default_static_load")]
    pub static_load: f32,
    /// Forced factor values for simulation
    #[serde(default)]
    pub overrides: SignalOverrides,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            base_retention: default_base_retention(),
            min_retention: default_min_retention(),
            max_retention: default_max_retention(),
            min_threshold: default_min_threshold(),
            max_threshold: default_max_threshold(),
            warning_ratio: default_warning_ratio(),
            eviction_ratio: default_eviction_ratio(),
            aggressive_ratio: default_aggressive_ratio(),
            max_pressure_penalty: default_max_pressure_penalty(),
            load_weight: default_signal_weight(),
            activity_weight: default_signal_weight(),
            activity_window_secs: default_activity_window_secs(),
            activity_high: default_activity_high(),
            load_probe: default_load_probe(),
            static_load: default_static_load(),
            overrides: SignalOverrides::default(),
        }
    }
}

fn default_base_retention() -> f32 {
    0.5
}

fn default_min_retention() -> f32 {
    0.1
}

fn default_max_retention() -> f32 {
    0.9
}

fn default_min_threshold() -> f32 {
    0.1
}

fn default_max_threshold() -> f32 {
    0.9
}

fn default_warning_ratio() -> f32 {
    0.70
}

fn default_eviction_ratio() -> f32 {
    0.80
}

fn default_aggressive_ratio() -> f32 {
    0.95
}

fn default_max_pressure_penalty() -> f32 {
    0.2
}

fn default_signal_weight() -> f32 {
    0.1
}

fn default_activity_window_secs() -> u64 {
    3600
}

fn default_activity_high() -> u32 {
    100
}

fn default_load_probe() -> String {
    "static".to_string()
}

fn default_static_load() -> f32 {
    0.5
}

/// Fixed retention factors, replacing the live signal when set
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SignalOverrides {
    #[serde(default)]
    pub base: Option<f32>,
    #[serde(default)]
    pub load: Option<f32>,
    #[serde(default)]
    pub activity: Option<f32>,
    #[serde(default)]
    pub pressure: Option<f32>,
}

/// Eviction scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Run the background task at all
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Shorten the interval as the store grows
    #[serde(default = "default_adaptive_interval")]
    pub adaptive_interval: bool,
    /// Seconds removed from the interval per stored record
    #[serde(default = "default_interval_step_secs")]
    pub interval_step_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Scores older than this are recomputed
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    /// Minimum discretionary evictions allowed per tier per cycle
    #[serde(default = "default_discretionary_floor")]
    pub discretionary_floor: usize,
    /// Fraction of live records that may be evicted at discretion per cycle
    #[serde(default = "default_discretionary_fraction")]
    pub discretionary_fraction: f32,
    /// Queue entries whose score drifted further than this are reinserted
    #[serde(default = "default_requeue_tolerance")]
    pub requeue_tolerance: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            interval_secs: default_interval_secs(),
            min_interval_secs: default_min_interval_secs(),
            adaptive_interval: default_adaptive_interval(),
            interval_step_secs: default_interval_step_secs(),
            batch_size: default_batch_size(),
            staleness_secs: default_staleness_secs(),
            discretionary_floor: default_discretionary_floor(),
            discretionary_fraction: default_discretionary_fraction(),
            requeue_tolerance: default_requeue_tolerance(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_min_interval_secs() -> u64 {
    60
}

fn default_adaptive_interval() -> bool {
    true
}

fn default_interval_step_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_staleness_secs() -> i64 {
    900
}

fn default_discretionary_floor() -> usize {
    10
}

fn default_discretionary_fraction() -> f32 {
    0.1
}

fn default_requeue_tolerance() -> f32 {
    0.01
}

/// Backup retention configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BackupConfig {
    /// Backups older than this are purged
    #[serde(default = "default_backup_ttl_days")]
    pub ttl_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_backup_ttl_days(),
        }
    }
}

fn default_backup_ttl_days() -> i64 {
    30
}

/// Decision applied when nobody answers a confirmation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    #[default]
    Approve,
    Deny,
}

/// Confirmation gate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_enabled")]
    pub enabled: bool,
    /// Scores within this distance of the threshold are borderline
    #[serde(default = "default_borderline_band")]
    pub borderline_band: f32,
    /// Relational factor at or above which deletion needs confirmation
    #[serde(default = "default_high_relational_weight")]
    pub high_relational_weight: f32,
    /// How long the gate waits for a quick answer
    #[serde(default = "default_inline_wait_ms")]
    pub inline_wait_ms: u64,
    /// Time a decider has before the default policy applies
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: i64,
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    /// How long a denial shields a record from new requests
    #[serde(default = "default_denial_cooldown_secs")]
    pub denial_cooldown_secs: i64,
    #[serde(default = "default_denial_cache_size")]
    pub denial_cache_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            enabled: default_confirmation_enabled(),
            borderline_band: default_borderline_band(),
            high_relational_weight: default_high_relational_weight(),
            inline_wait_ms: default_inline_wait_ms(),
            deadline_secs: default_deadline_secs(),
            default_policy: DefaultPolicy::default(),
            denial_cooldown_secs: default_denial_cooldown_secs(),
            denial_cache_size: default_denial_cache_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_confirmation_enabled() -> bool {
    true
}

fn default_borderline_band() -> f32 {
    0.05
}

fn default_high_relational_weight() -> f32 {
    0.5
}

fn default_inline_wait_ms() -> u64 {
    200
}

fn default_deadline_secs() -> i64 {
    300
}

fn default_denial_cooldown_secs() -> i64 {
    3600
}

fn default_denial_cache_size() -> usize {
    1024
}

fn default_channel_capacity() -> usize {
    64
}

/// Retrieval ranking configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f32,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f32,
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f32,
    /// Vector candidates fetched per requested result
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Vector matches below this similarity are ignored
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    /// Count returned records as accessed
    #[serde(default = "default_touch_results")]
    pub touch_results: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            relevance_weight: default_relevance_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_hours: default_recency_half_life_hours(),
            candidate_multiplier: default_candidate_multiplier(),
            min_similarity: default_min_similarity(),
            touch_results: default_touch_results(),
        }
    }
}

fn default_relevance_weight() -> f32 {
    0.7
}

fn default_recency_weight() -> f32 {
    0.3
}

fn default_recency_half_life_hours() -> f32 {
    24.0
}

fn default_candidate_multiplier() -> usize {
    2
}

fn default_min_similarity() -> f32 {
    0.1
}

fn default_touch_results() -> bool {
    true
}

/// Vector index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VectorConfig {
    /// Backend plugin name (`memory`, `lance`, or `none`)
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_vector_dimension")]
    pub dimension: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            dimension: default_vector_dimension(),
        }
    }
}

fn default_vector_backend() -> String {
    "memory".to_string()
}

fn default_vector_dimension() -> usize {
    384
}

/// Embedding provider configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedder plugin name (`hash`, or `fastembed` with that feature)
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.tiers.len(), 4);
        assert_eq!(
            config.tier(&TierName::from("working")).map(|t| t.capacity),
            Some(50)
        );
        assert_eq!(config.tiering.default_tier.as_str(), TierName::WORKING);
        assert_eq!(config.tiering.long_content_chars, 500);
        assert_eq!(config.tiering.promotion_threshold, 5);
        assert!(!config.tiering.synchronous_eviction);
        assert_eq!(config.scoring.strategy, StrategyProfile::Balanced);
        assert_eq!(config.retention.base_retention, 0.5);
        assert_eq!(config.scheduler.interval_secs, 3600);
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.backup.ttl_days, 30);
        assert_eq!(config.confirmation.default_policy, DefaultPolicy::Approve);
        assert_eq!(config.retrieval.relevance_weight, 0.7);
        assert_eq!(config.vector.backend, "memory");
        assert_eq!(config.embedding.provider, "hash");
        config.validate().expect("default config should be valid");
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/keepsake"
persist = false

[[tiers]]
name = "working"
capacity = 20
promote_to = "archive"

[[tiers]]
name = "archive"
capacity = 200
demote_to = "working"

[tiering]
default_tier = "working"
synchronous_eviction = true

[scoring]
strategy = "aggressive"

[scoring.profiles.aggressive]
type_weight = 0.1
access_frequency = 0.5
context_relevance = 0.3
relational_weight = 0.1

[retention]
base_retention = 0.8

[retention.overrides]
pressure = -0.2

[confirmation]
default_policy = "deny"
inline_wait_ms = 50

[vector]
backend = "lance"
dimension = 64
"#;

        let config = Config::from_toml_str(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/keepsake"));
        assert!(!config.storage.persist);
        assert_eq!(config.tiers.len(), 2);
        assert_eq!(
            config.tiers[0].promote_to,
            Some(TierName::from("archive"))
        );
        assert!(config.tiering.synchronous_eviction);
        assert_eq!(config.scoring.strategy, StrategyProfile::Aggressive);
        assert_eq!(config.scoring.profiles.aggressive.access_frequency, 0.5);
        assert_eq!(config.retention.base_retention, 0.8);
        assert_eq!(config.retention.overrides.pressure, Some(-0.2));
        assert!(config.retention.overrides.load.is_none());
        assert_eq!(config.confirmation.default_policy, DefaultPolicy::Deny);
        assert_eq!(config.confirmation.inline_wait_ms, 50);
        assert_eq!(config.vector.backend, "lance");
        assert_eq!(config.vector.dimension, 64);
    }

    #[test]
    fn test_toml_partial_deserialization() {
        let toml_str = r#"
[scheduler]
interval_secs = 120
"#;

        let config = Config::from_toml_str(toml_str).expect("Failed to parse partial TOML");

        assert_eq!(config.scheduler.interval_secs, 120);
        assert_eq!(config.scheduler.min_interval_secs, 60);
        assert_eq!(config.tiers.len(), 4);
        assert_eq!(config.retrieval.candidate_multiplier, 2);
    }

    #[test]
    fn test_rejects_unknown_promotion_target() {
        let toml_str = r#"
[[tiers]]
name = "working"
capacity = 10
promote_to = "nowhere"
"#;

        let err = Config::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("nowhere"), "got: {err}");
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let toml_str = r#"
[scoring.profiles.balanced]
type_weight = 0.5
access_frequency = 0.5
context_relevance = 0.5
relational_weight = 0.5
"#;

        assert!(Config::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn test_rejects_duplicate_tiers() {
        let mut config = Config::default();
        config.tiers.push(TierConfig::new(TierName::WORKING, 10));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_default_tier() {
        let mut config = Config::default();
        config.tiering.default_tier = TierName::from("scratch");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unbounded_windows() {
        let mut config = Config::default();
        config.backup.ttl_days = i64::MAX;
        assert!(matches!(config.validate(), Err(KeepsakeError::Config(_))));

        let mut config = Config::default();
        config.confirmation.deadline_secs = -1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tiering.promotion_window_hours = i64::MAX / 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retention.activity_window_secs = u64::MAX;
        assert!(config.validate().is_err());

        let err = Config::from_toml_str("[scheduler]\nstaleness_secs = 9223372036854775807\n")
            .unwrap_err();
        assert!(err.to_string().contains("scheduler.staleness_secs"), "got: {err}");
    }

    #[test]
    fn test_window_secs_clamps() {
        assert_eq!(window_secs(-5), chrono::Duration::zero());
        assert_eq!(window_secs(90), chrono::Duration::seconds(90));
        assert_eq!(
            window_secs(i64::MAX),
            chrono::Duration::days(MAX_WINDOW_DAYS)
        );
        let _ = chrono::Utc::now() + window_secs(i64::MAX);
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\nttl_days = 7\n").expect("write config");

        let config = Config::load(Some(&path)).expect("load config");
        assert_eq!(config.backup.ttl_days, 7);
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/keepsake.toml")));
        assert!(result.is_err());
    }
}
