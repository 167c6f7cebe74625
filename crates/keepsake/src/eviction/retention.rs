//! Adaptive retention policy
//!
//! Combines a personality-driven base level with system load, recent activity
//! and tier pressure into a retention level per tier. The eviction threshold
//! is its complement: the more the system wants to retain, the lower the score
//! a record needs to survive.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use serde::Serialize;

use crate::config::{RetentionConfig, SignalOverrides};
use crate::error::{KeepsakeError, Result};
use crate::memory::value::StrategyProfile;
use crate::storage::tiers::TierStats;

/// Result of a capacity check on one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityStatus {
    /// Below warning ratio - no action needed
    Normal,
    /// Above warning ratio but below eviction ratio
    Warning,
    /// Above eviction ratio - the tier is an eviction target
    EvictionNeeded,
    /// Above aggressive ratio - urgent eviction required
    AggressiveEvictionNeeded,
}

impl CapacityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityStatus::Normal => "normal",
            CapacityStatus::Warning => "warning",
            CapacityStatus::EvictionNeeded => "eviction_needed",
            CapacityStatus::AggressiveEvictionNeeded => "aggressive",
        }
    }
}

/// Source of the personality-driven retention base and scoring profile.
///
/// Read on every threshold computation, so changes take effect on the next
/// eviction cycle without a restart.
pub trait ProfileProvider: Send + Sync {
    /// Base retention in [0, 1]
    fn base_retention(&self) -> f32;

    fn strategy_profile(&self) -> StrategyProfile;
}

/// Fixed profile taken from configuration
#[derive(Debug, Clone, Copy)]
pub struct StaticProfile {
    base_retention: f32,
    profile: StrategyProfile,
}

impl StaticProfile {
    pub fn new(base_retention: f32, profile: StrategyProfile) -> Self {
        Self {
            base_retention,
            profile,
        }
    }
}

impl ProfileProvider for StaticProfile {
    fn base_retention(&self) -> f32 {
        self.base_retention
    }

    fn strategy_profile(&self) -> StrategyProfile {
        self.profile
    }
}

/// Profile that can be changed at runtime from any task
#[derive(Debug)]
pub struct SharedProfile {
    base_retention: AtomicU32,
    profile: AtomicU8,
}

impl SharedProfile {
    pub fn new(base_retention: f32, profile: StrategyProfile) -> Self {
        Self {
            base_retention: AtomicU32::new(base_retention.to_bits()),
            profile: AtomicU8::new(profile_code(profile)),
        }
    }

    pub fn set_base_retention(&self, value: f32) {
        self.base_retention
            .store(value.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_strategy_profile(&self, profile: StrategyProfile) {
        self.profile.store(profile_code(profile), Ordering::Relaxed);
    }
}

impl ProfileProvider for SharedProfile {
    fn base_retention(&self) -> f32 {
        f32::from_bits(self.base_retention.load(Ordering::Relaxed))
    }

    fn strategy_profile(&self) -> StrategyProfile {
        match self.profile.load(Ordering::Relaxed) {
            0 => StrategyProfile::Conservative,
            2 => StrategyProfile::Aggressive,
            _ => StrategyProfile::Balanced,
        }
    }
}

fn profile_code(profile: StrategyProfile) -> u8 {
    match profile {
        StrategyProfile::Conservative => 0,
        StrategyProfile::Balanced => 1,
        StrategyProfile::Aggressive => 2,
    }
}

/// Normalized system load in [0, 1]
pub trait SystemLoadProbe: Send + Sync {
    fn load(&self) -> f32;

    fn name(&self) -> &str;
}

/// Reports a constant load
#[derive(Debug, Clone, Copy)]
pub struct StaticLoad(pub f32);

impl SystemLoadProbe for StaticLoad {
    fn load(&self) -> f32 {
        self.0.clamp(0.0, 1.0)
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// One-minute load average divided by the number of CPUs
#[derive(Debug, Clone)]
pub struct LoadAverageProbe {
    path: PathBuf,
    cpus: f32,
    fallback: f32,
}

impl LoadAverageProbe {
    pub fn new(fallback: f32) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path: PathBuf::from("/proc/loadavg"),
            cpus: cpus as f32,
            fallback,
        }
    }

    /// Read from another file in `/proc/loadavg` format
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    fn read(&self) -> Result<f32> {
        let content = std::fs::read_to_string(&self.path)?;
        let first = content
            .split_whitespace()
            .next()
            .ok_or_else(|| KeepsakeError::General("Empty load average".to_string()))?;
        first
            .parse::<f32>()
            .map_err(|e| KeepsakeError::General(format!("Invalid load average '{first}': {e}")))
    }
}

impl SystemLoadProbe for LoadAverageProbe {
    fn load(&self) -> f32 {
        match self.read() {
            Ok(avg) => (avg / self.cpus.max(1.0)).clamp(0.0, 1.0),
            Err(e) => {
                tracing::debug!("Load average unavailable, using fallback: {}", e);
                self.fallback.clamp(0.0, 1.0)
            }
        }
    }

    fn name(&self) -> &str {
        "loadavg"
    }
}

/// Every factor that went into a threshold, for logging and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetentionFactors {
    pub base: f32,
    pub load: f32,
    pub activity: f32,
    pub pressure: f32,
    pub retention: f32,
    pub threshold: f32,
    pub status: CapacityStatus,
}

/// Computes retention levels and eviction thresholds per tier
pub struct RetentionPolicyController {
    config: RetentionConfig,
    profile: Arc<dyn ProfileProvider>,
    load_probe: Arc<dyn SystemLoadProbe>,
}

impl RetentionPolicyController {
    pub fn new(
        config: RetentionConfig,
        profile: Arc<dyn ProfileProvider>,
        load_probe: Arc<dyn SystemLoadProbe>,
    ) -> Self {
        Self {
            config,
            profile,
            load_probe,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    pub fn overrides(&self) -> SignalOverrides {
        self.config.overrides
    }

    pub fn strategy_profile(&self) -> StrategyProfile {
        self.profile.strategy_profile()
    }

    pub fn capacity_status(&self, stats: &TierStats) -> CapacityStatus {
        let ratio = stats.fill_ratio();
        if ratio >= self.config.aggressive_ratio {
            CapacityStatus::AggressiveEvictionNeeded
        } else if ratio >= self.config.eviction_ratio {
            CapacityStatus::EvictionNeeded
        } else if ratio >= self.config.warning_ratio {
            CapacityStatus::Warning
        } else {
            CapacityStatus::Normal
        }
    }

    /// Whether the scheduler should work on this tier
    pub fn is_eviction_target(&self, stats: &TierStats) -> bool {
        stats.excess() > 0 || stats.fill_ratio() >= self.config.eviction_ratio
    }

    /// Positive when the machine is idle, negative when it is busy
    pub fn load_factor(&self, load: f32) -> f32 {
        self.config.load_weight * (1.0 - 2.0 * load.clamp(0.0, 1.0))
    }

    /// Positive when the store is busy, negative when it is quiet
    pub fn activity_factor(&self, interactions: usize) -> f32 {
        let high = self.config.activity_high.max(1) as f32;
        let level = (interactions as f32 / high).min(1.0);
        self.config.activity_weight * (2.0 * level - 1.0)
    }

    /// Zero below the warning ratio, falling linearly to the maximum penalty at capacity
    pub fn pressure_factor(&self, fill_ratio: f32) -> f32 {
        let warning = self.config.warning_ratio;
        if !fill_ratio.is_finite() || fill_ratio < warning {
            return 0.0;
        }
        let span = (1.0 - warning).max(f32::EPSILON);
        let progress = ((fill_ratio - warning) / span).min(1.0);
        -self.config.max_pressure_penalty * progress
    }

    /// All factors for one tier given the current interaction count
    pub fn factors(&self, stats: &TierStats, interactions: usize) -> RetentionFactors {
        let overrides = &self.config.overrides;
        let base = overrides
            .base
            .unwrap_or_else(|| self.profile.base_retention());
        let load = overrides
            .load
            .unwrap_or_else(|| self.load_factor(self.load_probe.load()));
        let activity = overrides
            .activity
            .unwrap_or_else(|| self.activity_factor(interactions));
        let pressure = overrides
            .pressure
            .unwrap_or_else(|| self.pressure_factor(stats.fill_ratio()));

        let retention = clamp_or(
            base + load + activity + pressure,
            self.config.min_retention,
            self.config.max_retention,
        );
        let threshold = clamp_or(
            1.0 - retention,
            self.config.min_threshold,
            self.config.max_threshold,
        );

        RetentionFactors {
            base,
            load,
            activity,
            pressure,
            retention,
            threshold,
            status: self.capacity_status(stats),
        }
    }

    pub fn retention_level(&self, stats: &TierStats, interactions: usize) -> f32 {
        self.factors(stats, interactions).retention
    }

    /// Eviction cutoff: records scoring below it are candidates
    pub fn current_threshold(&self, stats: &TierStats, interactions: usize) -> f32 {
        self.factors(stats, interactions).threshold
    }
}

/// NaN collapses to the lower bound
fn clamp_or(value: f32, min: f32, max: f32) -> f32 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::TierName;

    fn stats(count: usize, capacity: usize) -> TierStats {
        TierStats {
            tier: TierName::from(TierName::WORKING),
            count,
            capacity,
            mean_score: 0.5,
            protected: 0,
            pending: 0,
        }
    }

    fn controller(config: RetentionConfig) -> RetentionPolicyController {
        RetentionPolicyController::new(
            config,
            Arc::new(StaticProfile::new(0.5, StrategyProfile::Balanced)),
            Arc::new(StaticLoad(0.5)),
        )
    }

    mod status {
        use super::*;

        #[test]
        fn test_capacity_status_bands() {
            let c = controller(RetentionConfig::default());
            assert_eq!(c.capacity_status(&stats(10, 100)), CapacityStatus::Normal);
            assert_eq!(c.capacity_status(&stats(70, 100)), CapacityStatus::Warning);
            assert_eq!(
                c.capacity_status(&stats(80, 100)),
                CapacityStatus::EvictionNeeded
            );
            assert_eq!(
                c.capacity_status(&stats(96, 100)),
                CapacityStatus::AggressiveEvictionNeeded
            );
        }

        #[test]
        fn test_eviction_target_when_over_capacity_or_ratio() {
            let c = controller(RetentionConfig::default());
            assert!(!c.is_eviction_target(&stats(50, 100)));
            assert!(c.is_eviction_target(&stats(85, 100)));
            assert!(c.is_eviction_target(&stats(3, 2)));
        }
    }

    mod factors {
        use super::*;

        #[test]
        fn test_pressure_is_zero_below_warning() {
            let c = controller(RetentionConfig::default());
            assert_eq!(c.pressure_factor(0.5), 0.0);
            assert!((c.pressure_factor(1.0) + 0.2).abs() < 1e-6);
            assert!((c.pressure_factor(1.5) + 0.2).abs() < 1e-6);
            assert!(c.pressure_factor(0.85) < 0.0 && c.pressure_factor(0.85) > -0.2);
        }

        #[test]
        fn test_load_and_activity_are_symmetric() {
            let c = controller(RetentionConfig::default());
            assert!((c.load_factor(0.0) - 0.1).abs() < 1e-6);
            assert!((c.load_factor(1.0) + 0.1).abs() < 1e-6);
            assert!(c.load_factor(0.5).abs() < 1e-6);

            assert!((c.activity_factor(0) + 0.1).abs() < 1e-6);
            assert!((c.activity_factor(500) - 0.1).abs() < 1e-6);
        }

        #[test]
        fn test_threshold_is_complement_of_retention() {
            let c = controller(RetentionConfig::default());
            let f = c.factors(&stats(10, 100), 50);
            assert!((f.retention - 0.5).abs() < 1e-6);
            assert!((f.threshold - 0.5).abs() < 1e-6);
        }

        #[test]
        fn test_threshold_stays_within_bounds() {
            let mut config = RetentionConfig::default();
            config.overrides.base = Some(5.0);
            let c = controller(config);
            let f = c.factors(&stats(0, 100), 0);
            assert_eq!(f.retention, 0.9);
            assert!((f.threshold - 0.1).abs() < 1e-6);

            let mut config = RetentionConfig::default();
            config.overrides.base = Some(f32::NAN);
            let f = controller(config).factors(&stats(0, 100), 0);
            assert_eq!(f.retention, 0.1);
            assert_eq!(f.threshold, 0.9);
        }

        #[test]
        fn test_pressure_override_raises_threshold() {
            let mut neutral = RetentionConfig::default();
            neutral.overrides.pressure = Some(0.0);
            let mut pressured = RetentionConfig::default();
            pressured.overrides.pressure = Some(-0.2);

            let full = stats(90, 100);
            let t_neutral = controller(neutral).current_threshold(&full, 50);
            let t_pressured = controller(pressured).current_threshold(&full, 50);
            assert!(t_pressured > t_neutral);
        }

        #[test]
        fn test_base_is_read_from_provider_each_time() {
            let shared = Arc::new(SharedProfile::new(0.5, StrategyProfile::Balanced));
            let c = RetentionPolicyController::new(
                RetentionConfig::default(),
                shared.clone(),
                Arc::new(StaticLoad(0.5)),
            );
            let before = c.retention_level(&stats(0, 100), 50);
            shared.set_base_retention(0.8);
            shared.set_strategy_profile(StrategyProfile::Aggressive);
            let after = c.retention_level(&stats(0, 100), 50);

            assert!(after > before);
            assert_eq!(c.strategy_profile(), StrategyProfile::Aggressive);
        }
    }

    mod probes {
        use super::*;
        use std::io::Write;

        #[test]
        fn test_load_average_probe_reads_file() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "0.00 0.10 0.20 1/100 12345").unwrap();
            let probe = LoadAverageProbe::new(0.5).with_path(file.path());
            assert_eq!(probe.load(), 0.0);
        }

        #[test]
        fn test_load_average_probe_falls_back() {
            let probe = LoadAverageProbe::new(0.3).with_path("/nonexistent/loadavg");
            assert!((probe.load() - 0.3).abs() < 1e-6);
        }
    }
}
