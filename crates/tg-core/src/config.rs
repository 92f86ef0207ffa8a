use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GovernError, Result};
use crate::types::{Feature, Operation, QuotaWindow, RateCeiling, ResourceDimension, Tier};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default = "default_tiers")]
    pub tiers: HashMap<Tier, TierPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity after which an active session becomes idle.
    pub idle_after_secs: u64,
    /// Total inactivity after which an idle session expires.
    pub expire_after_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub dimension: usize,
    /// "cosine", "l2" or "ip".
    pub metric: String,
    pub importance_weight: f32,
    pub recency_weight: f32,
    pub recency_half_life_secs: u64,
    /// Where closed sessions leave their memory for the user's next session.
    /// Unset keeps memory in-process only.
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Pending events per subscriber before coalescing kicks in.
    pub subscriber_buffer: usize,
    /// Finished streams kept per session for late subscribers.
    pub retain_finished: usize,
    pub subscribe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub limit: u64,
    pub window: QuotaWindow,
}

/// Everything a tier grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    pub quotas: BTreeMap<ResourceDimension, QuotaPolicy>,
    pub rate: Vec<RateCeiling>,
    #[serde(default)]
    pub rate_overrides: HashMap<Operation, Vec<RateCeiling>>,
    pub max_concurrent_per_operation: usize,
    pub features: BTreeSet<Feature>,
    pub memory_capacity: usize,
}

impl TierPolicy {
    pub fn for_tier(tier: Tier) -> Self {
        // calls/day, tokens/day, storage, bandwidth/day, concurrent, per-op concurrent,
        // rate s/min/h/day, memory capacity
        let (calls, tokens, storage, bandwidth, concurrent, per_op, rate, capacity) = match tier {
            Tier::Free => (100, 10_000, 10 * MIB, 50 * MIB, 2, 1, [2, 20, 200, 1_000], 256),
            Tier::Basic => (1_000, 100_000, 100 * MIB, 500 * MIB, 4, 2, [5, 60, 1_000, 10_000], 1_024),
            Tier::Pro => (10_000, 1_000_000, GIB, 5 * GIB, 8, 4, [10, 300, 5_000, 50_000], 4_096),
            Tier::Enterprise => (
                100_000,
                10_000_000,
                10 * GIB,
                50 * GIB,
                32,
                16,
                [50, 1_000, 20_000, 200_000],
                16_384,
            ),
        };

        let mut quotas = BTreeMap::new();
        quotas.insert(ResourceDimension::ApiCalls, QuotaPolicy { limit: calls, window: QuotaWindow::DAILY });
        quotas.insert(ResourceDimension::Tokens, QuotaPolicy { limit: tokens, window: QuotaWindow::DAILY });
        quotas.insert(ResourceDimension::StorageBytes, QuotaPolicy { limit: storage, window: QuotaWindow::Lifetime });
        quotas.insert(ResourceDimension::BandwidthBytes, QuotaPolicy { limit: bandwidth, window: QuotaWindow::DAILY });
        quotas.insert(
            ResourceDimension::ConcurrentOperations,
            QuotaPolicy { limit: concurrent, window: QuotaWindow::Lifetime },
        );

        let mut features = BTreeSet::from([Feature::StreamingResponses, Feature::FileProcessing]);
        if tier != Tier::Free {
            features.insert(Feature::Rag);
            features.insert(Feature::WebSearch);
        }

        Self {
            quotas,
            rate: vec![
                RateCeiling::per_second(rate[0]),
                RateCeiling::per_minute(rate[1]),
                RateCeiling::per_hour(rate[2]),
                RateCeiling::per_day(rate[3]),
            ],
            rate_overrides: HashMap::new(),
            max_concurrent_per_operation: per_op,
            features,
            memory_capacity: capacity,
        }
    }

    /// Rate windows that govern `operation`.
    pub fn rate_for(&self, operation: Operation) -> &[RateCeiling] {
        self.rate_overrides
            .get(&operation)
            .map(Vec::as_slice)
            .unwrap_or(self.rate.as_slice())
    }

    /// Session-wide ceiling on simultaneous operations.
    pub fn max_concurrent_total(&self) -> usize {
        self.quotas
            .get(&ResourceDimension::ConcurrentOperations)
            .map(|q| q.limit as usize)
            .unwrap_or(usize::MAX)
    }

    pub fn allows(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn validate(&self, tier: Tier) -> Result<()> {
        let all_rates = self.rate.iter().chain(self.rate_overrides.values().flatten());
        for ceiling in all_rates {
            if !ceiling.is_valid() {
                return Err(GovernError::Config(format!("{tier}: rate window must be positive")));
            }
        }
        for (dim, quota) in &self.quotas {
            if quota.window == (QuotaWindow::Period { secs: 0 }) {
                return Err(GovernError::Config(format!("{tier}: {dim} period must be positive")));
            }
        }
        if self.max_concurrent_per_operation == 0 {
            return Err(GovernError::Config(format!("{tier}: per-operation concurrency must be positive")));
        }
        Ok(())
    }
}

fn default_tiers() -> HashMap<Tier, TierPolicy> {
    Tier::ALL.into_iter().map(|t| (t, TierPolicy::for_tier(t))).collect()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_after_secs: 300,
            expire_after_secs: 1_800,
            sweep_interval_secs: 30,
        }
    }
}

impl SessionConfig {
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: "cosine".into(),
            importance_weight: 0.6,
            recency_weight: 0.4,
            recency_half_life_secs: 3_600,
            persist_dir: None,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 64,
            retain_finished: 16,
            subscribe_timeout_secs: 30,
        }
    }
}

impl StreamConfig {
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.subscribe_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            keep_alive_secs: 15,
        }
    }
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            sessions: SessionConfig::default(),
            memory: MemoryConfig::default(),
            stream: StreamConfig::default(),
            server: ServerConfig::default(),
            tiers: default_tiers(),
        }
    }
}

impl TollgateConfig {
    /// Load a JSON config file; omitted sections take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        tracing::info!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Policy for `tier`, falling back to the built-in defaults when the
    /// config file leaves the tier out.
    pub fn policy(&self, tier: Tier) -> TierPolicy {
        self.tiers
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierPolicy::for_tier(tier))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sessions.expire_after_secs <= self.sessions.idle_after_secs {
            return Err(GovernError::Config(
                "sessions.expire_after_secs must exceed idle_after_secs".into(),
            ));
        }
        if self.sessions.sweep_interval_secs == 0 {
            return Err(GovernError::Config("sessions.sweep_interval_secs must be positive".into()));
        }
        if self.memory.dimension == 0 {
            return Err(GovernError::Config("memory.dimension must be positive".into()));
        }
        if self.stream.subscriber_buffer == 0 {
            return Err(GovernError::Config("stream.subscriber_buffer must be positive".into()));
        }
        for (tier, policy) in &self.tiers {
            policy.validate(*tier)?;
        }
        Ok(())
    }
}
