use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use tg_core::{
    Clock, Feature, GovernError, QuotaWindow, ResourceDimension, Result, Tier, TierPolicy, TollgateConfig,
};
use tg_memory::{MemoryStore, StoreConfig};
use tg_stream::{DispatchConfig, StreamDispatcher};

use crate::concurrency::ConcurrencyGuard;
use crate::quota::{QuotaLedger, QuotaUsage};
use crate::rate::RateLimiter;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Expired,
    Terminated,
}

impl SessionStatus {
    /// Expired and terminated sessions accept no further operations.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Idle => write!(f, "idle"),
            Self::Expired => write!(f, "expired"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug)]
struct SessionMeta {
    status: SessionStatus,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    metadata: HashMap<String, serde_json::Value>,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub tier: Tier,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub in_flight: usize,
    pub open_streams: usize,
    pub memory_records: usize,
}

/// A governed session and everything it owns.
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    policy: TierPolicy,
    idle_after: Duration,
    expire_after: Duration,
    clock: Arc<dyn Clock>,
    meta: Mutex<SessionMeta>,
    quota: Arc<QuotaLedger>,
    rate: RateLimiter,
    guard: Arc<ConcurrencyGuard>,
    memory: MemoryStore,
    streams: StreamDispatcher,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        tier: Tier,
        metadata: HashMap<String, serde_json::Value>,
        config: &TollgateConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let id = Uuid::new_v4().to_string();
        let policy = config.policy(tier);
        let memory = MemoryStore::new(
            StoreConfig::from_config(&config.memory, policy.memory_capacity),
            clock.clone(),
        )?;
        let streams = StreamDispatcher::new(id.clone(), DispatchConfig::from(&config.stream), clock.clone());
        let now = clock.now();
        let now_utc = clock.utc();

        Ok(Self {
            quota: Arc::new(QuotaLedger::new(&policy.quotas, clock.clone())),
            rate: RateLimiter::new(&policy, clock.clone())?,
            guard: Arc::new(ConcurrencyGuard::new(
                policy.max_concurrent_per_operation,
                policy.max_concurrent_total(),
            )),
            memory,
            streams,
            id,
            user_id: user_id.into(),
            tier,
            created_at: now_utc,
            policy,
            idle_after: config.sessions.idle_after(),
            expire_after: config.sessions.expire_after(),
            meta: Mutex::new(SessionMeta {
                status: SessionStatus::Active,
                last_activity: now,
                last_activity_at: now_utc,
                metadata,
            }),
            clock,
        })
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    pub fn quota(&self) -> &Arc<QuotaLedger> {
        &self.quota
    }

    pub fn rate(&self) -> &RateLimiter {
        &self.rate
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyGuard> {
        &self.guard
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn streams(&self) -> &StreamDispatcher {
        &self.streams
    }

    /// Current status, re-evaluated against the inactivity thresholds.
    pub fn status(&self) -> SessionStatus {
        let mut meta = self.meta.lock();
        self.refresh(&mut meta);
        meta.status
    }

    fn refresh(&self, meta: &mut SessionMeta) {
        if !meta.status.is_live() {
            return;
        }
        let inactive = self.clock.now().saturating_duration_since(meta.last_activity);
        meta.status = if inactive >= self.expire_after {
            SessionStatus::Expired
        } else if inactive >= self.idle_after {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        };
    }

    /// Record activity. Fails once the session has expired or been terminated.
    pub fn touch(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        self.refresh(&mut meta);
        match meta.status {
            SessionStatus::Expired => Err(GovernError::SessionExpired { session_id: self.id.clone() }),
            SessionStatus::Terminated => Err(GovernError::SessionNotFound { session_id: self.id.clone() }),
            SessionStatus::Active | SessionStatus::Idle => {
                meta.status = SessionStatus::Active;
                meta.last_activity = self.clock.now();
                meta.last_activity_at = self.clock.utc();
                Ok(())
            }
        }
    }

    pub fn require_feature(&self, feature: Feature) -> Result<()> {
        if self.policy.allows(feature) {
            Ok(())
        } else {
            Err(GovernError::FeatureDisabled { feature })
        }
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.meta.lock().metadata.insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.meta.lock().metadata.get(key).cloned()
    }

    /// Ledger snapshot plus the concurrency ceiling reported as the
    /// `concurrent_operations` dimension.
    pub fn quota_snapshot(&self) -> BTreeMap<ResourceDimension, QuotaUsage> {
        let mut snapshot = self.quota.snapshot();
        if self.policy.quotas.contains_key(&ResourceDimension::ConcurrentOperations) {
            snapshot.insert(
                ResourceDimension::ConcurrentOperations,
                QuotaUsage::new(
                    self.guard.in_flight_total() as u64,
                    self.guard.total_limit() as u64,
                    QuotaWindow::Lifetime,
                ),
            );
        }
        snapshot
    }

    pub fn info(&self) -> SessionInfo {
        let (status, last_activity_at, metadata) = {
            let mut meta = self.meta.lock();
            self.refresh(&mut meta);
            (meta.status, meta.last_activity_at, meta.metadata.clone())
        };
        SessionInfo {
            session_id: self.id.clone(),
            user_id: self.user_id.clone(),
            tier: self.tier,
            status,
            created_at: self.created_at,
            last_activity_at,
            metadata,
            in_flight: self.guard.in_flight_total(),
            open_streams: self.streams.open_count(),
            memory_records: self.memory.len(),
        }
    }

    /// Move to `terminated` and free everything the session holds. Returns
    /// false if it was already terminated.
    pub fn terminate(&self, reason: &str) -> bool {
        {
            let mut meta = self.meta.lock();
            if meta.status == SessionStatus::Terminated {
                return false;
            }
            meta.status = SessionStatus::Terminated;
        }
        let streams = self.streams.open_count();
        self.streams.clear(reason);
        let records = self.memory.clear();
        self.quota.clear();
        self.rate.clear();
        info!(
            session_id = %self.id,
            user_id = %self.user_id,
            reason,
            streams,
            records,
            "Session terminated"
        );
        true
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session(user={}, id={}, tier={})", self.user_id, self.id, self.tier)
    }
}
