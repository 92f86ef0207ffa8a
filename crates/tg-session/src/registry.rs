//! Session registry: owns every session, resolves ids, runs expiry sweeps,
//! and exposes the session-keyed entry points callers use.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tg_core::{Clock, Feature, GovernError, Operation, ResourceDimension, Result, Tier, TollgateConfig};
use tg_memory::{JsonlPersistence, MemoryPersistence, MemoryRecord, RecordId};
use tg_stream::{ChunkSink, StreamHandle, StreamInfo, Subscription};

use crate::concurrency::Permit;
use crate::operation::OperationGuard;
use crate::quota::QuotaUsage;
use crate::rate::RateUsage;
use crate::session::{Session, SessionInfo, SessionStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle: usize,
    pub expired: usize,
    pub windows_reset: usize,
}

pub struct SessionRegistry {
    config: TollgateConfig,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    persistence: Option<Arc<dyn MemoryPersistence>>,
}

impl SessionRegistry {
    /// A `memory.persist_dir` in `config` sets up JSON Lines persistence there.
    pub fn new(config: TollgateConfig, clock: Arc<dyn Clock>) -> Self {
        let persistence = config
            .memory
            .persist_dir
            .as_ref()
            .map(|dir| Arc::new(JsonlPersistence::new(dir.clone())) as Arc<dyn MemoryPersistence>);
        Self {
            config,
            clock,
            sessions: RwLock::new(HashMap::new()),
            persistence,
        }
    }

    /// Use `persistence` for [`SessionRegistry::restore`] and
    /// [`SessionRegistry::close`] instead of the configured directory.
    pub fn with_persistence(mut self, persistence: Arc<dyn MemoryPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn has_persistence(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn config(&self) -> &TollgateConfig {
        &self.config
    }

    pub fn create(
        &self,
        user_id: impl Into<String>,
        tier: Tier,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(user_id, tier, metadata, &self.config, self.clock.clone())?);
        self.sessions.write().insert(session.id.clone(), session.clone());
        info!(session_id = %session.id, user_id = %session.user_id, tier = %tier, "Session created");
        Ok(session)
    }

    /// The session under `session_id`, whatever its status.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Resolve a live session and record activity on it.
    pub fn resolve(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = self.get(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        session.touch()?;
        Ok(session)
    }

    pub fn touch(&self, session_id: &str) -> Result<()> {
        self.resolve(session_id).map(|_| ())
    }

    pub fn terminate(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.write().remove(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        session.terminate("session terminated");
        Ok(())
    }

    /// Load the memory the session's user left behind when an earlier session
    /// was closed. Records go through [`SessionRegistry::remember`], so they
    /// are charged against `storage_bytes` and get fresh timestamps.
    pub async fn restore(&self, session_id: &str) -> Result<usize> {
        let Some(persistence) = self.persistence.clone() else {
            return Ok(0);
        };
        let session = self.resolve(session_id)?;
        let records = persistence.load(&session.user_id).await?;
        let count = records.len();
        for record in records {
            self.remember(session_id, record)?;
        }
        if count > 0 {
            info!(session_id, user_id = %session.user_id, records = count, "Restored session memory");
        }
        Ok(count)
    }

    /// Terminate the session, saving its memory under its user first when
    /// persistence is set up. The session is gone even if saving fails.
    pub async fn close(&self, session_id: &str) -> Result<usize> {
        let session = self.get(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        let records = session.memory().export();
        self.terminate(session_id)?;

        let Some(persistence) = self.persistence.clone() else {
            return Ok(0);
        };
        persistence
            .save(&session.user_id, &records)
            .await
            .inspect_err(|e| warn!(session_id, user_id = %session.user_id, error = %e, "Saving session memory failed"))?;
        info!(session_id, user_id = %session.user_id, records = records.len(), "Saved session memory");
        Ok(records.len())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn list_by_user(&self, user_id: &str) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.iter().map(|s| s.info()).collect()
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Re-evaluate every session: reset ended quota windows, and reclaim
    /// sessions that have expired.
    pub fn sweep(&self) -> SweepReport {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        for session in &sessions {
            match session.status() {
                SessionStatus::Idle => report.idle += 1,
                SessionStatus::Expired => {
                    expired.push(session.id.clone());
                    continue;
                }
                _ => {}
            }
            report.windows_reset += session.quota().reset_expired();
        }

        if !expired.is_empty() {
            let reclaimed: Vec<Arc<Session>> = {
                let mut map = self.sessions.write();
                expired.iter().filter_map(|id| map.remove(id)).collect()
            };
            for session in &reclaimed {
                info!(session_id = %session.id, user_id = %session.user_id, "Session expired");
                session.terminate("session expired");
            }
            report.expired = reclaimed.len();
        }
        debug!(?report, remaining = self.count(), "Swept sessions");
        report
    }

    /// Run [`SessionRegistry::sweep`] on the configured interval until the
    /// returned handle is shut down.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let registry = Arc::clone(self);
        let interval = self.config.sessions.sweep_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        });
        SweeperHandle { task, shutdown }
    }

    // ------------------------------------------------------------------
    // Session-keyed entry points
    // ------------------------------------------------------------------

    pub fn create_session(
        &self,
        user_id: impl Into<String>,
        tier: Tier,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<SessionInfo> {
        Ok(self.create(user_id, tier, metadata)?.info())
    }

    pub fn get_quota(&self, session_id: &str) -> Result<BTreeMap<ResourceDimension, QuotaUsage>> {
        let session = self.get(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        Ok(session.quota_snapshot())
    }

    /// Charge consumed resources directly (no refund path).
    pub fn track_usage(&self, session_id: &str, dimension: ResourceDimension, amount: u64) -> Result<QuotaUsage> {
        let session = self.resolve(session_id)?;
        let quota = session.quota();
        match quota.reserve(dimension, amount) {
            Ok(_) => quota.usage(dimension),
            Err(e) => {
                warn!(session_id, dimension = %dimension, amount, error = %e, "Usage rejected");
                Err(e)
            }
        }
    }

    pub fn enforce_rate_limit(&self, session_id: &str, operation: Operation) -> Result<Vec<RateUsage>> {
        let session = self.resolve(session_id)?;
        if let Err(e) = session.rate().check(operation) {
            warn!(session_id, operation = %operation, error = %e, "Rate limit hit");
            return Err(e);
        }
        Ok(session.rate().usage(operation))
    }

    pub fn manage_concurrency(&self, session_id: &str, operation: Operation) -> Result<Permit> {
        self.resolve(session_id)?.concurrency().enter(operation)
    }

    /// Admit `operation`, reserving `costs` up front. See [`OperationGuard`].
    pub fn begin(
        &self,
        session_id: &str,
        operation: Operation,
        costs: &[(ResourceDimension, u64)],
    ) -> Result<OperationGuard> {
        let session = self.resolve(session_id)?;
        OperationGuard::admit(session, operation, costs).inspect_err(|e| {
            warn!(session_id, operation = %operation, error = %e, "Operation rejected");
        })
    }

    /// Open a stream for `operation`. The stream is admitted like any other
    /// operation (one `api_calls` charge, a concurrency slot, a rate check)
    /// and holds that admission until it completes, fails or is cancelled.
    pub fn stream_open(&self, session_id: &str, operation: Operation) -> Result<StreamHandle> {
        let session = self.resolve(session_id)?;
        session.require_feature(Feature::StreamingResponses)?;
        let costs: &[(ResourceDimension, u64)] = if session.quota().is_metered(ResourceDimension::ApiCalls) {
            &[(ResourceDimension::ApiCalls, 1)]
        } else {
            &[]
        };
        let admission = OperationGuard::admit(session.clone(), operation, costs).inspect_err(|e| {
            warn!(session_id, operation = %operation, error = %e, "Stream rejected");
        })?;
        Ok(session.streams().open_leased(operation, Box::new(admission)))
    }

    /// Push a chunk to a stream, charging its size against bandwidth.
    pub fn stream_emit(&self, session_id: &str, stream_id: &str, payload: &str, replace: bool) -> Result<u64> {
        let session = self.resolve(session_id)?;
        let handle = session.streams().handle(stream_id)?;
        let bandwidth = if session.quota().is_metered(ResourceDimension::BandwidthBytes) {
            Some(
                session
                    .quota()
                    .reserve_scoped(ResourceDimension::BandwidthBytes, payload.len() as u64)?,
            )
        } else {
            None
        };
        let sequence = if replace {
            handle.replace(payload)?
        } else {
            handle.emit(payload)?
        };
        if let Some(reservation) = bandwidth {
            reservation.commit();
        }
        Ok(sequence)
    }

    pub fn stream_complete(&self, session_id: &str, stream_id: &str) -> Result<u64> {
        self.resolve(session_id)?.streams().complete(stream_id)
    }

    pub fn stream_fail(&self, session_id: &str, stream_id: &str, error: &str) -> Result<u64> {
        self.resolve(session_id)?.streams().fail(stream_id, error)
    }

    pub fn stream_cancel(&self, session_id: &str, stream_id: &str) -> Result<u64> {
        self.resolve(session_id)?.streams().cancel(stream_id)
    }

    pub fn stream_pause(&self, session_id: &str, stream_id: &str) -> Result<bool> {
        self.resolve(session_id)?.streams().pause(stream_id)
    }

    pub fn stream_resume(&self, session_id: &str, stream_id: &str) -> Result<bool> {
        self.resolve(session_id)?.streams().resume(stream_id)
    }

    /// Streams of the session that have not finished yet.
    pub fn active_streams(&self, session_id: &str) -> Result<Vec<StreamInfo>> {
        let session = self.get(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        Ok(session.streams().active())
    }

    pub fn stream_subscribe(&self, session_id: &str, stream_id: &str) -> Result<Subscription> {
        self.resolve(session_id)?.streams().subscribe(stream_id)
    }

    pub fn stream_status(&self, session_id: &str, stream_id: &str) -> Result<StreamInfo> {
        let session = self.get(session_id).ok_or_else(|| GovernError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        session.streams().status(stream_id)
    }

    /// Memory context for an upcoming call.
    pub fn recall(&self, session_id: &str, embedding: &[f32], k: usize) -> Result<Vec<(MemoryRecord, f32)>> {
        Ok(self.resolve(session_id)?.memory().search(embedding, k)?)
    }

    pub fn lookup(&self, session_id: &str, key: &str) -> Result<Option<MemoryRecord>> {
        Ok(self.resolve(session_id)?.memory().get(key))
    }

    /// Store a record, charging its payload against `storage_bytes`. Bytes of
    /// records it overwrites or evicts are refunded.
    pub fn remember(&self, session_id: &str, record: MemoryRecord) -> Result<RecordId> {
        let session = self.resolve(session_id)?;
        let quota = session.quota();
        let metered = quota.is_metered(ResourceDimension::StorageBytes);
        let charge = if metered {
            Some(quota.reserve_scoped(ResourceDimension::StorageBytes, record.size_bytes())?)
        } else {
            None
        };

        let outcome = session.memory().put(record)?;
        if let Some(charge) = charge {
            charge.commit();
            let freed: u64 = outcome
                .replaced
                .iter()
                .chain(outcome.evicted.iter())
                .map(MemoryRecord::size_bytes)
                .sum();
            if freed > 0 {
                quota.refund(ResourceDimension::StorageBytes, freed)?;
            }
        }
        Ok(outcome.id)
    }

    /// Remove a record by key, refunding its storage.
    pub fn forget(&self, session_id: &str, key: &str) -> Result<bool> {
        let session = self.resolve(session_id)?;
        let Some(record) = session.memory().remove(key) else {
            return Ok(false);
        };
        if session.quota().is_metered(ResourceDimension::StorageBytes) {
            session.quota().refund(ResourceDimension::StorageBytes, record.size_bytes())?;
        }
        Ok(true)
    }
}

/// Background sweeper task plus its stop signal.
pub struct SweeperHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Session sweeper did not stop cleanly");
        }
    }
}
