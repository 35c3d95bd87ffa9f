use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coord_types::{
    AgentState, BusEvent, Conflict, ConflictId, ConflictResolution, ConflictStatus, ContextItem,
    CoreError, CoreResult, FileLock, ProjectContext, ProjectId, TaskId,
};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};

use crate::{Bus, MAX_CONTEXT_BYTES};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct CacheEntry {
    value: serde_json::Value,
    expires_at: DateTime<Utc>,
}

/// In-process implementation of the Context Bus, built from
/// `tokio::sync`-guarded maps plus a `broadcast` channel for pub/sub. A
/// `Bus` backend (Redis, etcd, ...) would implement the same trait; this
/// build ships only this one, per the bus Non-goal.
pub struct InProcessBus {
    connected: AtomicBool,
    locks: Mutex<HashMap<(ProjectId, String), FileLock>>,
    contexts: RwLock<HashMap<ProjectId, ProjectContext>>,
    agent_states: RwLock<HashMap<(TaskId, String), AgentState>>,
    conflicts: RwLock<HashMap<ConflictId, Conflict>>,
    pending_conflicts: Mutex<VecDeque<ConflictId>>,
    pending_notify: Notify,
    events_tx: broadcast::Sender<BusEvent>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    counters: Mutex<HashMap<String, i64>>,
    agent_state_idle_ttl: Duration,
    conflict_sla: Duration,
}

impl InProcessBus {
    /// Build the bus and spawn its TTL/idle/SLA sweep task (Design Note 4:
    /// one deadline-driven scheduler per bus instance, not per-entry
    /// timers). The sweep holds only a `Weak` reference so it exits once the
    /// last `Arc<InProcessBus>` is dropped.
    pub fn spawn(agent_state_idle_ttl: Duration, conflict_sla: Duration) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let bus = Arc::new(Self {
            connected: AtomicBool::new(true),
            locks: Mutex::new(HashMap::new()),
            contexts: RwLock::new(HashMap::new()),
            agent_states: RwLock::new(HashMap::new()),
            conflicts: RwLock::new(HashMap::new()),
            pending_conflicts: Mutex::new(VecDeque::new()),
            pending_notify: Notify::new(),
            events_tx,
            cache: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            agent_state_idle_ttl,
            conflict_sla,
        });
        crate::sweep::spawn_sweep(Arc::downgrade(&bus));
        bus
    }

    /// Flip the bus into a disconnected state; all operations return
    /// `DependencyUnavailable` until `reconnect` is called. Used by tests and
    /// administrative tooling to exercise the failure path.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    fn check_connected(&self) -> CoreResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::DependencyUnavailable("context bus not connected".to_string()))
        }
    }

    async fn bump_counter(&self, name: &str, delta: i64) {
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(name.to_string()).or_insert(0);
        *entry += delta;
    }

    pub(crate) async fn sweep_once(&self) {
        let now = Utc::now();

        let expired_locks: Vec<(ProjectId, String)> = {
            let locks = self.locks.lock().await;
            locks
                .iter()
                .filter(|(_, lock)| lock.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };
        for (project_id, path) in expired_locks {
            let mut locks = self.locks.lock().await;
            if let Some(lock) = locks.get(&(project_id, path.clone())) {
                if lock.is_expired(now) {
                    locks.remove(&(project_id, path.clone()));
                    drop(locks);
                    let _ = self
                        .publish(BusEvent::LockReleased { project_id, path, at: now })
                        .await;
                }
            }
        }

        {
            let mut states = self.agent_states.write().await;
            states.retain(|_, state| {
                !state.is_idle_expired(now, self.agent_state_idle_ttl.as_secs() as i64)
            });
        }

        let escalating: Vec<ConflictId> = {
            let conflicts = self.conflicts.read().await;
            conflicts
                .values()
                .filter(|c| {
                    matches!(c.status, ConflictStatus::Pending | ConflictStatus::InArbitration)
                        && now >= c.sla_deadline(self.conflict_sla.as_secs() as i64)
                })
                .map(|c| c.id)
                .collect()
        };
        for id in escalating {
            let project_id = {
                let mut conflicts = self.conflicts.write().await;
                let Some(conflict) = conflicts.get_mut(&id) else { continue };
                conflict.status = ConflictStatus::Escalated;
                conflict.resolved_at = Some(now);
                conflict.project_id
            };
            {
                let mut pending = self.pending_conflicts.lock().await;
                pending.retain(|pending_id| *pending_id != id);
            }
            let _ = self
                .publish(BusEvent::ConflictEscalated {
                    project_id,
                    conflict_id: id,
                    reason: "sla_exceeded".to_string(),
                    at: now,
                })
                .await;
        }

        {
            let mut cache = self.cache.lock().await;
            cache.retain(|_, entry| entry.expires_at > now);
        }
    }
}

#[async_trait]
impl Bus for InProcessBus {
    async fn set_project_context(&self, project_id: ProjectId, context: ProjectContext) -> CoreResult<()> {
        self.check_connected()?;
        let size = context.serialized_size();
        if size > MAX_CONTEXT_BYTES {
            return Err(CoreError::InvalidInput(format!(
                "project context serialized size {size} exceeds cap {MAX_CONTEXT_BYTES}"
            )));
        }
        {
            let mut contexts = self.contexts.write().await;
            contexts.insert(project_id, context);
        }
        self.publish(BusEvent::ContextUpdate {
            project_id,
            slots: Vec::new(),
            at: Utc::now(),
        })
        .await
    }

    async fn get_project_context(&self, project_id: ProjectId) -> CoreResult<ProjectContext> {
        self.check_connected()?;
        let contexts = self.contexts.read().await;
        Ok(contexts.get(&project_id).cloned().unwrap_or_default())
    }

    async fn merge_project_context(
        &self,
        project_id: ProjectId,
        patch: BTreeMap<String, Vec<ContextItem>>,
    ) -> CoreResult<ProjectContext> {
        self.check_connected()?;
        let slots: Vec<String> = patch.keys().cloned().collect();
        let merged = {
            let mut contexts = self.contexts.write().await;
            let context = contexts.entry(project_id).or_insert_with(ProjectContext::new);
            context.merge(patch);
            let size = context.serialized_size();
            if size > MAX_CONTEXT_BYTES {
                return Err(CoreError::InvalidInput(format!(
                    "project context serialized size {size} exceeds cap {MAX_CONTEXT_BYTES}"
                )));
            }
            context.clone()
        };
        self.publish(BusEvent::ContextUpdate {
            project_id,
            slots,
            at: Utc::now(),
        })
        .await?;
        Ok(merged)
    }

    async fn try_acquire_file_lock(
        &self,
        task_id: TaskId,
        agent: &str,
        project_id: ProjectId,
        path: &str,
        ttl: Duration,
    ) -> CoreResult<bool> {
        self.check_connected()?;
        if ttl < Duration::from_secs(1) || ttl > Duration::from_secs(3600) {
            return Err(CoreError::InvalidInput(format!(
                "lock ttl must be within [1s, 1h], got {ttl:?}"
            )));
        }
        let now = Utc::now();
        let key = (project_id, path.to_string());
        let acquired = {
            let mut locks = self.locks.lock().await;
            match locks.get(&key) {
                Some(existing) if !existing.is_expired(now) => false,
                _ => {
                    locks.insert(
                        key,
                        FileLock {
                            project_id,
                            path: path.to_string(),
                            holder_agent: agent.to_string(),
                            task_id,
                            acquired_at: now,
                            ttl_secs: ttl.as_secs(),
                        },
                    );
                    true
                }
            }
        };
        if acquired {
            self.bump_counter("locks.acquired", 1).await;
        } else {
            self.bump_counter("locks.denied", 1).await;
        }
        Ok(acquired)
    }

    async fn release_file_lock(&self, agent: &str, project_id: ProjectId, path: &str) -> CoreResult<bool> {
        self.check_connected()?;
        let key = (project_id, path.to_string());
        let outcome = {
            let mut locks = self.locks.lock().await;
            match locks.get(&key) {
                Some(existing) if existing.holder_agent == agent => {
                    locks.remove(&key);
                    Some(true)
                }
                Some(_) => Some(false),
                None => None,
            }
        };
        match outcome {
            Some(true) => {
                self.bump_counter("locks.released", 1).await;
                self.publish(BusEvent::LockReleased {
                    project_id,
                    path: path.to_string(),
                    at: Utc::now(),
                })
                .await?;
                Ok(true)
            }
            Some(false) => {
                tracing::warn!(project_id = %project_id, path, agent, "attempted_lock_theft");
                self.bump_counter("locks.theft_attempts", 1).await;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn list_locks(&self, project_id: ProjectId) -> CoreResult<Vec<FileLock>> {
        self.check_connected()?;
        let locks = self.locks.lock().await;
        Ok(locks
            .values()
            .filter(|lock| lock.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn set_agent_state(&self, task_id: TaskId, agent: &str, state: AgentState) -> CoreResult<()> {
        self.check_connected()?;
        let mut states = self.agent_states.write().await;
        states.insert((task_id, agent.to_string()), state);
        Ok(())
    }

    async fn get_agent_state(&self, task_id: TaskId, agent: &str) -> CoreResult<Option<AgentState>> {
        self.check_connected()?;
        let states = self.agent_states.read().await;
        Ok(states.get(&(task_id, agent.to_string())).cloned())
    }

    async fn list_agent_states(&self, task_id: TaskId) -> CoreResult<Vec<AgentState>> {
        self.check_connected()?;
        let states = self.agent_states.read().await;
        Ok(states
            .iter()
            .filter(|((t, _), _)| *t == task_id)
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn record_conflict(&self, conflict: Conflict) -> CoreResult<ConflictId> {
        self.check_connected()?;
        let id = conflict.id;
        let project_id = conflict.project_id;
        let conflict_type = conflict.conflict_type;
        {
            let mut conflicts = self.conflicts.write().await;
            conflicts.insert(id, conflict);
        }
        {
            let mut pending = self.pending_conflicts.lock().await;
            pending.push_back(id);
        }
        self.pending_notify.notify_one();
        self.publish(BusEvent::ConflictRecorded {
            project_id,
            conflict_id: id,
            conflict_type,
            at: Utc::now(),
        })
        .await?;
        Ok(id)
    }

    async fn update_conflict_status(
        &self,
        id: ConflictId,
        status: ConflictStatus,
        resolution: Option<ConflictResolution>,
    ) -> CoreResult<()> {
        self.check_connected()?;
        let (project_id, winner) = {
            let mut conflicts = self.conflicts.write().await;
            let conflict = conflicts
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("conflict {id}")))?;
            conflict.status = status;
            if matches!(status, ConflictStatus::Resolved | ConflictStatus::Escalated) {
                conflict.resolved_at = Some(Utc::now());
            }
            let winner = resolution.as_ref().and_then(|r| r.winner.clone());
            if let Some(resolution) = resolution {
                conflict.resolution = Some(resolution);
            }
            (conflict.project_id, winner)
        };

        if matches!(status, ConflictStatus::Resolved) {
            let mut pending = self.pending_conflicts.lock().await;
            pending.retain(|pending_id| *pending_id != id);
            drop(pending);
            self.publish(BusEvent::ConflictResolved {
                project_id,
                conflict_id: id,
                winner,
                at: Utc::now(),
            })
            .await?;
        } else if matches!(status, ConflictStatus::Escalated) {
            let mut pending = self.pending_conflicts.lock().await;
            pending.retain(|pending_id| *pending_id != id);
            drop(pending);
            self.publish(BusEvent::ConflictEscalated {
                project_id,
                conflict_id: id,
                reason: "parse_or_resolution_failure".to_string(),
                at: Utc::now(),
            })
            .await?;
        }
        Ok(())
    }

    async fn get_conflict(&self, id: ConflictId) -> CoreResult<Conflict> {
        self.check_connected()?;
        let conflicts = self.conflicts.read().await;
        conflicts
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("conflict {id}")))
    }

    async fn list_pending_conflicts(&self) -> CoreResult<Vec<ConflictId>> {
        self.check_connected()?;
        let pending = self.pending_conflicts.lock().await;
        Ok(pending.iter().copied().collect())
    }

    async fn pop_pending_conflict(&self, timeout: Duration) -> CoreResult<Option<ConflictId>> {
        self.check_connected()?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pending_notify.notified();
            {
                let mut pending = self.pending_conflicts.lock().await;
                if let Some(id) = pending.pop_front() {
                    return Ok(Some(id));
                }
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn publish(&self, event: BusEvent) -> CoreResult<()> {
        self.check_connected()?;
        // Best-effort fanout: a send error just means there are currently no
        // subscribers, which is not a failure for the publisher.
        let _ = self.events_tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events_tx.subscribe()
    }

    async fn cache_set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> CoreResult<()> {
        self.check_connected()?;
        let mut cache = self.cache.lock().await;
        cache.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default(),
            },
        );
        Ok(())
    }

    async fn get_cached(&self, key: &str) -> CoreResult<Option<serde_json::Value>> {
        self.check_connected()?;
        let cache = self.cache.lock().await;
        Ok(cache
            .get(key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.value.clone()))
    }

    async fn invalidate_cache(&self, pattern: &str) -> CoreResult<()> {
        self.check_connected()?;
        let mut cache = self.cache.lock().await;
        cache.retain(|key, _| !glob_match(pattern, key));
        Ok(())
    }

    async fn increment_counter(&self, name: &str, delta: i64) -> CoreResult<i64> {
        self.check_connected()?;
        let mut counters = self.counters.lock().await;
        let entry = counters.entry(name.to_string()).or_insert(0);
        *entry += delta;
        Ok(*entry)
    }

    async fn get_counter(&self, name: &str) -> CoreResult<i64> {
        self.check_connected()?;
        let counters = self.counters.lock().await;
        Ok(counters.get(name).copied().unwrap_or(0))
    }

    async fn list_counters(&self, prefix: &str) -> CoreResult<Vec<(String, i64)>> {
        self.check_connected()?;
        let counters = self.counters.lock().await;
        Ok(counters
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, value)| (name.clone(), *value))
            .collect())
    }
}

/// Minimal `*`-wildcard glob matcher for `InvalidateCache(pattern)`. Not a
/// full glob implementation — `*` matches any run of characters, everything
/// else is literal.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn helper(pattern: &[u8], candidate: &[u8]) -> bool {
        match (pattern.first(), candidate.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                helper(&pattern[1..], candidate)
                    || (!candidate.is_empty() && helper(pattern, &candidate[1..]))
            }
            (Some(p), Some(c)) if p == c => helper(&pattern[1..], &candidate[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::{AgentStatus, ConflictType};

    fn bus() -> Arc<InProcessBus> {
        InProcessBus::spawn(Duration::from_secs(3600), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn concurrent_lock_acquisition_has_exactly_one_winner() {
        let bus = bus();
        let project = ProjectId::new();
        let task = TaskId::new();

        let b1 = bus.clone();
        let b2 = bus.clone();
        let (r1, r2) = tokio::join!(
            b1.try_acquire_file_lock(task, "a1", project, "src/x.go", Duration::from_secs(30)),
            b2.try_acquire_file_lock(task, "a2", project, "src/x.go", Duration::from_secs(30)),
        );
        let results = [r1.unwrap(), r2.unwrap()];
        assert_eq!(results.iter().filter(|r| **r).count(), 1);

        let winner_agent = if results[0] { "a1" } else { "a2" };
        let loser_agent = if results[0] { "a2" } else { "a1" };

        assert!(!bus
            .release_file_lock(loser_agent, project, "src/x.go")
            .await
            .unwrap());
        assert!(bus
            .release_file_lock(winner_agent, project, "src/x.go")
            .await
            .unwrap());
        assert!(bus
            .try_acquire_file_lock(task, loser_agent, project, "src/x.go", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let bus = bus();
        let project = ProjectId::new();
        let task = TaskId::new();
        assert!(bus
            .try_acquire_file_lock(task, "a1", project, "f.rs", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!bus.release_file_lock("a2", project, "f.rs").await.unwrap());
        let locks = bus.list_locks(project).await.unwrap();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].holder_agent, "a1");
    }

    #[tokio::test]
    async fn conflict_is_fifo_delivered_to_a_single_popper() {
        let bus = bus();
        let project = ProjectId::new();
        let task = TaskId::new();
        let conflict = Conflict::new(
            task,
            project,
            ConflictType::SemanticDisagreement,
            vec!["a1".into(), "a2".into()],
            serde_json::json!({"a": 1}),
        );
        let id = bus.record_conflict(conflict).await.unwrap();

        let b1 = bus.clone();
        let b2 = bus.clone();
        let (p1, p2) = tokio::join!(
            b1.pop_pending_conflict(Duration::from_millis(200)),
            b2.pop_pending_conflict(Duration::from_millis(200)),
        );
        let popped: Vec<_> = [p1.unwrap(), p2.unwrap()].into_iter().flatten().collect();
        assert_eq!(popped, vec![id]);
    }

    #[tokio::test]
    async fn disconnected_bus_returns_dependency_unavailable() {
        let bus = bus();
        bus.simulate_disconnect();
        let project = ProjectId::new();
        let err = bus.get_project_context(project).await.unwrap_err();
        assert_eq!(err.code(), "dependency_unavailable");
        bus.reconnect();
        assert!(bus.get_project_context(project).await.is_ok());
    }

    #[tokio::test]
    async fn oversized_context_is_rejected() {
        let bus = bus();
        let project = ProjectId::new();
        let mut context = ProjectContext::new();
        let huge = "x".repeat(MAX_CONTEXT_BYTES + 1);
        context.merge(BTreeMap::from([(
            "dump".to_string(),
            vec![ContextItem::Opaque(serde_json::json!({"blob": huge}))],
        )]));
        let err = bus.set_project_context(project, context).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[tokio::test]
    async fn sweep_expires_idle_agent_states() {
        let bus = InProcessBus::spawn(Duration::from_millis(10), Duration::from_secs(3600));
        let task = TaskId::new();
        bus.set_agent_state(
            task,
            "a1",
            AgentState {
                task_id: task,
                agent: "a1".to_string(),
                status: AgentStatus::Working,
                last_heartbeat: Utc::now() - chrono::Duration::seconds(5),
                subtask: None,
                progress: 0.1,
                in_tokens: 0,
                out_tokens: 0,
            },
        )
        .await
        .unwrap();
        bus.sweep_once().await;
        assert!(bus.get_agent_state(task, "a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_round_trips_until_ttl_then_expires() {
        let bus = bus();
        bus.cache_set("k1", serde_json::json!("v1"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            bus.get_cached("k1").await.unwrap(),
            Some(serde_json::json!("v1"))
        );
        bus.invalidate_cache("k*").await.unwrap();
        assert_eq!(bus.get_cached("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_increment_and_list_by_prefix() {
        let bus = bus();
        bus.increment_counter("errors.not_found", 1).await.unwrap();
        bus.increment_counter("errors.not_found", 2).await.unwrap();
        bus.increment_counter("errors.conflict", 1).await.unwrap();
        assert_eq!(bus.get_counter("errors.not_found").await.unwrap(), 3);
        let listed = bus.list_counters("errors.").await.unwrap();
        assert_eq!(listed.len(), 2);
    }
}
