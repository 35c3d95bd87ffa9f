//! The Context Bus (C1): the single source of truth for ownership and
//! coordination state. Locks, agent state, project context, conflicts,
//! pub/sub, cache, and counters are exposed as a small, total trait so a
//! networked backend can later implement it without touching callers — this
//! build ships one concrete backend, [`in_process::InProcessBus`], built
//! from `tokio::sync`-guarded maps plus a broadcast channel, mirroring the
//! teacher's single-process `EventBus`/`StreamHub` fanout pattern.

mod in_process;
mod sweep;

pub use in_process::InProcessBus;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use coord_types::{
    AgentState, BusEvent, Conflict, ConflictId, ConflictResolution, ConflictStatus, ContextItem,
    CoreResult, FileLock, ProjectContext, ProjectId, TaskId,
};
use tokio::sync::broadcast;

/// Default serialized-context size cap (§4.1), beyond which `SetProjectContext`
/// fails with `SerializationTooLarge` (modeled as `InvalidInput`).
pub const MAX_CONTEXT_BYTES: usize = 1024 * 1024;

#[async_trait]
pub trait Bus: Send + Sync {
    async fn set_project_context(&self, project_id: ProjectId, context: ProjectContext) -> CoreResult<()>;
    async fn get_project_context(&self, project_id: ProjectId) -> CoreResult<ProjectContext>;
    async fn merge_project_context(
        &self,
        project_id: ProjectId,
        patch: BTreeMap<String, Vec<ContextItem>>,
    ) -> CoreResult<ProjectContext>;

    /// Atomic set-if-absent with TTL. Never blocks. `ttl` must be within
    /// `[1s, 1h]`. The lock key is `(project_id, path)` per Open Question 4:
    /// locks are per-project, not per-task, so two tasks in the same project
    /// can never hold conflicting locks on the same path.
    async fn try_acquire_file_lock(
        &self,
        task_id: TaskId,
        agent: &str,
        project_id: ProjectId,
        path: &str,
        ttl: Duration,
    ) -> CoreResult<bool>;

    /// Succeeds only if the current holder matches `agent`; a mismatched
    /// release is logged as attempted theft and returns `false`.
    async fn release_file_lock(&self, agent: &str, project_id: ProjectId, path: &str) -> CoreResult<bool>;

    async fn list_locks(&self, project_id: ProjectId) -> CoreResult<Vec<FileLock>>;

    async fn set_agent_state(&self, task_id: TaskId, agent: &str, state: AgentState) -> CoreResult<()>;
    async fn get_agent_state(&self, task_id: TaskId, agent: &str) -> CoreResult<Option<AgentState>>;
    async fn list_agent_states(&self, task_id: TaskId) -> CoreResult<Vec<AgentState>>;

    /// Enqueues the new conflict id on the FIFO pending channel as a side
    /// effect, per §4.1.
    async fn record_conflict(&self, conflict: Conflict) -> CoreResult<ConflictId>;
    async fn update_conflict_status(
        &self,
        id: ConflictId,
        status: ConflictStatus,
        resolution: Option<ConflictResolution>,
    ) -> CoreResult<()>;
    async fn get_conflict(&self, id: ConflictId) -> CoreResult<Conflict>;
    async fn list_pending_conflicts(&self) -> CoreResult<Vec<ConflictId>>;
    /// Pops the oldest pending conflict id, waiting up to `timeout` if the
    /// queue is empty. FIFO: no two callers observe the same id.
    async fn pop_pending_conflict(&self, timeout: Duration) -> CoreResult<Option<ConflictId>>;

    async fn publish(&self, event: BusEvent) -> CoreResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;

    async fn cache_set(&self, key: &str, value: serde_json::Value, ttl: Duration) -> CoreResult<()>;
    async fn get_cached(&self, key: &str) -> CoreResult<Option<serde_json::Value>>;
    async fn invalidate_cache(&self, pattern: &str) -> CoreResult<()>;

    async fn increment_counter(&self, name: &str, delta: i64) -> CoreResult<i64>;
    async fn get_counter(&self, name: &str) -> CoreResult<i64>;
    async fn list_counters(&self, prefix: &str) -> CoreResult<Vec<(String, i64)>>;
}
