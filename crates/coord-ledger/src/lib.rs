//! The Cost Ledger (C2): per-project spend tracking and budget phase
//! classification. Persistence follows the teacher's `OrchestratorStore`
//! conventions — per-project JSON-lines append with atomic write-then-rename
//! — generalized from a single run directory to one directory per project,
//! partitioned by UTC day.

mod store;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use coord_types::{
    classify_budget_phase, BudgetStatus, CoreError, CoreResult, CostRecord, Money, ModelDescriptor,
    ProjectId,
};
use tokio::sync::RwLock;

use store::LedgerStore;

/// How long a `BudgetStatus` computation may be served from cache before
/// being recomputed, per §4.2 ("cached for at most 5s").
const STATUS_CACHE_TTL: Duration = Duration::from_secs(5);

struct ProjectState {
    day: NaiveDate,
    daily_total: Money,
    month: (i32, u32),
    monthly_total: Money,
    seen_request_ids: HashSet<String>,
    next_seq: u64,
    cached_status: Option<(BudgetStatus, DateTime<Utc>)>,
}

impl ProjectState {
    fn new(now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            day: today,
            daily_total: 0.0,
            month: (today.year(), today.month()),
            monthly_total: 0.0,
            seen_request_ids: HashSet::new(),
            next_seq: 0,
            cached_status: None,
        }
    }

    fn roll_if_needed(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        let month = (today.year(), today.month());
        if today != self.day {
            self.day = today;
            self.daily_total = 0.0;
            self.seen_request_ids.clear();
        }
        if month != self.month {
            self.month = month;
            self.monthly_total = 0.0;
        }
    }
}

/// Tracks spend per project against configured daily/monthly caps, loaded
/// from a `ModelDescriptor` catalog keyed by backend id.
pub struct CostLedger {
    store: LedgerStore,
    backends: HashMap<String, ModelDescriptor>,
    daily_cap: Money,
    monthly_cap: Money,
    projects: RwLock<HashMap<ProjectId, ProjectState>>,
}

impl CostLedger {
    pub fn new(base_dir: PathBuf, backends: Vec<ModelDescriptor>, daily_cap: Money, monthly_cap: Money) -> CoreResult<Self> {
        Ok(Self {
            store: LedgerStore::new(base_dir)?,
            backends: backends.into_iter().map(|b| (b.id.clone(), b)).collect(),
            daily_cap,
            monthly_cap,
            projects: RwLock::new(HashMap::new()),
        })
    }

    fn price(&self, backend_id: &str, in_tokens: u64, out_tokens: u64) -> CoreResult<Money> {
        let backend = self
            .backends
            .get(backend_id)
            .ok_or_else(|| CoreError::NotFound(format!("backend {backend_id}")))?;
        Ok(backend.cost(in_tokens, out_tokens))
    }

    /// Atomic, idempotent by `request_id`: a retry with the same
    /// `(project_id, request_id)` pair returns the original `CostRecord`
    /// without double-counting spend.
    pub async fn record_cost(
        &self,
        project_id: ProjectId,
        backend_id: &str,
        in_tokens: u64,
        out_tokens: u64,
        request_id: &str,
    ) -> CoreResult<CostRecord> {
        let cost = self.price(backend_id, in_tokens, out_tokens)?;
        let now = Utc::now();

        let mut projects = self.projects.write().await;
        if !projects.contains_key(&project_id) {
            let rehydrated = self.store.rehydrate(project_id, now).await?;
            projects.insert(project_id, rehydrated);
        }
        let state = projects.get_mut(&project_id).expect("just inserted");
        state.roll_if_needed(now);

        if let Some(existing) = self.store.find_by_request_id(project_id, request_id).await? {
            return Ok(existing);
        }

        let record = CostRecord {
            project_id,
            day: state.day,
            backend_id: backend_id.to_string(),
            in_tokens,
            out_tokens,
            cost,
            created_at: now,
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        self.store
            .append(project_id, seq, request_id, &record)
            .await?;

        state.daily_total += cost;
        state.monthly_total += cost;
        state.seen_request_ids.insert(request_id.to_string());
        state.cached_status = None;

        Ok(record)
    }

    pub async fn daily_spent(&self, project_id: ProjectId) -> CoreResult<Money> {
        Ok(self.status_uncached(project_id).await?.0)
    }

    pub async fn monthly_spent(&self, project_id: ProjectId) -> CoreResult<Money> {
        Ok(self.status_uncached(project_id).await?.1)
    }

    async fn status_uncached(&self, project_id: ProjectId) -> CoreResult<(Money, Money)> {
        let now = Utc::now();
        let mut projects = self.projects.write().await;
        if !projects.contains_key(&project_id) {
            let rehydrated = self.store.rehydrate(project_id, now).await?;
            projects.insert(project_id, rehydrated);
        }
        let state = projects.get_mut(&project_id).expect("just inserted");
        state.roll_if_needed(now);
        Ok((state.daily_total, state.monthly_total))
    }

    /// Budget phase for `project_id`, served from a per-project cache that
    /// is invalidated on every `record_cost` and otherwise expires after
    /// [`STATUS_CACHE_TTL`].
    pub async fn budget_status(&self, project_id: ProjectId) -> CoreResult<BudgetStatus> {
        let now = Utc::now();
        {
            let projects = self.projects.read().await;
            if let Some(state) = projects.get(&project_id) {
                if let Some((status, computed_at)) = state.cached_status {
                    if now.signed_duration_since(computed_at).to_std().unwrap_or(Duration::MAX) < STATUS_CACHE_TTL {
                        return Ok(status);
                    }
                }
            }
        }

        let (daily, monthly) = self.status_uncached(project_id).await?;
        let daily_fraction = if self.daily_cap > 0.0 { daily / self.daily_cap } else { 0.0 };
        let monthly_fraction = if self.monthly_cap > 0.0 { monthly / self.monthly_cap } else { 0.0 };
        let phase = classify_budget_phase(daily_fraction, monthly_fraction);
        let status = BudgetStatus {
            daily: daily_fraction,
            monthly: monthly_fraction,
            phase,
        };

        let mut projects = self.projects.write().await;
        if let Some(state) = projects.get_mut(&project_id) {
            state.cached_status = Some((status, now));
        }
        Ok(status)
    }

    pub fn backend(&self, backend_id: &str) -> Option<&ModelDescriptor> {
        self.backends.get(backend_id)
    }

    pub fn backends_in_tier(&self, tier: coord_types::Tier) -> Vec<&ModelDescriptor> {
        self.backends.values().filter(|b| b.tier == tier).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::{LatencyClass, Tier};
    use tempfile::tempdir;

    fn backend(id: &str, tier: Tier, price_in: f64, price_out: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            tier,
            price_in_per_million: price_in,
            price_out_per_million: price_out,
            context_window: 128_000,
            latency_class: LatencyClass::Medium,
            capability_tags: vec![],
            endpoint: "https://example.invalid".to_string(),
        }
    }

    fn ledger(dir: &std::path::Path, daily_cap: f64, monthly_cap: f64) -> CostLedger {
        CostLedger::new(
            dir.to_path_buf(),
            vec![
                backend("local-ollama", Tier::Local, 0.0, 0.0),
                backend("premium-default", Tier::Premium, 3.0, 15.0),
            ],
            daily_cap,
            monthly_cap,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn record_cost_is_idempotent_by_request_id() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 100.0, 1000.0);
        let project = ProjectId::new();

        let r1 = ledger
            .record_cost(project, "premium-default", 1_000_000, 0, "req-1")
            .await
            .unwrap();
        let r2 = ledger
            .record_cost(project, "premium-default", 1_000_000, 0, "req-1")
            .await
            .unwrap();
        assert_eq!(r1.created_at, r2.created_at);
        assert!((ledger.daily_spent(project).await.unwrap() - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn daily_spent_accumulates_across_distinct_requests() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 100.0, 1000.0);
        let project = ProjectId::new();
        ledger
            .record_cost(project, "premium-default", 1_000_000, 0, "req-1")
            .await
            .unwrap();
        ledger
            .record_cost(project, "premium-default", 1_000_000, 0, "req-2")
            .await
            .unwrap();
        assert!((ledger.daily_spent(project).await.unwrap() - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn budget_phase_tracks_inclusive_thresholds() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 10.0, 1000.0);
        let project = ProjectId::new();
        // 6 / 10 = 0.60 -> THROTTLE
        ledger
            .record_cost(project, "premium-default", 2_000_000, 0, "req-1")
            .await
            .unwrap();
        let status = ledger.budget_status(project).await.unwrap();
        assert_eq!(status.phase, coord_types::BudgetPhase::Throttle);
    }

    #[tokio::test]
    async fn halt_phase_triggers_at_or_above_ninety_five_percent() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 10.0, 1000.0);
        let project = ProjectId::new();
        ledger
            .record_cost(project, "premium-default", 10_000_000 / 3, 0, "req-1")
            .await
            .unwrap();
        // ~10.0 spent on a 10.0 cap -> fraction >= 0.95
        let status = ledger.budget_status(project).await.unwrap();
        assert_eq!(status.phase, coord_types::BudgetPhase::Halt);
    }

    #[tokio::test]
    async fn local_backend_zero_price_still_records_token_usage() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 10.0, 1000.0);
        let project = ProjectId::new();
        let record = ledger
            .record_cost(project, "local-ollama", 500, 500, "req-1")
            .await
            .unwrap();
        assert_eq!(record.cost, 0.0);
        assert_eq!(record.in_tokens, 500);
    }

    #[tokio::test]
    async fn unknown_backend_is_not_found() {
        let dir = tempdir().unwrap();
        let ledger = ledger(dir.path(), 10.0, 1000.0);
        let project = ProjectId::new();
        let err = ledger
            .record_cost(project, "nonexistent", 1, 1, "req-1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
