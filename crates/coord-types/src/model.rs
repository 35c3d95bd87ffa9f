use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConflictId, ProjectId, TaskId};

/// Currency amount, stored as minor-unit-agnostic decimal dollars. Kept as
/// `f64` to match the price-table arithmetic in the cost formula; ledger
/// reads always go through `BudgetStatus`, never raw equality.
pub type Money = f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub currency: String,
    pub daily: Money,
    pub monthly: Money,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub roles: Vec<AgentRole>,
    pub output_schema: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub requirements: Vec<String>,
    pub story_points: u32,
    pub budget: BudgetCaps,
    pub stages: Vec<Stage>,
    pub current_stage_index: usize,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: String, requirements: Vec<String>, story_points: u32, budget: BudgetCaps) -> Self {
        let now = Utc::now();
        Self {
            id: ProjectId::new(),
            name,
            requirements,
            story_points,
            budget,
            stages: Vec::new(),
            current_stage_index: 0,
            status: ProjectStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages.get(self.current_stage_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Researcher,
    Writer,
    Tester,
    Reviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Blocked,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskClass {
    Arbitration,
    Orchestration,
    CodeGeneration,
    Research,
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub stage_id: String,
    pub role: AgentRole,
    pub class: TaskClass,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    pub declared_files: Vec<String>,
    pub model: Option<String>,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost: Money,
    pub retry_count: u32,
    pub deadline_secs: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        project_id: ProjectId,
        stage_id: impl Into<String>,
        role: AgentRole,
        class: TaskClass,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            project_id,
            stage_id: stage_id.into(),
            role,
            class,
            input,
            output: None,
            status: TaskStatus::Queued,
            depends_on: Vec::new(),
            declared_files: Vec::new(),
            model: None,
            in_tokens: 0,
            out_tokens: 0,
            cost: 0.0,
            retry_count: 0,
            deadline_secs: 600,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A single named slot inside a `ProjectContext`. Unknown tags round-trip as
/// `Opaque` so that producers ahead of this build's schema knowledge do not
/// lose data (Design Note: dynamic payloads as tagged variants).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    Requirement { text: String },
    ResearchFinding { summary: String, source: Option<String> },
    Decision { description: String, rationale: String },
    Artifact { slot: String, uri: String },
    AgentActivity { agent: String, note: String },
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSlot {
    pub items: Vec<ContextItem>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ContextSlot {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectContext {
    pub slots: BTreeMap<String, ContextSlot>,
    pub created_at: Option<DateTime<Utc>>,
    pub consolidated_at: Option<DateTime<Utc>>,
}

impl ProjectContext {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            created_at: Some(Utc::now()),
            consolidated_at: None,
        }
    }

    /// Deep-merge a patch into the named slots, last-writer-wins per item
    /// append (patches append to the slot rather than replacing it).
    pub fn merge(&mut self, patch: BTreeMap<String, Vec<ContextItem>>) {
        for (slot_name, items) in patch {
            let slot = self.slots.entry(slot_name).or_default();
            slot.items.extend(items);
            slot.updated_at = Utc::now();
        }
    }

    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub project_id: ProjectId,
    pub path: String,
    pub holder_agent: String,
    pub task_id: TaskId,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl FileLock {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Done,
    Errored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub task_id: TaskId,
    pub agent: String,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub subtask: Option<String>,
    pub progress: f32,
    pub in_tokens: u64,
    pub out_tokens: u64,
}

impl AgentState {
    pub fn is_idle_expired(&self, now: DateTime<Utc>, idle_ttl_secs: i64) -> bool {
        now - self.last_heartbeat > chrono::Duration::seconds(idle_ttl_secs)
    }

    pub fn is_dead(&self, now: DateTime<Utc>, heartbeat_interval_secs: i64) -> bool {
        now - self.last_heartbeat > chrono::Duration::seconds(heartbeat_interval_secs * 3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    FileWriteCollision,
    SemanticDisagreement,
    TestFailure,
    MergeConflict,
    ExecutionFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStatus {
    Pending,
    InArbitration,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub winner: Option<String>,
    pub rationale: String,
    pub merged_artifact: Option<serde_json::Value>,
    pub escalate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub conflict_type: ConflictType,
    pub parties: Vec<String>,
    pub evidence: serde_json::Value,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn new(
        task_id: TaskId,
        project_id: ProjectId,
        conflict_type: ConflictType,
        parties: Vec<String>,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            task_id,
            project_id,
            conflict_type,
            parties,
            evidence,
            status: ConflictStatus::Pending,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn sla_deadline(&self, sla_secs: i64) -> DateTime<Utc> {
        self.created_at + chrono::Duration::seconds(sla_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub project_id: ProjectId,
    pub day: chrono::NaiveDate,
    pub backend_id: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost: Money,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Elastic,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    Medium,
    Slow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub tier: Tier,
    pub price_in_per_million: Money,
    pub price_out_per_million: Money,
    pub context_window: u32,
    pub latency_class: LatencyClass,
    pub capability_tags: Vec<String>,
    pub endpoint: String,
}

impl ModelDescriptor {
    pub fn cost(&self, in_tokens: u64, out_tokens: u64) -> Money {
        (in_tokens as f64) * self.price_in_per_million / 1_000_000.0
            + (out_tokens as f64) * self.price_out_per_million / 1_000_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetPhase {
    Normal,
    Throttle,
    OllamaOnly,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EconomicMode {
    CostOptimized,
    Balanced,
    Performance,
}

/// Ledger snapshot returned by `BudgetStatus(projectId)`. Fractions are
/// `spent / cap`, recomputed on every `RecordCost` and cached by the ledger
/// for at most 5s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub daily: f64,
    pub monthly: f64,
    pub phase: BudgetPhase,
}

/// Four-phase classification (§4.2), inclusive lower bounds: NORMAL is the
/// only phase requiring both fractions below threshold; the rest trigger on
/// either fraction alone.
pub fn classify_budget_phase(daily_fraction: f64, monthly_fraction: f64) -> BudgetPhase {
    let worst = daily_fraction.max(monthly_fraction);
    if worst >= 0.95 {
        BudgetPhase::Halt
    } else if worst >= 0.80 {
        BudgetPhase::OllamaOnly
    } else if worst >= 0.60 {
        BudgetPhase::Throttle
    } else {
        BudgetPhase::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_descriptor_cost_matches_price_table_formula() {
        let model = ModelDescriptor {
            id: "gpt-mini".into(),
            tier: Tier::Elastic,
            price_in_per_million: 1.0,
            price_out_per_million: 2.0,
            context_window: 128_000,
            latency_class: LatencyClass::Medium,
            capability_tags: vec![],
            endpoint: "https://example".into(),
        };
        let cost = model.cost(1_000_000, 500_000);
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn context_merge_appends_into_slot() {
        let mut ctx = ProjectContext::new();
        let mut patch = BTreeMap::new();
        patch.insert(
            "decisions".to_string(),
            vec![ContextItem::Decision {
                description: "use postgres".into(),
                rationale: "team familiarity".into(),
            }],
        );
        ctx.merge(patch);
        assert_eq!(ctx.slots.get("decisions").unwrap().items.len(), 1);
    }

    #[test]
    fn budget_phase_boundaries_use_inclusive_lower_bounds() {
        assert_eq!(classify_budget_phase(0.0, 0.0), BudgetPhase::Normal);
        assert_eq!(classify_budget_phase(0.599, 0.0), BudgetPhase::Normal);
        assert_eq!(classify_budget_phase(0.60, 0.0), BudgetPhase::Throttle);
        assert_eq!(classify_budget_phase(0.0, 0.80), BudgetPhase::OllamaOnly);
        assert_eq!(classify_budget_phase(0.95, 0.0), BudgetPhase::Halt);
    }

    #[test]
    fn file_lock_expiry_is_ttl_bounded() {
        let lock = FileLock {
            project_id: ProjectId::new(),
            path: "src/x.go".into(),
            holder_agent: "a1".into(),
            task_id: TaskId::new(),
            acquired_at: Utc::now() - chrono::Duration::seconds(2),
            ttl_secs: 1,
        };
        assert!(lock.is_expired(Utc::now()));
    }

    #[test]
    fn agent_state_is_dead_after_three_missed_heartbeats() {
        let fresh = AgentState {
            task_id: TaskId::new(),
            agent: "writer".into(),
            status: AgentStatus::Working,
            last_heartbeat: Utc::now() - chrono::Duration::seconds(44),
            subtask: None,
            progress: 0.5,
            in_tokens: 0,
            out_tokens: 0,
        };
        assert!(!fresh.is_dead(Utc::now(), 15));
        let silent = AgentState { last_heartbeat: Utc::now() - chrono::Duration::seconds(46), ..fresh };
        assert!(silent.is_dead(Utc::now(), 15));
    }
}
