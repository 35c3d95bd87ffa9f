use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConflictId, ProjectId, TaskId};
use crate::model::{AgentStatus, BudgetPhase, ConflictType};

/// Everything that travels over the context bus' pub/sub channel and, via
/// `coord-server`, out to WebSocket subscribers. One topic family, tagged by
/// `type` so a single broadcast channel can carry the whole event surface
/// (mirrors the envelope-over-one-channel pattern used for stream events).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    TaskStarted {
        project_id: ProjectId,
        task_id: TaskId,
        agent: String,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        project_id: ProjectId,
        task_id: TaskId,
        at: DateTime<Utc>,
    },
    TaskFailed {
        project_id: ProjectId,
        task_id: TaskId,
        error_code: String,
        at: DateTime<Utc>,
    },
    ConflictRecorded {
        project_id: ProjectId,
        conflict_id: ConflictId,
        conflict_type: ConflictType,
        at: DateTime<Utc>,
    },
    ConflictResolved {
        project_id: ProjectId,
        conflict_id: ConflictId,
        winner: Option<String>,
        at: DateTime<Utc>,
    },
    ConflictEscalated {
        project_id: ProjectId,
        conflict_id: ConflictId,
        reason: String,
        at: DateTime<Utc>,
    },
    BudgetPhaseChanged {
        project_id: ProjectId,
        previous: BudgetPhase,
        current: BudgetPhase,
        at: DateTime<Utc>,
    },
    AgentState {
        project_id: ProjectId,
        task_id: TaskId,
        agent: String,
        status: AgentStatus,
        at: DateTime<Utc>,
    },
    ContextUpdate {
        project_id: ProjectId,
        slots: Vec<String>,
        at: DateTime<Utc>,
    },
    LockReleased {
        project_id: ProjectId,
        path: String,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn project_id(&self) -> ProjectId {
        match self {
            BusEvent::TaskStarted { project_id, .. }
            | BusEvent::TaskCompleted { project_id, .. }
            | BusEvent::TaskFailed { project_id, .. }
            | BusEvent::ConflictRecorded { project_id, .. }
            | BusEvent::ConflictResolved { project_id, .. }
            | BusEvent::ConflictEscalated { project_id, .. }
            | BusEvent::BudgetPhaseChanged { project_id, .. }
            | BusEvent::AgentState { project_id, .. }
            | BusEvent::ContextUpdate { project_id, .. }
            | BusEvent::LockReleased { project_id, .. } => *project_id,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            BusEvent::TaskStarted { .. } => "task.started",
            BusEvent::TaskCompleted { .. } => "task.completed",
            BusEvent::TaskFailed { .. } => "task.failed",
            BusEvent::ConflictRecorded { .. } => "conflict.recorded",
            BusEvent::ConflictResolved { .. } => "conflict.resolved",
            BusEvent::ConflictEscalated { .. } => "conflict.escalated",
            BusEvent::BudgetPhaseChanged { .. } => "budget.phase-changed",
            BusEvent::AgentState { .. } => "agent.state",
            BusEvent::ContextUpdate { .. } => "context-update",
            BusEvent::LockReleased { .. } => "lock-released",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_match_the_wire_vocabulary() {
        let event = BusEvent::LockReleased {
            project_id: ProjectId::new(),
            path: "a.rs".into(),
            at: Utc::now(),
        };
        assert_eq!(event.topic(), "lock-released");
    }
}
