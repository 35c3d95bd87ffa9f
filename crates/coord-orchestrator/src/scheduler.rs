//! DAG-based readiness and failure analysis over a stage's task slice.
//! Grounded in the teacher's `TaskScheduler`
//! (`src-tauri/src/orchestrator/scheduler.rs`): `get_all_runnable`,
//! `all_completed`, `any_failed`, `has_deadlock`, and `detect_cycle` all
//! reappear here with the same semantics, retargeted from the teacher's
//! string-keyed `Task::dependencies` to `coord_types::Task::depends_on`
//! (`TaskId`-keyed).

use std::collections::{HashMap, HashSet};

use coord_types::{Task, TaskId, TaskStatus};

pub struct TaskScheduler;

impl TaskScheduler {
    /// Tasks that are `Queued` with every dependency `Succeeded`.
    pub fn ready(tasks: &[Task]) -> Vec<TaskId> {
        let succeeded: HashSet<TaskId> = tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).map(|t| t.id).collect();
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && t.depends_on.iter().all(|dep| succeeded.contains(dep)))
            .map(|t| t.id)
            .collect()
    }

    pub fn all_succeeded(tasks: &[Task]) -> bool {
        tasks.iter().all(|t| t.status == TaskStatus::Succeeded)
    }

    pub fn any_failed(tasks: &[Task]) -> bool {
        tasks.iter().any(|t| t.status == TaskStatus::Failed)
    }

    pub fn in_flight(tasks: &[Task]) -> bool {
        tasks.iter().any(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Blocked))
    }

    /// A `Queued` task that depends on a `Failed` task can never become
    /// ready; such stalls are reported as a deadlock rather than spun on
    /// forever.
    pub fn has_deadlock(tasks: &[Task]) -> bool {
        let failed: HashSet<TaskId> = tasks.iter().filter(|t| t.status == TaskStatus::Failed).map(|t| t.id).collect();
        tasks
            .iter()
            .any(|t| t.status == TaskStatus::Queued && t.depends_on.iter().any(|dep| failed.contains(dep)))
    }

    pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<TaskId>> {
        let by_id: HashMap<TaskId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
        for task in tasks {
            let mut visited = HashSet::new();
            let mut path = Vec::new();
            if Self::dfs_cycle(task.id, &by_id, &mut visited, &mut path) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_cycle(id: TaskId, by_id: &HashMap<TaskId, &Task>, visited: &mut HashSet<TaskId>, path: &mut Vec<TaskId>) -> bool {
        if path.contains(&id) {
            path.push(id);
            return true;
        }
        if visited.contains(&id) {
            return false;
        }
        visited.insert(id);
        path.push(id);
        if let Some(task) = by_id.get(&id) {
            for dep in &task.depends_on {
                if Self::dfs_cycle(*dep, by_id, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    pub fn validate(tasks: &[Task]) -> Result<(), String> {
        if let Some(cycle) = Self::detect_cycle(tasks) {
            return Err(format!("dependency cycle detected: {cycle:?}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::{AgentRole, ProjectId, TaskClass};

    fn task(project_id: ProjectId, deps: Vec<TaskId>) -> Task {
        let mut t = Task::new(project_id, "s1", AgentRole::Writer, TaskClass::General, serde_json::json!({}));
        t.depends_on = deps;
        t
    }

    #[test]
    fn ready_excludes_tasks_with_unsatisfied_dependencies() {
        let project_id = ProjectId::new();
        let t1 = task(project_id, vec![]);
        let mut t2 = task(project_id, vec![t1.id]);
        t2.status = TaskStatus::Queued;
        let tasks = vec![t1, t2.clone()];
        let ready = TaskScheduler::ready(&tasks);
        assert_eq!(ready, vec![tasks[0].id]);
    }

    #[test]
    fn ready_includes_tasks_once_dependency_succeeds() {
        let project_id = ProjectId::new();
        let mut t1 = task(project_id, vec![]);
        t1.status = TaskStatus::Succeeded;
        let t2 = task(project_id, vec![t1.id]);
        let tasks = vec![t1, t2.clone()];
        assert_eq!(TaskScheduler::ready(&tasks), vec![t2.id]);
    }

    #[test]
    fn deadlock_detected_when_queued_task_depends_on_failed_task() {
        let project_id = ProjectId::new();
        let mut t1 = task(project_id, vec![]);
        t1.status = TaskStatus::Failed;
        let t2 = task(project_id, vec![t1.id]);
        let tasks = vec![t1, t2];
        assert!(TaskScheduler::has_deadlock(&tasks));
    }

    #[test]
    fn cycle_detection_finds_a_two_node_cycle() {
        let project_id = ProjectId::new();
        let t1 = task(project_id, vec![]);
        let mut t2 = task(project_id, vec![t1.id]);
        let mut t1 = t1;
        t1.depends_on.push(t2.id);
        t2.status = TaskStatus::Queued;
        let tasks = vec![t1, t2];
        assert!(TaskScheduler::detect_cycle(&tasks).is_some());
        assert!(TaskScheduler::validate(&tasks).is_err());
    }

    #[test]
    fn all_succeeded_requires_every_task_in_terminal_success() {
        let project_id = ProjectId::new();
        let mut t1 = task(project_id, vec![]);
        t1.status = TaskStatus::Succeeded;
        let t2 = task(project_id, vec![]);
        assert!(!TaskScheduler::all_succeeded(&[t1.clone(), t2.clone()]));
        let mut t2 = t2;
        t2.status = TaskStatus::Succeeded;
        assert!(TaskScheduler::all_succeeded(&[t1, t2]));
    }
}
