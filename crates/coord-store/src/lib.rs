//! The task store: a filesystem-backed persistence layer for the logical
//! `projects`/`tasks`/`conflicts` tables of §6. Cost records are not
//! duplicated here — `coord-ledger` is their single source of truth and the
//! HTTP surface reads spend directly from it — so this crate owns exactly
//! the two tables the orchestrator writes durably per task (`projects`,
//! `tasks`) plus an append-only conflict history for audit/query.
//!
//! Grounded in the teacher's `OrchestratorStore` (`src-tauri/src/
//! orchestrator/store.rs`): one directory per entity root, whole-file
//! atomic write-then-rename for mutable records, append-only JSON-lines for
//! history. Blocking `std::fs` calls are offloaded to `spawn_blocking` so
//! they never stall an async dispatch loop (§5).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use coord_types::{Conflict, CoreError, CoreResult, Project, ProjectId, Task, TaskId};

#[derive(Clone)]
pub struct TaskStore {
    base_dir: PathBuf,
}

fn io_err(err: std::io::Error) -> CoreError {
    CoreError::DependencyUnavailable(format!("task store I/O error: {err}"))
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let body = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &body).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let raw = fs::read_to_string(path).map_err(io_err)?;
    Ok(serde_json::from_str(&raw)?)
}

impl TaskStore {
    pub fn new(base_dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&base_dir).map_err(io_err)?;
        Ok(Self { base_dir })
    }

    fn project_dir(&self, project_id: ProjectId) -> PathBuf {
        self.base_dir.join(project_id.to_string())
    }

    fn project_path(&self, project_id: ProjectId) -> PathBuf {
        self.project_dir(project_id).join("project.json")
    }

    fn task_path(&self, project_id: ProjectId, task_id: TaskId) -> PathBuf {
        self.project_dir(project_id).join("tasks").join(format!("{task_id}.json"))
    }

    fn conflicts_path(&self, project_id: ProjectId) -> PathBuf {
        self.project_dir(project_id).join("conflicts.jsonl")
    }

    pub async fn save_project(&self, project: &Project) -> CoreResult<()> {
        let path = self.project_path(project.id);
        let project = project.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &project))
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn load_project(&self, project_id: ProjectId) -> CoreResult<Project> {
        let path = self.project_path(project_id);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Err(CoreError::NotFound(format!("project {project_id}")));
            }
            read_json(&path)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn list_projects(&self) -> CoreResult<Vec<Project>> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut projects = Vec::new();
            if !base_dir.exists() {
                return Ok(projects);
            }
            for entry in fs::read_dir(&base_dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let path = entry.path().join("project.json");
                if path.exists() {
                    projects.push(read_json(&path)?);
                }
            }
            Ok(projects)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    /// Explicit deletion (§3 Project lifecycle: "destroyed only by explicit
    /// deletion"). Removes the whole project directory tree.
    pub async fn delete_project(&self, project_id: ProjectId) -> CoreResult<()> {
        let dir = self.project_dir(project_id);
        tokio::task::spawn_blocking(move || {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(io_err)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn save_task(&self, task: &Task) -> CoreResult<()> {
        let path = self.task_path(task.project_id, task.id);
        let task = task.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&path, &task))
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn load_task(&self, project_id: ProjectId, task_id: TaskId) -> CoreResult<Task> {
        let path = self.task_path(project_id, task_id);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Err(CoreError::NotFound(format!("task {task_id}")));
            }
            read_json(&path)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    /// Looks a task up by id alone, scanning every project directory. Used
    /// by the HTTP surface's `GET /tasks/{id}`, which (per §6) is not
    /// scoped to a project in its path.
    pub async fn find_task(&self, task_id: TaskId) -> CoreResult<Task> {
        let base_dir = self.base_dir.clone();
        tokio::task::spawn_blocking(move || {
            if !base_dir.exists() {
                return Err(CoreError::NotFound(format!("task {task_id}")));
            }
            for entry in fs::read_dir(&base_dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let path = entry.path().join("tasks").join(format!("{task_id}.json"));
                if path.exists() {
                    return read_json(&path);
                }
            }
            Err(CoreError::NotFound(format!("task {task_id}")))
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn list_tasks(&self, project_id: ProjectId) -> CoreResult<Vec<Task>> {
        let dir = self.project_dir(project_id).join("tasks");
        tokio::task::spawn_blocking(move || {
            let mut tasks = Vec::new();
            if !dir.exists() {
                return Ok(tasks);
            }
            for entry in fs::read_dir(&dir).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                tasks.push(read_json(&entry.path())?);
            }
            tasks.sort_by_key(|t: &Task| t.created_at);
            Ok(tasks)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    /// Append a conflict snapshot to the project's history log. Called
    /// whenever the bus's conflict status changes, so the task store keeps
    /// a durable, queryable trail independent of the bus's in-memory record.
    pub async fn append_conflict_history(&self, conflict: &Conflict) -> CoreResult<()> {
        let path = self.conflicts_path(conflict.project_id);
        let conflict = conflict.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            let line = serde_json::to_string(&conflict)?;
            let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
            writeln!(file, "{line}").map_err(io_err)?;
            Ok(())
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }

    pub async fn list_conflict_history(&self, project_id: ProjectId) -> CoreResult<Vec<Conflict>> {
        let path = self.conflicts_path(project_id);
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !path.exists() {
                return Ok(out);
            }
            let file = File::open(&path).map_err(io_err)?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(io_err)?;
                if line.trim().is_empty() {
                    continue;
                }
                out.push(serde_json::from_str(&line)?);
            }
            Ok(out)
        })
        .await
        .map_err(|e| CoreError::Internal(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_types::{AgentRole, BudgetCaps, TaskClass};
    use tempfile::tempdir;

    fn project() -> Project {
        Project::new(
            "demo".to_string(),
            vec!["build a thing".to_string()],
            5,
            BudgetCaps { currency: "USD".to_string(), daily: 10.0, monthly: 100.0 },
        )
    }

    #[tokio::test]
    async fn project_round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf()).unwrap();
        let project = project();
        store.save_project(&project).await.unwrap();
        let loaded = store.load_project(project.id).await.unwrap();
        assert_eq!(loaded.name, "demo");
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.load_project(ProjectId::new()).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn tasks_list_sorted_by_creation_time() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf()).unwrap();
        let project = project();
        store.save_project(&project).await.unwrap();
        let t1 = Task::new(project.id, "stage-1", AgentRole::Researcher, TaskClass::Research, serde_json::json!({}));
        let t2 = Task::new(project.id, "stage-1", AgentRole::Writer, TaskClass::General, serde_json::json!({}));
        store.save_task(&t1).await.unwrap();
        store.save_task(&t2).await.unwrap();
        let tasks = store.list_tasks(project.id).await.unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[tokio::test]
    async fn find_task_locates_a_task_without_knowing_its_project() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf()).unwrap();
        let project = project();
        store.save_project(&project).await.unwrap();
        let t1 = Task::new(project.id, "stage-1", AgentRole::Researcher, TaskClass::Research, serde_json::json!({}));
        store.save_task(&t1).await.unwrap();
        let found = store.find_task(t1.id).await.unwrap();
        assert_eq!(found.id, t1.id);
        assert!(store.find_task(TaskId::new()).await.is_err());
    }

    #[tokio::test]
    async fn delete_project_removes_its_tree() {
        let dir = tempdir().unwrap();
        let store = TaskStore::new(dir.path().to_path_buf()).unwrap();
        let project = project();
        store.save_project(&project).await.unwrap();
        store.delete_project(project.id).await.unwrap();
        assert!(store.load_project(project.id).await.is_err());
    }
}
