use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Utc};
use coord_types::{CoreResult, CostRecord, ProjectId};
use serde::{Deserialize, Serialize};

use crate::ProjectState;

/// One line of a project/day JSONL ledger file, carrying the caller-supplied
/// `request_id` so `record_cost` retries can be answered without
/// double-counting spend, and a monotonic `seq` mirroring the teacher's
/// `RunEventRecord` sequencing convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    seq: u64,
    request_id: String,
    record: CostRecord,
}

pub(crate) struct LedgerStore {
    base_dir: PathBuf,
}

impl LedgerStore {
    pub(crate) fn new(base_dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn project_dir(&self, project_id: ProjectId) -> PathBuf {
        self.base_dir.join(project_id.to_string())
    }

    fn day_path(&self, project_id: ProjectId, day: chrono::NaiveDate) -> PathBuf {
        self.project_dir(project_id).join(format!("{day}.jsonl"))
    }

    /// Append-only write via a temp-file-then-rename-free direct append —
    /// unlike `save_run`'s whole-file atomic rewrite, a ledger day file only
    /// ever grows, so a single `O_APPEND` write is sufficient and cheaper.
    pub(crate) async fn append(
        &self,
        project_id: ProjectId,
        seq: u64,
        request_id: &str,
        record: &CostRecord,
    ) -> CoreResult<()> {
        let dir = self.project_dir(project_id);
        fs::create_dir_all(&dir)?;
        let path = self.day_path(project_id, record.day);
        let entry = LedgerEntry {
            seq,
            request_id: request_id.to_string(),
            record: record.clone(),
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub(crate) async fn find_by_request_id(
        &self,
        project_id: ProjectId,
        request_id: &str,
    ) -> CoreResult<Option<CostRecord>> {
        let today = Utc::now().date_naive();
        let path = self.day_path(project_id, today);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line)?;
            if entry.request_id == request_id {
                return Ok(Some(entry.record));
            }
        }
        Ok(None)
    }

    /// Rebuild today's and this month's running totals from the day files on
    /// disk. Called once per project, the first time it is touched after
    /// process start, so a restart does not lose budget-phase accuracy.
    pub(crate) async fn rehydrate(&self, project_id: ProjectId, now: DateTime<Utc>) -> CoreResult<ProjectState> {
        let mut state = ProjectState::new(now);
        let dir = self.project_dir(project_id);
        if !dir.exists() {
            return Ok(state);
        }
        let month = (now.date_naive().year(), now.date_naive().month());
        let mut entries: Vec<_> = fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(day) = stem.parse::<chrono::NaiveDate>() else {
                continue;
            };
            if (day.year(), day.month()) != month {
                continue;
            }
            let file = File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: LedgerEntry = serde_json::from_str(&line)?;
                state.monthly_total += parsed.record.cost;
                if day == state.day {
                    state.daily_total += parsed.record.cost;
                    state.seen_request_ids.insert(parsed.request_id.clone());
                }
                state.next_seq = state.next_seq.max(parsed.seq + 1);
            }
        }
        Ok(state)
    }
}
