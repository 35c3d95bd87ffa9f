//! The Arbitrator (C5): drains the conflict queue and converts unresolved
//! conflicts into structured resolutions. Grounded in the teacher's
//! strict-then-fallback JSON parsing discipline
//! (`AgentPrompts::parse_validation_result_strict`/`_fallback` in
//! `src-tauri/src/orchestrator/agents.rs`), generalized from validation
//! results to `ConflictResolution`.

use std::sync::Arc;
use std::time::Duration;

use coord_bus::Bus;
use coord_client::{GenerateOptions, InferenceClient};
use coord_ledger::CostLedger;
use coord_router::{Component, ModelRouter, SelectRequest};
use coord_types::{
    Conflict, ConflictId, ConflictResolution, ConflictStatus, CoreResult, EconomicMode,
    ProjectContext, TaskClass,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long a single `PopPendingConflict` poll waits before looping again,
/// per §4.5 ("repeatedly `PopPendingConflict` with a 30s timeout").
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Arbitrator<B: Bus> {
    bus: Arc<B>,
    ledger: Arc<CostLedger>,
    router: Arc<ModelRouter>,
    client: Arc<InferenceClient>,
    mode: EconomicMode,
}

impl<B: Bus> Arbitrator<B> {
    pub fn new(
        bus: Arc<B>,
        ledger: Arc<CostLedger>,
        router: Arc<ModelRouter>,
        client: Arc<InferenceClient>,
        mode: EconomicMode,
    ) -> Self {
        Self { bus, ledger, router, client, mode }
    }

    /// Runs the drain loop until `cancel` fires. Each iteration pops at
    /// most one pending conflict; a `None` from a timed-out poll just loops.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let popped = tokio::select! {
                result = self.bus.pop_pending_conflict(POLL_TIMEOUT) => result,
                _ = cancel.cancelled() => return,
            };
            match popped {
                Ok(Some(conflict_id)) => {
                    if let Err(err) = self.arbitrate(conflict_id, &cancel).await {
                        warn!(%conflict_id, error = %err, "arbitration failed");
                    }
                }
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "conflict poll failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn arbitrate(&self, conflict_id: ConflictId, cancel: &CancellationToken) -> CoreResult<()> {
        let conflict = self.bus.get_conflict(conflict_id).await?;
        self.bus
            .update_conflict_status(conflict_id, ConflictStatus::InArbitration, None)
            .await?;

        let context = self.bus.get_project_context(conflict.project_id).await.unwrap_or_else(|_| ProjectContext::new());
        let prompt = build_prompt(&conflict, &context);

        let resolution = match self.resolve(conflict.project_id, &prompt, cancel).await {
            Ok(resolution) => resolution,
            Err(err) => {
                warn!(%conflict_id, error = %err, "arbitration call failed, escalating");
                escalated(format!("inference failure: {err}"))
            }
        };

        let status = if resolution.escalate { ConflictStatus::Escalated } else { ConflictStatus::Resolved };
        self.bus.update_conflict_status(conflict_id, status, Some(resolution)).await?;
        info!(%conflict_id, ?status, "conflict arbitration complete");
        Ok(())
    }

    async fn resolve(&self, project_id: coord_types::ProjectId, prompt: &str, cancel: &CancellationToken) -> CoreResult<ConflictResolution> {
        let budget = self.ledger.budget_status(project_id).await?;
        let request = SelectRequest {
            est_in_tokens: prompt.len() as u64 / 4,
            est_out_tokens: 512,
            task_class: TaskClass::Arbitration,
            mode: self.mode,
            budget,
            component: Component::Arbitrator,
        };
        let chain = self.router.select(&request)?;
        let options = GenerateOptions { max_tokens: 768, temperature: 0.2, ..Default::default() };
        let request_id = format!("arbitration-{project_id}-{}", uuid::Uuid::new_v4());

        let result = self
            .client
            .generate_with_fallback(&chain, project_id, prompt, &options, &request_id, cancel)
            .await?;

        match parse_resolution_strict(&result.text) {
            Ok(resolution) => return Ok(resolution),
            Err(first_err) => warn!(error = %first_err, "first arbitration parse failed, retrying with a repaired prompt"),
        }

        let repaired_prompt = format!(
            "{prompt}\n\nYour previous reply could not be parsed as JSON. Reply with ONLY a single JSON object of the form {{\"winner\": string|null, \"rationale\": string, \"merged_artifact\": object|null, \"escalate\": bool}}."
        );
        let retry_id = format!("{request_id}-retry");
        let retry_result = self
            .client
            .generate_with_fallback(&chain, project_id, &repaired_prompt, &options, &retry_id, cancel)
            .await?;

        if let Ok(resolution) = parse_resolution_strict(&retry_result.text) {
            return Ok(resolution);
        }
        if let Some(resolution) = parse_resolution_fallback(&retry_result.text) {
            return Ok(resolution);
        }
        Ok(escalated("model output did not parse as a conflict resolution after one corrective retry".to_string()))
    }
}

fn escalated(rationale: String) -> ConflictResolution {
    ConflictResolution { winner: None, rationale, merged_artifact: None, escalate: true }
}

fn build_prompt(conflict: &Conflict, context: &ProjectContext) -> String {
    let evidence = serde_json::to_string_pretty(&conflict.evidence).unwrap_or_default();
    let relevant_slots: Vec<&String> = context.slots.keys().collect();
    format!(
        "A coordination conflict needs resolution.\n\nType: {:?}\nParties: {}\nEvidence:\n{}\nRelevant context slots: {:?}\n\n\
         Respond with ONLY a single JSON object: {{\"winner\": string|null, \"rationale\": string, \
         \"merged_artifact\": object|null, \"escalate\": bool}}. Set escalate to true if the conflict cannot \
         be safely resolved automatically.",
        conflict.conflict_type,
        conflict.parties.join(", "),
        evidence,
        relevant_slots,
    )
}

#[derive(serde::Deserialize)]
struct RawResolution {
    #[serde(default)]
    winner: Option<String>,
    #[serde(default)]
    rationale: String,
    #[serde(default)]
    merged_artifact: Option<serde_json::Value>,
    #[serde(default)]
    escalate: bool,
}

fn parse_resolution_strict(output: &str) -> Result<ConflictResolution, String> {
    if let Ok(raw) = serde_json::from_str::<RawResolution>(output) {
        return Ok(from_raw(raw));
    }
    for candidate in json_candidates(output) {
        if let Ok(raw) = serde_json::from_str::<RawResolution>(&candidate) {
            return Ok(from_raw(raw));
        }
    }
    Err("arbitrator response did not match the expected JSON schema".to_string())
}

fn parse_resolution_fallback(output: &str) -> Option<ConflictResolution> {
    let lower = output.to_lowercase();
    if lower.contains("cannot be resolved") || lower.contains("escalat") {
        return Some(escalated(output.lines().take(6).collect::<Vec<_>>().join(" ")));
    }
    None
}

fn from_raw(raw: RawResolution) -> ConflictResolution {
    ConflictResolution {
        winner: raw.winner,
        rationale: if raw.rationale.trim().is_empty() { "no rationale provided".to_string() } else { raw.rationale },
        merged_artifact: raw.merged_artifact,
        escalate: raw.escalate,
    }
}

fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(start) = output.find("```json") {
        let after = &output[start + "```json".len()..];
        if let Some(end) = after.find("```") {
            out.push(after[..end].trim().to_string());
        }
    }
    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start <= end {
            out.push(output[start..=end].to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parse_accepts_a_clean_json_object() {
        let parsed = parse_resolution_strict(r#"{"winner":"writer","rationale":"writer's version matches requirements","merged_artifact":null,"escalate":false}"#).unwrap();
        assert_eq!(parsed.winner.as_deref(), Some("writer"));
        assert!(!parsed.escalate);
    }

    #[test]
    fn strict_parse_recovers_json_wrapped_in_prose() {
        let output = "Here is my decision:\n```json\n{\"winner\":null,\"rationale\":\"merge both\",\"merged_artifact\":{\"a\":1},\"escalate\":false}\n```\nThanks.";
        let parsed = parse_resolution_strict(output).unwrap();
        assert_eq!(parsed.merged_artifact, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn strict_parse_rejects_pure_prose() {
        assert!(parse_resolution_strict("I think the writer is right but I won't say why.").is_err());
    }

    #[test]
    fn fallback_infers_escalation_from_prose() {
        let resolution = parse_resolution_fallback("This conflict cannot be resolved automatically, it needs a human.").unwrap();
        assert!(resolution.escalate);
    }

    #[test]
    fn build_prompt_includes_conflict_type_and_parties() {
        let conflict = Conflict::new(
            coord_types::TaskId::new(),
            coord_types::ProjectId::new(),
            coord_types::ConflictType::FileWriteCollision,
            vec!["writer".to_string(), "reviewer".to_string()],
            serde_json::json!({"path": "src/main.rs"}),
        );
        let prompt = build_prompt(&conflict, &ProjectContext::new());
        assert!(prompt.contains("FileWriteCollision"));
        assert!(prompt.contains("writer, reviewer"));
    }
}
