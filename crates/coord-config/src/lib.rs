//! Layered configuration for the coordination core, following the same
//! defaults-then-overlay discipline the teacher's `ConfigStore` uses: a
//! `serde_json::Value` is deep-merged across layers (defaults < file < env <
//! CLI) and only deserialized into the strongly typed [`Config`] once all
//! layers are applied. Secrets never round-trip back into a file layer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use coord_types::{EconomicMode, Tier};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusSection {
    pub address: Option<String>,
    #[serde(skip_serializing)]
    pub credential: Option<String>,
    pub key_prefix: String,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            address: None,
            credential: None,
            key_prefix: "coord".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(skip_serializing)]
    pub connection: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { connection: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencySection {
    pub per_project: usize,
    pub global: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            per_project: 8,
            global: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSection {
    pub concurrency: ConcurrencySection,
    pub deadline_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencySection::default(),
            deadline_secs: 600,
            heartbeat_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSection {
    pub default_ttl_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        // Open Question 1: 300s is authoritative, not the 5 min docs figure.
        Self {
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSection {
    pub daily: f64,
    pub monthly: f64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            daily: 50.0,
            monthly: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterOverrides {
    pub arbitrator: Tier,
    pub orchestrator: Tier,
}

impl Default for RouterOverrides {
    fn default() -> Self {
        Self {
            arbitrator: Tier::Premium,
            orchestrator: Tier::Elastic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterSection {
    pub mode: EconomicMode,
    pub overrides: RouterOverrides,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            mode: EconomicMode::Balanced,
            overrides: RouterOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSection {
    pub context_retention_days: u64,
    pub conflict_retention_days: u64,
    pub agent_state_idle_ttl_secs: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            context_retention_days: 7,
            conflict_retention_days: 7,
            agent_state_idle_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub tier: Tier,
    pub endpoint: String,
    #[serde(skip_serializing, default)]
    pub credential: Option<String>,
    pub price_in: f64,
    pub price_out: f64,
    pub context_window: u32,
}

fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig {
            id: "local-ollama".to_string(),
            tier: Tier::Local,
            endpoint: "http://127.0.0.1:11434/v1".to_string(),
            credential: None,
            price_in: 0.0,
            price_out: 0.0,
            context_window: 32_000,
        },
        BackendConfig {
            id: "elastic-default".to_string(),
            tier: Tier::Elastic,
            endpoint: "https://api.openai.com/v1".to_string(),
            credential: None,
            price_in: 0.15,
            price_out: 0.6,
            context_window: 128_000,
        },
        BackendConfig {
            id: "premium-default".to_string(),
            tier: Tier::Premium,
            endpoint: "https://api.anthropic.com/v1".to_string(),
            credential: None,
            price_in: 3.0,
            price_out: 15.0,
            context_window: 200_000,
        },
    ]
}

/// Fully merged, strongly typed runtime configuration. Never round-tripped
/// back to a file: credentials are `skip_serializing` and the CLI/env layers
/// are not persisted anywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusSection,
    pub store: StoreSection,
    pub task: TaskSection,
    pub lock: LockSection,
    pub budget: BudgetSection,
    pub router: RouterSection,
    pub breaker: BreakerSection,
    pub retention: RetentionSection,
    pub backends: Vec<BackendConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusSection::default(),
            store: StoreSection::default(),
            task: TaskSection::default(),
            lock: LockSection::default(),
            budget: BudgetSection::default(),
            router: RouterSection::default(),
            breaker: BreakerSection::default(),
            retention: RetentionSection::default(),
            backends: default_backends(),
        }
    }
}

/// CLI flags accepted by `coord-engine`, layered on top of file/env config.
#[derive(Debug, Parser, Clone)]
#[command(name = "coord-engine", about = "Coordination core engine")]
pub struct CliArgs {
    /// Path to a YAML config file. Defaults to `config.yaml` in the working directory.
    #[arg(long, env = "COORD_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    #[arg(long, env = "COORD_BUS_ADDRESS")]
    pub bus_address: Option<String>,

    #[arg(long, env = "COORD_ROUTER_MODE")]
    pub router_mode: Option<String>,

    #[arg(long, env = "COORD_TASK_CONCURRENCY_PER_PROJECT")]
    pub task_concurrency_per_project: Option<usize>,

    #[arg(long, env = "COORD_TASK_CONCURRENCY_GLOBAL")]
    pub task_concurrency_global: Option<usize>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

/// Secret-bearing environment variables recognized by the engine. Credentials
/// are read only from the environment and never written back to a file
/// layer or logged (coord-observability's `redact_text` is used wherever
/// these values must appear in a log line).
fn env_layer() -> Value {
    let mut root = empty_object();

    if let Ok(credential) = std::env::var("COORD_BUS_CREDENTIAL") {
        deep_merge(&mut root, &json!({ "bus": { "credential": credential } }));
    }
    if let Ok(address) = std::env::var("COORD_BUS_ADDRESS") {
        deep_merge(&mut root, &json!({ "bus": { "address": address } }));
    }
    if let Ok(prefix) = std::env::var("COORD_BUS_KEY_PREFIX") {
        deep_merge(&mut root, &json!({ "bus": { "keyPrefix": prefix } }));
    }
    if let Ok(connection) = std::env::var("COORD_STORE_CONNECTION") {
        deep_merge(&mut root, &json!({ "store": { "connection": connection } }));
    }
    if let Ok(daily) = std::env::var("COORD_BUDGET_DAILY") {
        if let Ok(v) = daily.parse::<f64>() {
            deep_merge(&mut root, &json!({ "budget": { "daily": v } }));
        }
    }
    if let Ok(monthly) = std::env::var("COORD_BUDGET_MONTHLY") {
        if let Ok(v) = monthly.parse::<f64>() {
            deep_merge(&mut root, &json!({ "budget": { "monthly": v } }));
        }
    }
    if let Ok(mode) = std::env::var("COORD_ROUTER_MODE") {
        deep_merge(&mut root, &json!({ "router": { "mode": mode } }));
    }

    let mut backend_credentials: HashMap<String, String> = HashMap::new();
    for (key, value) in std::env::vars() {
        if let Some(backend_id) = key.strip_prefix("COORD_BACKEND_").and_then(|rest| rest.strip_suffix("_CREDENTIAL")) {
            backend_credentials.insert(backend_id.to_ascii_lowercase(), value);
        }
    }
    if !backend_credentials.is_empty() {
        root.as_object_mut()
            .expect("root is always an object")
            .insert(
                "_backend_credentials".to_string(),
                json!(backend_credentials),
            );
    }

    root
}

/// Load configuration by applying, in order: compiled defaults, an optional
/// YAML file, environment variables, then CLI overrides. Each layer deep-
/// merges over the previous one (teacher's `deep_merge`/`ConfigLayers`
/// pattern), so a partial file only needs to specify the keys it changes.
pub fn load(args: &CliArgs) -> anyhow::Result<Config> {
    let defaults = serde_json::to_value(Config::default())?;

    let file_layer = match &args.config_file {
        Some(path) => read_yaml_layer(path)?,
        None => {
            let default_path = Path::new("config.yaml");
            if default_path.exists() {
                read_yaml_layer(default_path)?
            } else {
                empty_object()
            }
        }
    };

    let env_layer = env_layer();

    let mut cli_layer = empty_object();
    if let Some(address) = &args.bus_address {
        deep_merge(&mut cli_layer, &json!({ "bus": { "address": address } }));
    }
    if let Some(mode) = &args.router_mode {
        deep_merge(&mut cli_layer, &json!({ "router": { "mode": mode } }));
    }
    if let Some(per_project) = args.task_concurrency_per_project {
        deep_merge(
            &mut cli_layer,
            &json!({ "task": { "concurrency": { "perProject": per_project } } }),
        );
    }
    if let Some(global) = args.task_concurrency_global {
        deep_merge(
            &mut cli_layer,
            &json!({ "task": { "concurrency": { "global": global } } }),
        );
    }

    let mut merged = empty_object();
    deep_merge(&mut merged, &defaults);
    deep_merge(&mut merged, &file_layer);
    deep_merge(&mut merged, &env_layer);
    deep_merge(&mut merged, &cli_layer);

    apply_backend_credentials(&mut merged);

    let config: Config = serde_json::from_value(merged)?;
    Ok(config)
}

fn apply_backend_credentials(merged: &mut Value) {
    let Some(root) = merged.as_object_mut() else {
        return;
    };
    let Some(credentials) = root.remove("_backend_credentials") else {
        return;
    };
    let Some(credentials) = credentials.as_object() else {
        return;
    };
    let Some(backends) = root.get_mut("backends").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for backend in backends {
        let Some(id) = backend.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
            continue;
        };
        if let Some(credential) = credentials.get(&id) {
            if let Some(obj) = backend.as_object_mut() {
                obj.insert("credential".to_string(), credential.clone());
            }
        }
    }
}

fn read_yaml_layer(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let value: Value = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(value)
}
