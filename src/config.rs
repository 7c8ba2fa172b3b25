//! Settings: a flat `settings.json` in the data directory, overridable per
//! key by environment variables.
//!
//! Resolution order per key: canonical env (`MNEMO_*`) → legacy env
//! (`CODEX_MEM_*`, one-shot deprecation warning) → settings file → built-in
//! default. Canonical always wins when both env forms are present.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Prefix shown in place of secret values on read; at most the last four
/// characters of the original survive.
pub const MASK_SENTINEL: &str = "••••••••";

/// Default worker port.
pub const DEFAULT_PORT: u16 = 37777;

/// Which LLM backend handles a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// HTTPS chat-completions API.
    Hosted,
    /// Chat against a local daemon (Ollama-style).
    Local,
    /// External CLI binary driven over temp files.
    Cli,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::Local => "local",
            Self::Cli => "cli",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hosted" => Ok(Self::Hosted),
            "local" => Ok(Self::Local),
            "cli" => Ok(Self::Cli),
            _ => Err(format!("unknown provider: {s}")),
        }
    }
}

/// Rule selecting the alternate provider on fallback-eligible failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Prefer the CLI provider when configured, else hosted.
    #[default]
    Auto,
    /// Never fall back.
    Off,
    /// Always fall back to the CLI provider.
    Cli,
    /// Always fall back to the hosted provider.
    Hosted,
}

impl FallbackPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Off => "off",
            Self::Cli => "cli",
            Self::Hosted => "hosted",
        }
    }
}

impl std::str::FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "off" => Ok(Self::Off),
            "cli" => Ok(Self::Cli),
            "hosted" => Ok(Self::Hosted),
            _ => Err(format!("unknown fallback policy: {s}")),
        }
    }
}

/// Fully resolved settings snapshot.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: ProviderKind,
    pub model: String,
    pub fallback_model: String,
    pub api_key: Option<String>,
    pub base_url: String,
    pub timeout_ms: u64,
    pub temperature: f64,
    pub context_size: u32,
    /// Extra provider options; must be a plain JSON map.
    pub extra_options: Map<String, Value>,
    /// Reasoning effort forwarded to the CLI provider.
    pub reasoning_effort: String,
    pub cli_binary: String,
    /// Route the CLI provider through the local daemon via env injection.
    pub cli_open_bridge: bool,

    pub worker_host: String,
    pub worker_port: u16,
    pub data_dir: PathBuf,

    pub mode: String,
    pub fallback_policy: FallbackPolicy,
    pub queue_cap: usize,
    pub max_concurrent_sessions: usize,

    // Context assembly
    pub context_observation_count: usize,
    pub context_include_summary: bool,
    pub context_include_last_message: bool,
    pub context_type_filter: Vec<String>,
    pub context_concept_filter: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            model: "qwen2.5-coder:7b".into(),
            fallback_model: "llama3.1:8b".into(),
            api_key: None,
            base_url: "http://127.0.0.1:11434".into(),
            timeout_ms: 120_000,
            temperature: 0.2,
            context_size: 8192,
            extra_options: Map::new(),
            reasoning_effort: "medium".into(),
            cli_binary: "codex".into(),
            cli_open_bridge: false,
            worker_host: "127.0.0.1".into(),
            worker_port: DEFAULT_PORT,
            data_dir: default_data_dir(),
            mode: "code".into(),
            fallback_policy: FallbackPolicy::Auto,
            queue_cap: crate::memory::queue::DEFAULT_SESSION_CAP,
            max_concurrent_sessions: 3,
            context_observation_count: 10,
            context_include_summary: true,
            context_include_last_message: false,
            context_type_filter: Vec::new(),
            context_concept_filter: Vec::new(),
        }
    }
}

/// Returns `~/.mnemo/`.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".mnemo")
}

/// Returns `~/.codex-mem/` — the pre-rename data directory.
pub fn legacy_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".codex-mem")
}

/// Keys whose values are masked when settings are read back out.
pub fn is_secret_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.contains("apikey") || lower.contains("api_key") || lower.contains("token") || lower.contains("secret")
}

/// Mask a secret value: fixed sentinel plus at most the last four characters.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let keep = chars.len().min(4);
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{MASK_SENTINEL}{tail}")
}

/// True when a PUT value is the masked echo of an existing secret — the
/// caller round-tripped a GET response, so the stored value is kept.
pub fn is_masked_echo(value: &str) -> bool {
    value.starts_with(MASK_SENTINEL)
}

static DEPRECATION_WARNED: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Resolve one key: canonical env → legacy env → file map → None.
/// Legacy hits emit a deprecation warning once per key per process.
pub fn resolve_setting(key: &str, file: &Map<String, Value>) -> Option<String> {
    let env_suffix = env_suffix(key);

    if let Ok(val) = std::env::var(format!("MNEMO_{env_suffix}")) {
        return Some(val);
    }
    if let Ok(val) = std::env::var(format!("CODEX_MEM_{env_suffix}")) {
        let mut warned = DEPRECATION_WARNED.lock().expect("deprecation set lock");
        if warned.insert(key.to_string()) {
            warn!(key, "CODEX_MEM_{env_suffix} is deprecated; use MNEMO_{env_suffix}");
        }
        return Some(val);
    }
    file.get(key).map(value_to_string)
}

/// `apiKey` → `API_KEY`, `workerPort` → `WORKER_PORT`.
fn env_suffix(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Load the flat settings map from `settings.json`, flattening the legacy
/// nested schema (`{"provider": {"name": …, "model": …}, "worker": {…}}`)
/// when encountered.
pub fn load_settings_file(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        info!(path = %path.display(), "no settings file, using defaults");
        return Ok(Map::new());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: Value =
        serde_json::from_str(&contents).context("failed to parse settings JSON")?;
    let map = parsed
        .as_object()
        .cloned()
        .context("settings file must contain a JSON object")?;
    Ok(flatten_legacy(map))
}

/// Flatten one level of nesting into prefixed camelCase keys; flat keys pass
/// through untouched. `{"provider": {"model": "x"}}` → `{"providerModel": "x"}`,
/// except the conventional legacy names which map onto canonical flat keys.
fn flatten_legacy(map: Map<String, Value>) -> Map<String, Value> {
    let mut flat = Map::new();
    for (key, value) in map {
        match value {
            Value::Object(inner) => {
                for (inner_key, inner_value) in inner {
                    let flat_key = legacy_flat_key(&key, &inner_key);
                    flat.entry(flat_key).or_insert(inner_value);
                }
            }
            other => {
                flat.insert(key, other);
            }
        }
    }
    flat
}

fn legacy_flat_key(section: &str, key: &str) -> String {
    match (section, key) {
        ("provider", "name") => "provider".into(),
        ("provider", "model") => "model".into(),
        ("provider", "apiKey") => "apiKey".into(),
        ("provider", "baseUrl") => "baseUrl".into(),
        ("worker", "host") => "workerHost".into(),
        ("worker", "port") => "workerPort".into(),
        _ => {
            let mut chars = key.chars();
            match chars.next() {
                Some(first) => format!("{section}{}{}", first.to_ascii_uppercase(), chars.as_str()),
                None => section.to_string(),
            }
        }
    }
}

/// Persist a flat settings map, atomically (tmp + rename).
pub fn save_settings_file(path: &Path, map: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(&Value::Object(map.clone()))?;
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Validation errors surfaced as HTTP 400 by the settings endpoint.
pub fn validate_settings_update(map: &Map<String, Value>) -> Result<(), String> {
    if let Some(provider) = map.get("provider").map(value_to_string) {
        provider.parse::<ProviderKind>()?;
        let model = map.get("model").map(value_to_string).unwrap_or_default();
        if provider == "hosted" && model.trim().is_empty() {
            return Err("hosted provider requires a model".into());
        }
    }
    if let Some(policy) = map.get("fallbackPolicy").map(value_to_string) {
        policy.parse::<FallbackPolicy>()?;
    }
    if let Some(port) = map.get("workerPort") {
        let n = port
            .as_i64()
            .or_else(|| port.as_str().and_then(|s| s.parse().ok()))
            .ok_or("workerPort must be a number")?;
        if !(1..=65535).contains(&n) {
            return Err(format!("workerPort out of range: {n}"));
        }
    }
    if let Some(temp) = map.get("temperature") {
        let t = temp
            .as_f64()
            .or_else(|| temp.as_str().and_then(|s| s.parse().ok()))
            .ok_or("temperature must be a number")?;
        if !(0.0..=2.0).contains(&t) {
            return Err(format!("temperature out of range: {t}"));
        }
    }
    if let Some(opts) = map.get("extraOptions") {
        if !opts.is_object() && !opts.is_null() {
            return Err("extraOptions must be a JSON object".into());
        }
    }
    Ok(())
}

impl Settings {
    /// Resolve the full snapshot from a settings file plus the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let file = load_settings_file(path)?;
        Ok(Self::resolve(&file))
    }

    /// Resolve against an already-loaded flat map.
    pub fn resolve(file: &Map<String, Value>) -> Self {
        let defaults = Settings::default();
        let get = |key: &str| resolve_setting(key, file);

        let data_dir = get("dataDir")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Self {
            provider: get("provider")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.provider),
            model: get("model").unwrap_or(defaults.model),
            fallback_model: get("fallbackModel").unwrap_or(defaults.fallback_model),
            api_key: get("apiKey").filter(|s| !s.is_empty()),
            base_url: get("baseUrl").unwrap_or(defaults.base_url),
            timeout_ms: get("timeoutMs")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_ms),
            temperature: get("temperature")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.temperature),
            context_size: get("contextSize")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.context_size),
            extra_options: get("extraOptions")
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .and_then(|v| v.as_object().cloned())
                .unwrap_or(defaults.extra_options),
            reasoning_effort: get("reasoningEffort").unwrap_or(defaults.reasoning_effort),
            cli_binary: get("cliBinary").unwrap_or(defaults.cli_binary),
            cli_open_bridge: get("cliOpenBridge")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.cli_open_bridge),
            worker_host: get("workerHost").unwrap_or(defaults.worker_host),
            worker_port: get("workerPort")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.worker_port),
            data_dir,
            mode: get("mode").unwrap_or(defaults.mode),
            fallback_policy: get("fallbackPolicy")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.fallback_policy),
            queue_cap: get("queueCap")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.queue_cap),
            max_concurrent_sessions: get("maxConcurrentSessions")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_sessions),
            context_observation_count: get("contextObservationCount")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.context_observation_count),
            context_include_summary: get("contextIncludeSummary")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(defaults.context_include_summary),
            context_include_last_message: get("contextIncludeLastMessage")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.context_include_last_message),
            context_type_filter: get("contextTypeFilter")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.context_type_filter),
            context_concept_filter: get("contextConceptFilter")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.context_concept_filter),
        }
    }

    /// `settings.json` inside the resolved data directory.
    pub fn settings_path(data_dir: &Path) -> PathBuf {
        data_dir.join("settings.json")
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.worker_port, DEFAULT_PORT);
        assert_eq!(s.worker_host, "127.0.0.1");
        assert_eq!(s.fallback_policy, FallbackPolicy::Auto);
        assert_eq!(s.queue_cap, 3);
    }

    #[test]
    fn mask_preserves_at_most_last_four() {
        assert_eq!(mask_secret("sk-abcdef123456"), format!("{MASK_SENTINEL}3456"));
        assert_eq!(mask_secret("abc"), format!("{MASK_SENTINEL}abc"));
        assert!(mask_secret("").starts_with(MASK_SENTINEL));
    }

    #[test]
    fn secret_key_detection() {
        assert!(is_secret_key("apiKey"));
        assert!(is_secret_key("hostedApiKey"));
        assert!(is_secret_key("authToken"));
        assert!(!is_secret_key("model"));
        assert!(!is_secret_key("baseUrl"));
    }

    #[test]
    fn legacy_nested_schema_flattens() {
        let nested: Value = serde_json::json!({
            "provider": {"name": "local", "model": "m1", "apiKey": "k"},
            "worker": {"host": "127.0.0.1", "port": 37778},
            "mode": "code"
        });
        let flat = flatten_legacy(nested.as_object().cloned().unwrap());
        assert_eq!(flat.get("provider").unwrap(), "local");
        assert_eq!(flat.get("model").unwrap(), "m1");
        assert_eq!(flat.get("apiKey").unwrap(), "k");
        assert_eq!(flat.get("workerPort").unwrap(), 37778);
        assert_eq!(flat.get("mode").unwrap(), "code");
    }

    #[test]
    fn env_suffix_converts_camel_case() {
        assert_eq!(env_suffix("apiKey"), "API_KEY");
        assert_eq!(env_suffix("workerPort"), "WORKER_PORT");
        assert_eq!(env_suffix("model"), "MODEL");
    }

    #[test]
    fn canonical_env_beats_legacy_and_file() {
        let mut file = Map::new();
        file.insert("model".into(), Value::String("from-file".into()));

        std::env::set_var("CODEX_MEM_MODEL", "from-legacy");
        assert_eq!(resolve_setting("model", &file).as_deref(), Some("from-legacy"));

        std::env::set_var("MNEMO_MODEL", "from-canonical");
        assert_eq!(
            resolve_setting("model", &file).as_deref(),
            Some("from-canonical")
        );

        std::env::remove_var("MNEMO_MODEL");
        std::env::remove_var("CODEX_MEM_MODEL");
        assert_eq!(resolve_setting("model", &file).as_deref(), Some("from-file"));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let bad_port: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"workerPort": 99999})).unwrap();
        assert!(validate_settings_update(&bad_port).is_err());

        let bad_provider: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"provider": "mainframe"})).unwrap();
        assert!(validate_settings_update(&bad_provider).is_err());

        let bad_options: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"extraOptions": [1, 2]})).unwrap();
        assert!(validate_settings_update(&bad_options).is_err());

        let hosted_no_model: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"provider": "hosted", "model": " "})).unwrap();
        assert!(validate_settings_update(&hosted_no_model).is_err());

        let ok: Map<String, Value> = serde_json::from_value(
            serde_json::json!({"provider": "local", "model": "m", "temperature": 0.5}),
        )
        .unwrap();
        assert!(validate_settings_update(&ok).is_ok());
    }

    #[test]
    fn settings_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut map = Map::new();
        map.insert("model".into(), Value::String("test-model".into()));
        save_settings_file(&path, &map).unwrap();

        let loaded = load_settings_file(&path).unwrap();
        assert_eq!(loaded.get("model").unwrap(), "test-model");
    }
}
