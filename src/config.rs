use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Defaults applied when neither the process environment nor a `.env` file
/// sets a key.
const BUNDLED_CONFIG: &str = r#"
# Memory tier entry limit for decoded documents
CHATVAULT_CACHE_CAPACITY=50
CHATVAULT_DOCUMENT_EXTENSIONS=pdf
COMPLETION_MODEL=gpt-3.5-turbo
COMPLETION_TEMPERATURE=0.7
COMPLETION_MAX_TOKENS=1000
COMPLETION_TOP_P=0.9
"#;

/// Loads a `.env` file into the process environment if one exists.
pub fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            tracing::warn!(error = %err, "ignoring unreadable .env file");
        }
    }
}

fn bundled_config() -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in BUNDLED_CONFIG.lines() {
        let line = line.trim();
        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    values
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompletionSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub system_prompt: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub use_ollama: bool,
    /// Model for the Rig-backed providers; each has its own default.
    pub hosted_model: Option<String>,
    pub static_reply: Option<String>,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 0.9,
            system_prompt: None,
            openai_api_key: None,
            anthropic_api_key: None,
            use_ollama: false,
            hosted_model: None,
            static_reply: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Working directory holding imported documents.
    pub documents_dir: PathBuf,
    /// Disk tier of the document cache.
    pub cache_dir: PathBuf,
    pub cache_capacity: usize,
    /// Lowercase extensions enumerated from `documents_dir`.
    pub document_extensions: Vec<String>,
    pub completion: CompletionSettings,
}

impl Config {
    /// Reads configuration from the process environment. Call
    /// [`load_dotenv`] first to pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from `lookup`, falling back to bundled defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bundled = bundled_config();
        let get = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .or_else(|| bundled.get(key).cloned())
        };

        let documents_dir = get("CHATVAULT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_dir(dirs::data_local_dir(), "documents"));
        let cache_dir = get("CHATVAULT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_dir(dirs::cache_dir(), "document-cache"));
        let cache_capacity: usize = parse(&get, "CHATVAULT_CACHE_CAPACITY")?.unwrap_or(50);
        if cache_capacity == 0 {
            anyhow::bail!("CHATVAULT_CACHE_CAPACITY must be at least 1");
        }
        let document_extensions = get("CHATVAULT_DOCUMENT_EXTENSIONS")
            .unwrap_or_else(|| "pdf".to_string())
            .split(',')
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();

        let defaults = CompletionSettings::default();
        let completion = CompletionSettings {
            endpoint: get("COMPLETION_ENDPOINT"),
            api_key: get("COMPLETION_API_KEY"),
            model: get("COMPLETION_MODEL").unwrap_or(defaults.model),
            temperature: parse(&get, "COMPLETION_TEMPERATURE")?.unwrap_or(defaults.temperature),
            max_tokens: parse(&get, "COMPLETION_MAX_TOKENS")?.unwrap_or(defaults.max_tokens),
            top_p: parse(&get, "COMPLETION_TOP_P")?.unwrap_or(defaults.top_p),
            system_prompt: get("COMPLETION_SYSTEM_PROMPT"),
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            use_ollama: get("LLM_USE_OLLAMA")
                .map(|value| is_truthy(&value))
                .unwrap_or(false),
            hosted_model: get("LLM_MODEL"),
            static_reply: get("COMPLETION_STATIC_REPLY"),
        };

        Ok(Self {
            documents_dir,
            cache_dir,
            cache_capacity,
            document_extensions,
            completion,
        })
    }
}

fn default_dir(base: Option<PathBuf>, leaf: &str) -> PathBuf {
    base.map(|dir| dir.join("chatvault").join(leaf))
        .unwrap_or_else(|| PathBuf::from("cache").join(leaf))
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    get(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {key}: {value:?}"))
        })
        .transpose()
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
