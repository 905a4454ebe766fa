//! Server configuration, loaded from environment variables at startup.

use std::collections::HashMap;
use std::time::Duration;

use chatterbox_core::gateway::openai::{OpenAiConfig, redacted};
use chatterbox_core::turn::{DEFAULT_MAX_CONTENT_BYTES, TurnSettings};
use chatterbox_core::DEFAULT_CONTEXT_LIMIT;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly and helpful assistant. \
     Answer clearly and concisely, and ask a follow-up question when the request is ambiguous.";

/// Runtime configuration for chatterbox-server.
///
/// Every field has a default so the server starts without any environment
/// variables set. `Debug` output never contains the model key or the
/// bearer tokens.
#[derive(Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// sqlx SQLite URL (default: `"sqlite://chatterbox.db?mode=rwc"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When set, logs are additionally written to daily files in this directory.
    pub log_dir: Option<String>,

    /// Comma-separated list of allowed CORS origins; `None` allows any.
    pub cors_allowed_origins: Option<String>,

    /// Mount Swagger UI and the OpenAPI document.
    pub enable_swagger: bool,

    /// Bearer token → owner id. Empty means every caller acts as
    /// [`ANONYMOUS_OWNER`].
    pub api_tokens: HashMap<String, String>,

    pub model_base_url: String,
    pub model_api_key: String,
    pub model: String,
    pub system_prompt: String,

    /// `0` disables the generation deadline.
    pub generation_timeout_secs: u64,

    pub context_limit: u32,
    pub max_content_bytes: usize,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut owners: Vec<&str> = self.api_tokens.values().map(String::as_str).collect();
        owners.sort_unstable();
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("database_url", &self.database_url)
            .field("log_level", &self.log_level)
            .field("log_json", &self.log_json)
            .field("log_dir", &self.log_dir)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .field("enable_swagger", &self.enable_swagger)
            .field("api_token_owners", &owners)
            .field("model_base_url", &self.model_base_url)
            .field("model_api_key", &redacted(&self.model_api_key))
            .field("model", &self.model)
            .field("generation_timeout_secs", &self.generation_timeout_secs)
            .field("context_limit", &self.context_limit)
            .field("max_content_bytes", &self.max_content_bytes)
            .finish_non_exhaustive()
    }
}

/// Owner used for every request when no API tokens are configured.
pub const ANONYMOUS_OWNER: &str = "anonymous";

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_owned(),
            database_url: "sqlite://chatterbox.db?mode=rwc".to_owned(),
            log_level: "info".to_owned(),
            log_json: false,
            log_dir: None,
            cors_allowed_origins: None,
            enable_swagger: true,
            api_tokens: HashMap::new(),
            model_base_url: "https://api.openai.com/v1".to_owned(),
            model_api_key: String::new(),
            model: "gpt-4o-mini".to_owned(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            generation_timeout_secs: 0,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            max_content_bytes: DEFAULT_MAX_CONTENT_BYTES,
        }
    }
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind_address: env_or("CHATTERBOX_BIND", &d.bind_address),
            database_url: env_or("CHATTERBOX_DATABASE_URL", &d.database_url),
            log_level: env_or("CHATTERBOX_LOG", &d.log_level),
            log_json: env_flag("CHATTERBOX_LOG_JSON", d.log_json),
            log_dir: env_opt("CHATTERBOX_LOG_DIR"),
            cors_allowed_origins: env_opt("CHATTERBOX_CORS_ORIGINS"),
            enable_swagger: env_flag("CHATTERBOX_ENABLE_SWAGGER", d.enable_swagger),
            api_tokens: env_opt("CHATTERBOX_API_TOKENS")
                .map(|raw| parse_tokens(&raw))
                .unwrap_or_default(),
            model_base_url: env_or("CHATTERBOX_MODEL_BASE_URL", &d.model_base_url),
            model_api_key: env_or("CHATTERBOX_MODEL_API_KEY", &d.model_api_key),
            model: env_or("CHATTERBOX_MODEL", &d.model),
            system_prompt: env_or("CHATTERBOX_SYSTEM_PROMPT", &d.system_prompt),
            generation_timeout_secs: parse_env(
                "CHATTERBOX_GENERATION_TIMEOUT_SECS",
                d.generation_timeout_secs,
            ),
            context_limit: parse_env("CHATTERBOX_CONTEXT_LIMIT", d.context_limit),
            max_content_bytes: parse_env("CHATTERBOX_MAX_CONTENT_BYTES", d.max_content_bytes),
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            context_limit: self.context_limit,
            generation_timeout: (self.generation_timeout_secs > 0)
                .then(|| Duration::from_secs(self.generation_timeout_secs)),
            max_content_bytes: self.max_content_bytes,
        }
    }

    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            base_url: self.model_base_url.clone(),
            api_key: self.model_api_key.clone(),
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Parse `token=owner,token2=owner2`. Malformed or empty pairs are skipped.
pub fn parse_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, owner) = pair.split_once('=')?;
            let (token, owner) = (token.trim(), owner.trim());
            (!token.is_empty() && !owner.is_empty()).then(|| (token.to_owned(), owner.to_owned()))
        })
        .collect()
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
