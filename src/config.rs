//! Configuration helpers: provider presets and environment lookups

use std::env;

/// Environment variable overriding the completion endpoint
pub const BASE_URL_ENV: &str = "TOOLWIRE_BASE_URL";
/// Environment variable naming the completion model
pub const MODEL_ENV: &str = "TOOLWIRE_MODEL";
/// Environment variable with the tool server's event-stream URL
pub const TOOL_SERVER_URL_ENV: &str = "TOOLWIRE_TOOL_SERVER_URL";

/// Supported provider shortcuts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    LMStudio,
    Ollama,
    LlamaCpp,
    VLLM,
}

impl Provider {
    /// Get the default base URL for this provider
    pub fn default_url(&self) -> &'static str {
        match self {
            Provider::LMStudio => "http://localhost:1234/v1",
            Provider::Ollama => "http://localhost:11434/v1",
            Provider::LlamaCpp => "http://localhost:8080/v1",
            Provider::VLLM => "http://localhost:8000/v1",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_lowercase().as_str() {
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(Provider::LMStudio),
            "ollama" => Ok(Provider::Ollama),
            "llamacpp" | "llama-cpp" | "llama_cpp" | "llama.cpp" => Ok(Provider::LlamaCpp),
            "vllm" => Ok(Provider::VLLM),
            other => Err(crate::Error::config(format!("unknown provider '{}'", other))),
        }
    }
}

/// Get the completion base URL
///
/// Priority:
/// 1. `TOOLWIRE_BASE_URL` environment variable
/// 2. Provider default URL (if provider is Some)
/// 3. fallback parameter, else the LM Studio default
pub fn get_base_url(provider: Option<Provider>, fallback: Option<&str>) -> String {
    resolve_base_url(env::var(BASE_URL_ENV).ok(), provider, fallback)
}

fn resolve_base_url(
    from_env: Option<String>,
    provider: Option<Provider>,
    fallback: Option<&str>,
) -> String {
    if let Some(url) = from_env.filter(|u| !u.is_empty()) {
        return url;
    }
    if let Some(p) = provider {
        return p.default_url().to_string();
    }
    fallback
        .unwrap_or(Provider::LMStudio.default_url())
        .to_string()
}

/// Get the model name from `TOOLWIRE_MODEL` (if `prefer_env`) or the fallback
pub fn get_model(fallback: Option<&str>, prefer_env: bool) -> Option<String> {
    let from_env = prefer_env.then(|| env::var(MODEL_ENV).ok()).flatten();
    from_env
        .filter(|m| !m.is_empty())
        .or_else(|| fallback.map(|s| s.to_string()))
}

/// Get the tool server's event-stream URL, if one is configured
///
/// A request runs without tools when this returns `None`.
pub fn get_tool_server_url(fallback: Option<&str>) -> Option<String> {
    env::var(TOOL_SERVER_URL_ENV)
        .ok()
        .filter(|u| !u.is_empty())
        .or_else(|| fallback.map(|s| s.to_string()))
}
