//! Runtime configuration, loaded once from the environment at startup.

use std::fmt;

/// Classification of the configured upstream, derived from its base URL.
///
/// Drives header selection and parameter defaults in the request
/// transcoder (see `crate::proxy::translation::request`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderClass {
    OpenRouter,
    OpenAi,
    Ollama,
    Unknown,
}

impl ProviderClass {
    fn classify(base_url: &str) -> Self {
        let lower = base_url.to_lowercase();
        if lower.contains("openrouter.ai") {
            ProviderClass::OpenRouter
        } else if lower.contains("api.openai.com") {
            ProviderClass::OpenAi
        } else if lower.contains("localhost") || lower.contains("127.0.0.1") {
            ProviderClass::Ollama
        } else {
            ProviderClass::Unknown
        }
    }
}

impl fmt::Display for ProviderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderClass::OpenRouter => "openrouter",
            ProviderClass::OpenAi => "openai",
            ProviderClass::Ollama => "ollama",
            ProviderClass::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Fatal configuration problems. Construction aborts the process; see
/// `main.rs`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is required when the upstream is not localhost")]
    MissingApiKey,
    #[error("invalid PORT value: {0}")]
    InvalidPort(String),
}

/// Immutable snapshot of process configuration, built once in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_base_url: String,
    pub api_key: String,
    pub client_auth_key: Option<String>,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub simple_log: bool,
    pub passthrough: bool,
    pub opus_override: Option<String>,
    pub sonnet_override: Option<String>,
    pub haiku_override: Option<String>,
    pub upstream_app_name: Option<String>,
    pub upstream_app_url: Option<String>,
    pub provider_class: ProviderClass,
    pub is_localhost: bool,
    pub non_streaming_timeout_secs: u64,
    pub streaming_timeout_secs: u64,
}

impl Config {
    /// Builds configuration from environment variables, applying the
    /// defaults described in the external-interfaces section of the spec.
    ///
    /// `host`/`port` arguments are CLI-flag overrides (`None` defers to the
    /// environment, which in turn defers to the hard default).
    pub fn from_env(
        host_override: Option<String>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let upstream_base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let is_localhost =
            upstream_base_url.to_lowercase().contains("localhost")
                || upstream_base_url.to_lowercase().contains("127.0.0.1");

        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ if is_localhost => "ollama".to_string(),
            _ => return Err(ConfigError::MissingApiKey),
        };

        let host = host_override
            .or_else(|| std::env::var("HOST").ok())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let port = match port_override {
            Some(p) => p,
            None => match std::env::var("PORT") {
                Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidPort(raw))?,
                Err(_) => 8082,
            },
        };

        let provider_class = ProviderClass::classify(&upstream_base_url);

        Ok(Config {
            provider_class,
            is_localhost,
            upstream_base_url,
            api_key,
            client_auth_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|s| !s.is_empty()),
            host,
            port,
            debug: env_flag("DEBUG"),
            simple_log: env_flag("SIMPLE_LOG"),
            passthrough: env_flag("PASSTHROUGH_MODE"),
            opus_override: std::env::var("ANTHROPIC_DEFAULT_OPUS_MODEL").ok(),
            sonnet_override: std::env::var("ANTHROPIC_DEFAULT_SONNET_MODEL").ok(),
            haiku_override: std::env::var("ANTHROPIC_DEFAULT_HAIKU_MODEL").ok(),
            upstream_app_name: std::env::var("OPENROUTER_APP_NAME").ok(),
            upstream_app_url: std::env::var("OPENROUTER_APP_URL").ok(),
            non_streaming_timeout_secs: 90,
            streaming_timeout_secs: 300,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_openrouter() {
        assert_eq!(
            ProviderClass::classify("https://OpenRouter.ai/api/v1"),
            ProviderClass::OpenRouter
        );
    }

    #[test]
    fn classifies_ollama_by_loopback() {
        assert_eq!(
            ProviderClass::classify("http://127.0.0.1:11434/v1"),
            ProviderClass::Ollama
        );
        assert_eq!(
            ProviderClass::classify("http://localhost:11434/v1"),
            ProviderClass::Ollama
        );
    }

    #[test]
    fn classifies_openai_direct() {
        assert_eq!(
            ProviderClass::classify("https://api.openai.com/v1"),
            ProviderClass::OpenAi
        );
    }

    #[test]
    fn classifies_unknown_otherwise() {
        assert_eq!(
            ProviderClass::classify("https://example.com/llm"),
            ProviderClass::Unknown
        );
    }

    #[test]
    fn env_flag_accepts_common_truthy_spellings() {
        std::env::set_var("TEST_FLAG_ANTHROPIC_RELAY", "true");
        assert!(env_flag("TEST_FLAG_ANTHROPIC_RELAY"));
        std::env::set_var("TEST_FLAG_ANTHROPIC_RELAY", "0");
        assert!(!env_flag("TEST_FLAG_ANTHROPIC_RELAY"));
        std::env::remove_var("TEST_FLAG_ANTHROPIC_RELAY");
    }
}
