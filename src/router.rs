//! Pure client-facing-model-name -> upstream-model-name routing.

use crate::config::Config;

const DEFAULT_HAIKU_MODEL: &str = "gpt-5-mini";
const DEFAULT_SONNET_MODEL: &str = "gpt-5";
const DEFAULT_OPUS_MODEL: &str = "gpt-5";

/// Routes a client-facing model name to the upstream model name to send.
///
/// Evaluated top-to-bottom on a lowercased copy of `model`; the first tier
/// keyword that matches wins. Names that match no tier keyword pass through
/// unchanged.
pub fn route_model(config: &Config, model: &str) -> String {
    let lower = model.to_lowercase();

    if lower.contains("haiku") {
        return config
            .haiku_override
            .clone()
            .unwrap_or_else(|| DEFAULT_HAIKU_MODEL.to_string());
    }
    if lower.contains("sonnet") {
        return config
            .sonnet_override
            .clone()
            .unwrap_or_else(|| DEFAULT_SONNET_MODEL.to_string());
    }
    if lower.contains("opus") {
        return config
            .opus_override
            .clone()
            .unwrap_or_else(|| DEFAULT_OPUS_MODEL.to_string());
    }

    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            upstream_base_url: "https://api.openai.com/v1".to_string(),
            api_key: "key".to_string(),
            client_auth_key: None,
            host: "0.0.0.0".to_string(),
            port: 8082,
            debug: false,
            simple_log: false,
            passthrough: false,
            opus_override: None,
            sonnet_override: None,
            haiku_override: None,
            upstream_app_name: None,
            upstream_app_url: None,
            provider_class: crate::config::ProviderClass::OpenAi,
            is_localhost: false,
            non_streaming_timeout_secs: 90,
            streaming_timeout_secs: 300,
        }
    }

    #[test]
    fn routes_default_tiers() {
        let config = base_config();
        assert_eq!(
            route_model(&config, "claude-3-5-haiku-20241022"),
            "gpt-5-mini"
        );
        assert_eq!(
            route_model(&config, "claude-sonnet-4-20250514"),
            "gpt-5"
        );
        assert_eq!(route_model(&config, "claude-opus-4-20250514"), "gpt-5");
    }

    #[test]
    fn honors_overrides() {
        let mut config = base_config();
        config.sonnet_override = Some("custom-model".to_string());
        assert_eq!(route_model(&config, "claude-sonnet-4-20250514"), "custom-model");
    }

    #[test]
    fn passes_through_unknown_names() {
        let config = base_config();
        assert_eq!(route_model(&config, "gpt-4o"), "gpt-4o");
    }

    #[test]
    fn is_case_insensitive() {
        let config = base_config();
        assert_eq!(route_model(&config, "CLAUDE-HAIKU-X"), "gpt-5-mini");
    }

    #[test]
    fn is_idempotent_once_no_tier_keyword_matches() {
        let config = base_config();
        let routed = route_model(&config, "gpt-4o");
        assert_eq!(route_model(&config, &routed), routed);
    }
}
