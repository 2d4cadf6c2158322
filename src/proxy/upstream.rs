//! HTTP client for the upstream OpenAI-compatible backend, with the
//! content-based adaptive retry for the `max_tokens` /
//! `max_completion_tokens` parameter name.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::CacheKey;
use crate::config::ProviderClass;
use crate::proxy::error::AppError;
use crate::proxy::state::AppState;
use crate::proxy::translation::TranslatedRequest;

/// Builds the shared `reqwest::Client` used for every upstream call.
///
/// HTTP/1.1 is forced to avoid HTTP/2 connection-reset issues observed with
/// some OpenAI-compatible providers; no default `User-Agent` is set so the
/// original client's `User-Agent` can be forwarded by the caller if desired.
pub fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .http1_only()
        .build()
        .context("failed to build upstream HTTP client")
}

/// Sends the translated request upstream, retrying once with the other
/// token-limit parameter name if the first attempt fails in a way that
/// looks like a parameter-name mismatch. Returns the upstream response with
/// a 2xx status; any other outcome is reported as `AppError::Upstream`.
pub async fn call_upstream(
    state: &AppState,
    translated: &TranslatedRequest,
    user_agent: Option<&str>,
) -> Result<reqwest::Response, AppError> {
    let timeout_secs = if translated.streaming {
        state.config.streaming_timeout_secs
    } else {
        state.config.non_streaming_timeout_secs
    };

    let response = send_once(state, &translated.body, timeout_secs, user_agent).await?;
    if response.status().is_success() {
        if translated.should_learn_on_success {
            state.cache.put(
                CacheKey::new(
                    state.config.upstream_base_url.clone(),
                    translated.upstream_model.clone(),
                ),
                true,
            );
        }
        return Ok(response);
    }

    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();

    let can_retry = translated.used_max_completion_tokens == Some(true)
        && looks_like_token_param_error(&body_text);

    if can_retry {
        match swap_to_max_tokens(&translated.body) {
            Ok(retry_body) => {
                let retry_response = send_once(state, &retry_body, timeout_secs, user_agent).await?;
                if retry_response.status().is_success() {
                    state.cache.put(
                        CacheKey::new(
                            state.config.upstream_base_url.clone(),
                            translated.upstream_model.clone(),
                        ),
                        false,
                    );
                    return Ok(retry_response);
                }
                let retry_status = retry_response.status();
                let retry_text = retry_response.text().await.unwrap_or_default();
                return Err(AppError::Upstream(format!(
                    "upstream error {retry_status} on retry: {retry_text}"
                )));
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to build retry body, surfacing original error");
            }
        }
    }

    Err(AppError::Upstream(format!(
        "upstream error {status}: {body_text}"
    )))
}

async fn send_once(
    state: &AppState,
    body: &[u8],
    timeout_secs: u64,
    user_agent: Option<&str>,
) -> Result<reqwest::Response, AppError> {
    let url = format!(
        "{}/chat/completions",
        state.config.upstream_base_url.trim_end_matches('/')
    );

    let mut request = state
        .client
        .post(&url)
        .timeout(Duration::from_secs(timeout_secs))
        .header("Content-Type", "application/json")
        .body(body.to_vec());

    if let Some(user_agent) = user_agent {
        request = request.header("User-Agent", user_agent);
    }

    if !state.config.is_localhost {
        request = request.bearer_auth(&state.config.api_key);
    }

    if state.config.provider_class == ProviderClass::OpenRouter {
        if let Some(app_url) = &state.config.upstream_app_url {
            request = request.header("HTTP-Referer", app_url.clone());
        }
        if let Some(app_name) = &state.config.upstream_app_name {
            request = request.header("X-Title", app_name.clone());
        }
    }

    request
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("failed to reach upstream: {e}")))
}

/// `parameter`/`unsupported`/`invalid` crossed with `max_tokens` /
/// `max_completion_tokens`, case-insensitively, anywhere in the body. Some
/// deployments report this as a 200 with a JSON error envelope, so the
/// caller does not gate this check on status code.
fn looks_like_token_param_error(body: &str) -> bool {
    let lower = body.to_lowercase();
    let mentions_problem = lower.contains("parameter") || lower.contains("unsupported") || lower.contains("invalid");
    let mentions_param_name = lower.contains("max_tokens") || lower.contains("max_completion_tokens");
    mentions_problem && mentions_param_name
}

fn swap_to_max_tokens(body: &[u8]) -> Result<Vec<u8>> {
    let mut value: serde_json::Value =
        serde_json::from_slice(body).context("retry body was not valid JSON")?;
    let object = value
        .as_object_mut()
        .context("retry body was not a JSON object")?;
    if let Some(limit) = object.remove("max_completion_tokens") {
        object.insert("max_tokens".to_string(), limit);
    }
    serde_json::to_vec(&value).context("failed to re-serialize retry body")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_parameter_errors_case_insensitively() {
        assert!(looks_like_token_param_error(
            "Unsupported parameter: 'max_completion_tokens' is not supported"
        ));
        assert!(looks_like_token_param_error(
            "{\"error\":{\"message\":\"Invalid value for max_tokens\"}}"
        ));
    }

    #[test]
    fn ignores_unrelated_errors() {
        assert!(!looks_like_token_param_error("Internal server error"));
        assert!(!looks_like_token_param_error("rate limit exceeded"));
    }

    #[test]
    fn swap_replaces_completion_tokens_key() {
        let body = br#"{"model":"gpt-4o","max_completion_tokens":10}"#;
        let swapped = swap_to_max_tokens(body).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&swapped).unwrap();
        assert_eq!(value["max_tokens"], 10);
        assert!(value.get("max_completion_tokens").is_none());
    }
}
