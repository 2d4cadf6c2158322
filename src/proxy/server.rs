//! Axum router, handlers, and server bootstrap.

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;

use crate::proxy::error::AppError;
use crate::proxy::sse::StreamTranscoder;
use crate::proxy::state::AppState;
use crate::proxy::translation::{translate_request, translate_response, TranslatedRequest};
use crate::proxy::upstream::call_upstream;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, shutdown_rx: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
    let bind_addr = state.config.bind_addr();
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .context("failed to bind to address")?;

    tracing::info!("listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.await.ok();
        })
        .await
        .context("server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn messages_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let translated = match translate_request(&state.config, &state.cache, &body) {
        Ok(t) => t,
        Err(e) => return AppError::InvalidRequest(e.to_string()).into_response(),
    };

    if let Some(expected) = &state.config.client_auth_key {
        let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return AppError::Authentication("Invalid API key".to_string()).into_response();
        }
    }

    if state.config.passthrough {
        return AppError::NotImplemented("passthrough mode is not implemented".to_string())
            .into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if translated.streaming {
        stream_messages(state, translated, user_agent).await
    } else {
        match handle_non_streaming(&state, &translated, user_agent.as_deref()).await {
            Ok(anthropic_body) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(anthropic_body))
                .unwrap_or_else(|_| {
                    AppError::Upstream("failed to build response".to_string()).into_response()
                }),
            Err(e) => e.into_response(),
        }
    }
}

async fn handle_non_streaming(
    state: &AppState,
    translated: &TranslatedRequest,
    user_agent: Option<&str>,
) -> Result<Vec<u8>, AppError> {
    let response = call_upstream(state, translated, user_agent).await?;
    let body = response
        .bytes()
        .await
        .map_err(|e| AppError::Upstream(format!("failed to read upstream body: {e}")))?;
    translate_response(&body, &translated.client_model)
        .map_err(|e| AppError::Upstream(format!("failed to translate upstream response: {e}")))
}

async fn stream_messages(
    state: AppState,
    translated: TranslatedRequest,
    user_agent: Option<String>,
) -> Response {
    let upstream = match call_upstream(&state, &translated, user_agent.as_deref()).await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let client_model = translated.client_model.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut transcoder = StreamTranscoder::new(client_model);

        match transcoder.start() {
            Ok(initial) if !initial.is_empty() => {
                if tx.send(Ok(Bytes::from(initial))).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "failed to build message_start event");
                return;
            }
        }

        let mut byte_stream = upstream.bytes_stream();
        loop {
            match byte_stream.next().await {
                Some(Ok(chunk)) => match transcoder.process_chunk(&chunk) {
                    Ok(events) if !events.is_empty() => {
                        if tx.send(Ok(Bytes::from(events))).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unparseable upstream chunk");
                    }
                },
                Some(Err(e)) => {
                    tracing::error!(error = %e, "upstream stream read failed");
                    let err = AppError::Upstream(format!("upstream stream error: {e}"));
                    let _ = tx.send(Ok(Bytes::from(err.to_sse_event()))).await;
                    return;
                }
                None => break,
            }
        }

        match transcoder.finalize() {
            Ok(events) if !events.is_empty() => {
                let _ = tx.send(Ok(Bytes::from(events))).await;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "failed to finalize stream"),
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| {
            AppError::Upstream("failed to build streaming response".to_string()).into_response()
        })
}

async fn count_tokens_handler() -> impl IntoResponse {
    Json(json!({"input_tokens": 100}))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Anthropic Messages API relay to an OpenAI-compatible backend",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn count_tokens_stub_returns_fixed_value() {
        let response = count_tokens_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
