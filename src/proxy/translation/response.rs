//! OpenAI chat-completions response -> Anthropic response (non-streaming).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Translates one buffered OpenAI response into an Anthropic response,
/// echoing `client_model` rather than whatever the upstream called itself.
pub fn translate_response(body: &[u8], client_model: &str) -> Result<Vec<u8>> {
    let openai_response: OpenAiChatCompletion =
        serde_json::from_slice(body).context("failed to parse OpenAI response")?;

    let anthropic_response = convert_buffered_response(&openai_response, client_model);

    serde_json::to_vec(&anthropic_response).context("failed to serialize Anthropic response")
}

// ============================================================================
// OpenAI response types (input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletion {
    id: String,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(default)]
    reasoning_details: Option<Vec<ReasoningDetail>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ReasoningDetail {
    #[serde(rename = "reasoning.text")]
    Text {
        #[serde(default)]
        text: Option<String>,
    },
    #[serde(rename = "reasoning.summary")]
    Summary {
        #[serde(default)]
        summary: Option<String>,
    },
    #[serde(rename = "reasoning.encrypted")]
    Encrypted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u32,
}

// ============================================================================
// Anthropic response types (output)
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: String,
    role: String,
    content: Vec<AnthropicContentBlock>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_input_tokens: u32,
    cache_read_input_tokens: u32,
    cache_creation: CacheCreation,
}

#[derive(Debug, Default, Serialize)]
struct CacheCreation {
    ephemeral_5m_input_tokens: u32,
    ephemeral_1h_input_tokens: u32,
}

fn convert_buffered_response(response: &OpenAiChatCompletion, client_model: &str) -> AnthropicResponse {
    let choice = response.choices.first();
    let mut content: Vec<AnthropicContentBlock> = Vec::new();

    if let Some(choice) = choice {
        for detail in choice.message.reasoning_details.iter().flatten() {
            let text = match detail {
                ReasoningDetail::Text { text } => text.clone(),
                ReasoningDetail::Summary { summary } => summary.clone(),
                ReasoningDetail::Encrypted | ReasoningDetail::Other => None,
            };
            if let Some(text) = text {
                if !text.is_empty() {
                    content.push(AnthropicContentBlock::Thinking { thinking: text });
                }
            }
        }

        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(AnthropicContentBlock::Text { text: text.clone() });
            }
        }

        if let Some(tool_calls) = &choice.message.tool_calls {
            for tc in tool_calls {
                let input: serde_json::Value =
                    serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| serde_json::json!({}));
                content.push(AnthropicContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input,
                });
            }
        }
    }

    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(convert_finish_reason)
        .unwrap_or_else(|| "end_turn".to_string());

    let usage = response
        .usage
        .as_ref()
        .map(|u| AnthropicUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: u
                .prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            cache_creation: CacheCreation::default(),
        })
        .unwrap_or(AnthropicUsage {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
            cache_creation: CacheCreation::default(),
        });

    AnthropicResponse {
        id: format!("msg_{}", response.id.replace("chatcmpl-", "")),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: client_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

pub(crate) fn convert_finish_reason(finish_reason: &str) -> String {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "end_turn",
        _ => "end_turn",
    }
    .to_string()
}
