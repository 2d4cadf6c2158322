//! Anthropic request -> OpenAI chat-completions request.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, CapabilityCache};
use crate::config::{Config, ProviderClass};
use crate::router::route_model;

/// Result of translating one inbound request, carrying the bookkeeping the
/// upstream caller and the capability cache need alongside the wire body.
pub struct TranslatedRequest {
    pub body: Vec<u8>,
    pub client_model: String,
    pub upstream_model: String,
    pub streaming: bool,
    /// Whether this request was serialized with `max_completion_tokens`
    /// (true) or `max_tokens` (false). `None` when no token limit was sent
    /// at all, in which case the capability cache is not consulted.
    pub used_max_completion_tokens: Option<bool>,
    /// True when the capability cache had no entry for this `(base_url,
    /// upstream_model)` and the choice above was an optimistic guess. On a
    /// successful upstream call, the caller should write that guess back to
    /// the cache; otherwise the cache already knows the answer.
    pub should_learn_on_success: bool,
}

pub fn translate_request(
    config: &Config,
    cache: &CapabilityCache,
    body: &[u8],
) -> Result<TranslatedRequest> {
    let anthropic_request: AnthropicRequest = serde_json::from_slice(body)
        .context("failed to parse Anthropic request body")?;

    let mut messages: Vec<OpenAiMessage> = Vec::new();

    let system_text = extract_system_text(anthropic_request.system.as_ref());
    if !system_text.is_empty() {
        messages.push(OpenAiMessage {
            role: "system".to_string(),
            content: Some(OpenAiContent::Text(system_text)),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &anthropic_request.messages {
        messages.extend(convert_message(msg));
    }

    let upstream_model = route_model(config, &anthropic_request.model);

    let tools = anthropic_request
        .tools
        .map(|tools| tools.into_iter().map(convert_tool).collect());
    let tool_choice = anthropic_request.tool_choice.map(convert_tool_choice);

    let streaming = anthropic_request.stream.unwrap_or(false);

    let (max_tokens, max_completion_tokens, used_max_completion_tokens, should_learn_on_success) =
        match anthropic_request.max_tokens {
            Some(limit) if limit > 0 => {
                let key = CacheKey::new(config.upstream_base_url.clone(), upstream_model.clone());
                match cache.get(&key) {
                    Some(record) if record.uses_max_completion_tokens => {
                        (None, Some(limit), Some(true), false)
                    }
                    Some(_) => (Some(limit), None, Some(false), false),
                    None => (None, Some(limit), Some(true), true),
                }
            }
            _ => (None, None, None, false),
        };

    let (stream_options, usage, reasoning, reasoning_effort, tool_choice_override) =
        streaming_extras(config, streaming, tools.is_some());

    let openai_request = OpenAiChatRequest {
        model: upstream_model.clone(),
        messages,
        max_tokens,
        max_completion_tokens,
        temperature: anthropic_request.temperature,
        top_p: anthropic_request.top_p,
        stop: anthropic_request.stop_sequences,
        stream: anthropic_request.stream,
        stream_options,
        usage,
        reasoning,
        reasoning_effort,
        tools,
        tool_choice: tool_choice_override.or(tool_choice),
    };

    let body = serde_json::to_vec(&openai_request).context("failed to serialize OpenAI request")?;

    Ok(TranslatedRequest {
        body,
        client_model: anthropic_request.model,
        upstream_model,
        streaming,
        used_max_completion_tokens,
        should_learn_on_success,
    })
}

fn streaming_extras(
    config: &Config,
    streaming: bool,
    has_tools: bool,
) -> (
    Option<StreamOptions>,
    Option<UsageOptions>,
    Option<ReasoningConfig>,
    Option<String>,
    Option<OpenAiToolChoice>,
) {
    if !streaming {
        return (None, None, None, None, None);
    }

    let stream_options = Some(StreamOptions {
        include_usage: true,
    });

    match config.provider_class {
        ProviderClass::OpenRouter => (
            stream_options,
            Some(UsageOptions { include: true }),
            Some(ReasoningConfig { enabled: true }),
            None,
            None,
        ),
        ProviderClass::OpenAi => (
            stream_options,
            None,
            None,
            Some("medium".to_string()),
            None,
        ),
        ProviderClass::Ollama if has_tools => (
            stream_options,
            None,
            None,
            None,
            Some(OpenAiToolChoice::Mode("required".to_string())),
        ),
        _ => (stream_options, None, None, None, None),
    }
}

fn extract_system_text(system: Option<&SystemPrompt>) -> String {
    match system {
        None => String::new(),
        Some(SystemPrompt::Text(text)) => text.clone(),
        Some(SystemPrompt::Blocks(blocks)) => blocks
            .iter()
            .map(|b| match b {
                SystemBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

// ============================================================================
// Anthropic request types (input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    system: Option<SystemPrompt>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(default)]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SystemBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: AnthropicContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<AnthropicContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[allow(dead_code)]
        thinking: String,
    },
    /// Anything not recognized is carried by name only and dropped during
    /// conversion (e.g. a future block type this proxy predates).
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Blocks(Vec<ToolResultBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ToolResultBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
}

// ============================================================================
// OpenAI request types (output)
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<UsageOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<OpenAiToolChoice>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct UsageOptions {
    include: bool,
}

#[derive(Debug, Serialize)]
struct ReasoningConfig {
    enabled: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<OpenAiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiContent {
    Text(String),
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OpenAiToolChoice {
    Mode(String),
    Specific {
        #[serde(rename = "type")]
        choice_type: String,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Serialize)]
struct ToolChoiceFunction {
    name: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

/// A single Anthropic message may expand into several OpenAI messages: each
/// `tool_result` block becomes its own `role: "tool"` message.
fn convert_message(msg: &AnthropicMessage) -> Vec<OpenAiMessage> {
    match &msg.content {
        AnthropicContent::Text(text) => vec![OpenAiMessage {
            role: msg.role.clone(),
            content: Some(OpenAiContent::Text(text.clone())),
            tool_calls: None,
            tool_call_id: None,
        }],
        AnthropicContent::Blocks(blocks) => {
            let mut messages: Vec<OpenAiMessage> = Vec::new();
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: Vec<OpenAiToolCall> = Vec::new();

            for block in blocks {
                match block {
                    AnthropicContentBlock::Text { text } => text_parts.push(text.clone()),
                    AnthropicContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(input).unwrap_or_default(),
                            },
                        });
                    }
                    AnthropicContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => {
                        let result_text = content
                            .as_ref()
                            .map(|c| match c {
                                ToolResultContent::Text(text) => text.clone(),
                                ToolResultContent::Blocks(blocks) => blocks
                                    .iter()
                                    .filter_map(|b| match b {
                                        ToolResultBlock::Text { text } => Some(text.as_str()),
                                        ToolResultBlock::Other => None,
                                    })
                                    .collect::<Vec<_>>()
                                    .join("\n"),
                            })
                            .unwrap_or_default();

                        messages.push(OpenAiMessage {
                            role: "tool".to_string(),
                            content: Some(OpenAiContent::Text(result_text)),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    AnthropicContentBlock::Thinking { .. } | AnthropicContentBlock::Other => {}
                }
            }

            if messages.is_empty() && (!text_parts.is_empty() || !tool_calls.is_empty()) {
                messages.insert(
                    0,
                    OpenAiMessage {
                        role: msg.role.clone(),
                        content: if text_parts.is_empty() {
                            None
                        } else {
                            Some(OpenAiContent::Text(text_parts.join("\n")))
                        },
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    },
                );
            }

            messages
        }
    }
}

fn convert_tool(tool: AnthropicTool) -> OpenAiTool {
    OpenAiTool {
        tool_type: "function".to_string(),
        function: OpenAiFunction {
            name: tool.name,
            description: tool.description,
            parameters: Some(tool.input_schema),
        },
    }
}

fn convert_tool_choice(choice: AnthropicToolChoice) -> OpenAiToolChoice {
    match choice {
        AnthropicToolChoice::Auto => OpenAiToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::Any => OpenAiToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::Tool { name } => OpenAiToolChoice::Specific {
            choice_type: "function".to_string(),
            function: ToolChoiceFunction { name },
        },
    }
}
