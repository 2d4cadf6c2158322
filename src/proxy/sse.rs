//! Streaming transcoder: OpenAI SSE chunks -> Anthropic SSE events.
//!
//! This is the state machine described by the stream-transcoder invariants:
//! stable block indices (thinking=0, text=1, tools=2+), start/delta/stop
//! pairing, and tool-call argument buffering. Grounded on the line-buffering
//! and SSE-line-parsing discipline in the teacher's
//! `proxy/translation/openai/reverse_response.rs` and `proxy/sse/mod.rs`,
//! extended past the teacher's single flat `chunk_index` counter to the
//! richer index scheme this protocol direction needs.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::proxy::translation::response::convert_finish_reason;

pub struct StreamTranscoder {
    message_id: String,
    client_model: String,
    line_buffer: String,
    thinking: ThinkingBlockState,
    text: TextBlockState,
    tool_calls: HashMap<usize, ToolCallState>,
    tool_order: Vec<usize>,
    next_tool_claude_idx: u32,
    final_stop_reason: String,
    usage: UsageAccum,
    finished: bool,
}

#[derive(Default)]
struct ThinkingBlockState {
    started: bool,
    has_content: bool,
}

#[derive(Default)]
struct TextBlockState {
    started: bool,
}

struct ToolCallState {
    claude_index: u32,
    id: Option<String>,
    name: Option<String>,
    args_buffer: String,
    json_sent: bool,
    started: bool,
}

#[derive(Default, Clone, Copy)]
struct UsageAccum {
    input_tokens: u32,
    output_tokens: u32,
    cache_read_input_tokens: u32,
}

impl StreamTranscoder {
    pub fn new(client_model: String) -> Self {
        Self {
            message_id: generate_message_id(),
            client_model,
            line_buffer: String::with_capacity(4096),
            thinking: ThinkingBlockState::default(),
            text: TextBlockState::default(),
            tool_calls: HashMap::new(),
            tool_order: Vec::new(),
            next_tool_claude_idx: 2,
            final_stop_reason: "end_turn".to_string(),
            usage: UsageAccum::default(),
            finished: false,
        }
    }

    /// Emits `message_start` + `ping`. Call exactly once, before feeding any
    /// upstream chunk.
    pub fn start(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let start_event = MessageStartEvent {
            event_type: "message_start",
            message: MessageStartPayload {
                id: self.message_id.clone(),
                msg_type: "message",
                role: "assistant",
                content: Vec::new(),
                model: self.client_model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: self.usage.to_wire(),
            },
        };
        out.extend(format_sse_event("message_start", &start_event)?);
        out.extend(format_sse_event("ping", &PingEvent { event_type: "ping" })?);
        Ok(out)
    }

    /// Feeds one raw chunk of bytes from the upstream body. May contain
    /// multiple SSE lines or a partial line; buffers across calls.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let chunk_str = std::str::from_utf8(chunk).context("invalid UTF-8 in upstream chunk")?;
        self.line_buffer.push_str(chunk_str);

        let mut output = Vec::new();

        while let Some(newline_pos) = self.line_buffer.find('\n') {
            let line = self.line_buffer[..newline_pos].trim_end_matches('\r').to_string();
            self.line_buffer.drain(..=newline_pos);

            if let Some(events) = self.handle_line(&line)? {
                output.extend(events);
            }
            if self.finished {
                break;
            }
        }

        Ok(output)
    }

    /// Ends the stream if it has not already ended via `[DONE]`. Safe to
    /// call unconditionally after the upstream body is exhausted.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.finished = true;
        self.termination_events()
    }

    fn handle_line(&mut self, line: &str) -> Result<Option<Vec<u8>>> {
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.finished = true;
            return Ok(Some(self.termination_events()?));
        }

        let Ok(chunk) = serde_json::from_str::<OpenAiStreamChunk>(data) else {
            return Ok(None);
        };

        self.apply_chunk(chunk)
    }

    fn apply_chunk(&mut self, chunk: OpenAiStreamChunk) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();

        if let Some(usage) = chunk.usage {
            self.usage.input_tokens = usage.prompt_tokens;
            self.usage.output_tokens = usage.completion_tokens;
            if let Some(cached) = usage.prompt_tokens_details.and_then(|d| d.cached_tokens) {
                if cached > 0 {
                    self.usage.cache_read_input_tokens = cached;
                }
            }
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(if out.is_empty() { None } else { Some(out) });
        };

        let delta = choice.delta;

        let mut reasoning_fragment: Option<String> = None;
        if let Some(reasoning) = &delta.reasoning {
            if !reasoning.is_empty() {
                reasoning_fragment = Some(reasoning.clone());
            }
        } else if let Some(reasoning_content) = &delta.reasoning_content {
            if !reasoning_content.is_empty() {
                reasoning_fragment = Some(reasoning_content.clone());
            }
        } else if let Some(details) = &delta.reasoning_details {
            let mut combined = String::new();
            for detail in details {
                let text = match detail {
                    ReasoningDetailDelta::Text { text } => text.clone(),
                    ReasoningDetailDelta::Summary { summary } => summary.clone(),
                    ReasoningDetailDelta::Encrypted | ReasoningDetailDelta::Other => None,
                };
                if let Some(text) = text {
                    combined.push_str(&text);
                }
            }
            if !combined.is_empty() {
                reasoning_fragment = Some(combined);
            }
        }

        if let Some(fragment) = reasoning_fragment {
            if !self.thinking.started {
                out.extend(format_sse_event(
                    "content_block_start",
                    &ContentBlockStartEvent {
                        event_type: "content_block_start",
                        index: 0,
                        content_block: ContentBlockPayload::Thinking {
                            thinking: String::new(),
                        },
                    },
                )?);
                self.thinking.started = true;
            }
            self.thinking.has_content = true;
            out.extend(format_sse_event(
                "content_block_delta",
                &ContentBlockDeltaEvent {
                    event_type: "content_block_delta",
                    index: 0,
                    delta: ContentDelta::ThinkingDelta { thinking: fragment },
                },
            )?);
        }

        if let Some(content) = &delta.content {
            if !content.is_empty() {
                if !self.text.started {
                    out.extend(format_sse_event(
                        "content_block_start",
                        &ContentBlockStartEvent {
                            event_type: "content_block_start",
                            index: 1,
                            content_block: ContentBlockPayload::Text { text: String::new() },
                        },
                    )?);
                    self.text.started = true;
                }
                out.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: 1,
                        delta: ContentDelta::TextDelta {
                            text: content.clone(),
                        },
                    },
                )?);
            }
        }

        if let Some(tool_call_deltas) = delta.tool_calls {
            for tc in tool_call_deltas {
                out.extend(self.apply_tool_call_delta(tc)?);
            }
        }

        if let Some(finish_reason) = choice.finish_reason {
            if !finish_reason.is_empty() {
                self.final_stop_reason = convert_finish_reason(&finish_reason);
            }
        }

        Ok(if out.is_empty() { None } else { Some(out) })
    }

    fn apply_tool_call_delta(&mut self, tc: OpenAiToolCallDelta) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        if !self.tool_calls.contains_key(&tc.index) {
            self.tool_calls.insert(
                tc.index,
                ToolCallState {
                    claude_index: 0,
                    id: None,
                    name: None,
                    args_buffer: String::new(),
                    json_sent: false,
                    started: false,
                },
            );
            self.tool_order.push(tc.index);
        }
        let entry = self.tool_calls.get_mut(&tc.index).expect("just inserted");

        if let Some(id) = tc.id {
            entry.id = Some(id);
        }
        if let Some(function) = &tc.function {
            if let Some(name) = &function.name {
                entry.name = Some(name.clone());
            }
        }

        if !entry.started {
            if let (Some(id), Some(name)) = (entry.id.clone(), entry.name.clone()) {
                entry.claude_index = self.next_tool_claude_idx;
                self.next_tool_claude_idx += 1;
                entry.started = true;
                out.extend(format_sse_event(
                    "content_block_start",
                    &ContentBlockStartEvent {
                        event_type: "content_block_start",
                        index: entry.claude_index,
                        content_block: ContentBlockPayload::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({}),
                        },
                    },
                )?);
            }
        }

        if let Some(function) = tc.function {
            if let Some(arguments) = function.arguments {
                entry.args_buffer.push_str(&arguments);
            }
        }

        if entry.started && !entry.json_sent {
            if serde_json::from_str::<serde_json::Value>(&entry.args_buffer).is_ok() {
                entry.json_sent = true;
                out.extend(format_sse_event(
                    "content_block_delta",
                    &ContentBlockDeltaEvent {
                        event_type: "content_block_delta",
                        index: entry.claude_index,
                        delta: ContentDelta::InputJsonDelta {
                            partial_json: entry.args_buffer.clone(),
                        },
                    },
                )?);
            }
        }

        Ok(out)
    }

    fn termination_events(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        if self.text.started {
            out.extend(format_sse_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index: 1,
                },
            )?);
        }

        for tool_index in &self.tool_order {
            let entry = &self.tool_calls[tool_index];
            if entry.started {
                out.extend(format_sse_event(
                    "content_block_stop",
                    &ContentBlockStopEvent {
                        event_type: "content_block_stop",
                        index: entry.claude_index,
                    },
                )?);
            }
        }

        if self.thinking.has_content {
            out.extend(format_sse_event(
                "content_block_stop",
                &ContentBlockStopEvent {
                    event_type: "content_block_stop",
                    index: 0,
                },
            )?);
        }

        out.extend(format_sse_event(
            "message_delta",
            &MessageDeltaEvent {
                event_type: "message_delta",
                delta: MessageDelta {
                    stop_reason: self.final_stop_reason.clone(),
                    stop_sequence: None,
                },
                usage: self.usage.to_wire(),
            },
        )?);

        out.extend(format_sse_event(
            "message_stop",
            &MessageStopEvent {
                event_type: "message_stop",
            },
        )?);

        Ok(out)
    }
}

fn generate_message_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("msg_{:x}", nanos)
}

fn format_sse_event<T: Serialize>(event_type: &str, data: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_string(data).context("failed to serialize SSE event payload")?;
    Ok(format!("event: {event_type}\ndata: {json}\n\n").into_bytes())
}

// ============================================================================
// OpenAI streaming chunk types (input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_details: Option<Vec<ReasoningDetailDelta>>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ReasoningDetailDelta {
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
struct OpenAiToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

impl UsageAccum {
    fn to_wire(self) -> AnthropicUsage {
        AnthropicUsage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: self.cache_read_input_tokens,
            cache_creation: CacheCreation::default(),
        }
    }
}

// ============================================================================
// Anthropic streaming event types (output)
// ============================================================================

#[derive(Debug, Serialize)]
struct MessageStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    message: MessageStartPayload,
}

#[derive(Debug, Serialize)]
struct MessageStartPayload {
    id: String,
    #[serde(rename = "type")]
    msg_type: &'static str,
    role: &'static str,
    content: Vec<serde_json::Value>,
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
struct PingEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ContentBlockStartEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
    content_block: ContentBlockPayload,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentBlockPayload {
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
struct ContentBlockDeltaEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
    delta: ContentDelta,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { thinking: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Serialize)]
struct ContentBlockStopEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    index: u32,
}

#[derive(Debug, Serialize)]
struct MessageDeltaEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
    delta: MessageDelta,
    usage: AnthropicUsage,
}

#[derive(Debug, Serialize)]
struct MessageDelta {
    stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequence: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageStopEvent {
    #[serde(rename = "type")]
    event_type: &'static str,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
    cache_creation_input_tokens: u32,
    cache_read_input_tokens: u32,
    cache_creation: CacheCreation,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct CacheCreation {
    ephemeral_5m_input_tokens: u32,
    ephemeral_1h_input_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events_of(body: &str) -> String {
        String::from_utf8(body.as_bytes().to_vec()).unwrap()
    }

    #[test]
    fn start_emits_message_start_then_ping() {
        let t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        let out = events_of(&String::from_utf8(t.start().unwrap()).unwrap());
        assert!(out.contains("event: message_start"));
        assert!(out.contains("event: ping"));
        assert!(out.contains("claude-sonnet-4-20250514"));
    }

    #[test]
    fn text_only_stream_emits_balanced_blocks() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();

        let mut out = Vec::new();
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")
                .unwrap(),
        );
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n")
                .unwrap(),
        );
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n")
                .unwrap(),
        );
        out.extend(t.process_chunk(b"data: [DONE]\n\n").unwrap());

        let s = String::from_utf8(out).unwrap();
        // Each of start/stop appears twice per event: once in the SSE
        // "event:" line and once in the "type" field of its JSON payload.
        assert_eq!(s.matches("content_block_start").count(), 2);
        assert_eq!(s.matches("content_block_stop").count(), 2);
        assert!(s.contains("\"index\":1"));
        assert!(s.contains("message_stop"));
        assert!(s.contains("\"stop_reason\":\"end_turn\""));
    }

    #[test]
    fn thinking_then_text_uses_indices_zero_and_one() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();

        let mut out = Vec::new();
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"Hm\"}}]}\n\n")
                .unwrap(),
        );
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n")
                .unwrap(),
        );
        out.extend(
            t.process_chunk(b"data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n")
                .unwrap(),
        );
        out.extend(t.process_chunk(b"data: [DONE]\n\n").unwrap());

        let s = String::from_utf8(out).unwrap();
        let thinking_start = s.find("\"type\":\"thinking\"").unwrap();
        let text_start = s.find("\"type\":\"text\",\"text\":\"\"").unwrap();
        assert!(thinking_start < text_start);
        // text stop (index 1) is emitted before thinking stop (index 0) per
        // termination ordering.
        let text_stop = s.find("\"type\":\"content_block_stop\",\"index\":1").unwrap();
        let thinking_stop = s.find("\"type\":\"content_block_stop\",\"index\":0").unwrap();
        assert!(text_stop < thinking_stop);
    }

    #[test]
    fn tool_call_waits_for_name_before_starting_block() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();

        let out1 = t
            .process_chunk(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\"}]}}]}\n\n")
            .unwrap();
        assert!(String::from_utf8(out1).unwrap().is_empty());

        let out2 = t
            .process_chunk(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"name\":\"grep\"}}]}}]}\n\n")
            .unwrap();
        let s2 = String::from_utf8(out2).unwrap();
        assert!(s2.contains("content_block_start"));
        assert!(s2.contains("\"index\":2"));
    }

    #[test]
    fn fragmented_tool_arguments_emit_one_input_json_delta() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();

        t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c1\",\"function\":{\"name\":\"grep\"}}]}}]}\n\n").unwrap();
        let out1 = t
            .process_chunk(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"q\\\"\"}}]}}]}\n\n")
            .unwrap();
        assert!(!String::from_utf8(out1).unwrap().contains("input_json_delta"));

        let out2 = t
            .process_chunk(b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\":\\\"x\\\"}\"}}]}}]}\n\n")
            .unwrap();
        let s2 = String::from_utf8(out2).unwrap();
        assert!(s2.contains("input_json_delta"));
        assert!(s2.contains("{\\\"q\\\":\\\"x\\\"}"));

        let out3 = t
            .process_chunk(b"data: {\"choices\":[{\"finish_reason\":\"tool_calls\"}]}\n\n")
            .unwrap();
        let s3 = String::from_utf8(out3).unwrap();
        assert!(s3.contains("content_block_stop"));
    }

    #[test]
    fn usage_arriving_after_finish_reason_is_still_captured() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();
        t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")
            .unwrap();
        t.process_chunk(b"data: {\"choices\":[{\"finish_reason\":\"stop\"}]}\n\n")
            .unwrap();
        t.process_chunk(b"data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3}}\n\n")
            .unwrap();
        let out = t.process_chunk(b"data: [DONE]\n\n").unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("\"input_tokens\":7"));
        assert!(s.contains("\"output_tokens\":3"));
    }

    #[test]
    fn finalize_is_idempotent_and_safe_without_done() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();
        t.process_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n")
            .unwrap();
        let first = t.finalize().unwrap();
        assert!(String::from_utf8(first).unwrap().contains("message_stop"));
        let second = t.finalize().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn chunk_boundary_split_mid_line_is_buffered() {
        let mut t = StreamTranscoder::new("claude-sonnet-4-20250514".to_string());
        t.start().unwrap();
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        let (a, b) = full.split_at(20);
        let out1 = t.process_chunk(a.as_bytes()).unwrap();
        assert!(out1.is_empty());
        let out2 = t.process_chunk(b.as_bytes()).unwrap();
        assert!(String::from_utf8(out2).unwrap().contains("text_delta"));
    }
}
