//! Translation of runner stdout into run events.
//!
//! Claude-style runners emit one stream-json object per line; anything that
//! does not parse is treated as plain assistant output.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::domain::{EventPayload, RunSummary};
use crate::util::truncate_chars;

const MAX_TOOL_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: StreamMessage },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<StreamMessage>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        num_turns: Option<u32>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Stateful line parser for one run.
///
/// Remembers tool names by call id so results can be attributed, and
/// accumulates the counters that end up in the run summary.
#[derive(Debug, Default)]
pub struct OutputParser {
    tool_names: HashMap<String, String>,
    turns: u32,
    tool_calls: u32,
    files_modified: Vec<String>,
    last_text: Option<String>,
    result_text: Option<String>,
    result_is_error: bool,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<EventPayload> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<StreamEvent>(trimmed) {
            Ok(event) => self.translate(event),
            Err(_) => {
                self.last_text = Some(trimmed.to_string());
                vec![EventPayload::assistant(trimmed)]
            }
        }
    }

    fn translate(&mut self, event: StreamEvent) -> Vec<EventPayload> {
        match event {
            StreamEvent::Assistant { message, .. } => {
                self.turns += 1;
                let mut out = Vec::new();
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !text.trim().is_empty() {
                                self.last_text = Some(text.clone());
                                out.push(EventPayload::assistant(text));
                            }
                        }
                        ContentBlock::ToolUse { name, input, id } => {
                            self.tool_calls += 1;
                            self.note_modified_file(&name, &input);
                            if !id.is_empty() {
                                self.tool_names.insert(id, name.clone());
                            }
                            out.push(EventPayload::ToolCall { name, input });
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
                    }
                }
                out
            }
            StreamEvent::User { message } => message
                .unwrap_or_default()
                .content
                .into_iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(EventPayload::ToolResult {
                        name: self
                            .tool_names
                            .get(&tool_use_id)
                            .cloned()
                            .unwrap_or_else(|| "unknown".to_string()),
                        output: truncate_chars(&result_text(&content), MAX_TOOL_OUTPUT_CHARS)
                            .to_string(),
                        is_error,
                    }),
                    _ => None,
                })
                .collect(),
            StreamEvent::Result {
                subtype,
                result,
                is_error,
                num_turns,
            } => {
                if let Some(turns) = num_turns {
                    self.turns = self.turns.max(turns);
                }
                self.result_is_error = is_error;
                self.result_text = result.clone();
                if is_error {
                    vec![EventPayload::Error {
                        code: if subtype.is_empty() {
                            "runner_error".to_string()
                        } else {
                            subtype
                        },
                        message: result.unwrap_or_default(),
                    }]
                } else {
                    Vec::new()
                }
            }
            StreamEvent::System { subtype } => {
                if subtype.is_empty() {
                    Vec::new()
                } else {
                    vec![EventPayload::system(format!("runner: {}", subtype))]
                }
            }
        }
    }

    fn note_modified_file(&mut self, tool: &str, input: &Value) {
        if !matches!(tool, "Write" | "Edit" | "MultiEdit" | "NotebookEdit") {
            return;
        }
        let path = input
            .get("file_path")
            .or_else(|| input.get("notebook_path"))
            .and_then(Value::as_str);
        if let Some(path) = path
            && !self.files_modified.iter().any(|p| p == path)
        {
            self.files_modified.push(path.to_string());
        }
    }

    /// True when the runner reported an error result.
    pub fn reported_error(&self) -> Option<&str> {
        if self.result_is_error {
            Some(self.result_text.as_deref().unwrap_or("runner reported an error"))
        } else {
            None
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            description: self
                .result_text
                .clone()
                .or_else(|| self.last_text.clone())
                .unwrap_or_default(),
            turns: self.turns,
            tool_calls: self.tool_calls,
            files_modified: self.files_modified.clone(),
        }
    }
}

/// Tool result content is either a string or a list of text blocks.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
