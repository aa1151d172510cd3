//! Agent stream records
//!
//! The agent CLI writes one JSON object per stdout line. `StreamRecord`
//! mirrors that object; `StreamRecord::classify` flattens it into the
//! items the supervisor persists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token usage reported on assistant messages and results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

impl Usage {
    /// Tokens occupying the model's context window
    pub fn effective_context_tokens(&self) -> i64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

/// Tool-result content: either a string or a list of typed parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl ToolResultContent {
    /// Flatten to text; text parts are joined with newlines
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|p| p.part_type == "text")
                .filter_map(|p| p.text.as_deref())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One NDJSON record from the agent's stdout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<StreamMessage>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub num_turns: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What the supervisor does with a record
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// `system/init`: carries the model the agent runs with
    Init { model: Option<String> },
    /// Other system notices worth keeping in the log
    System { content: String },
    Message { role: String, text: String },
    Thinking { role: String, text: String },
    ToolUse {
        id: String,
        name: String,
        input: Value,
        parent_tool_use_id: Option<String>,
    },
    ToolResult { tool_use_id: String, content: String },
    /// Token usage attached to an assistant message
    Usage(Usage),
    /// Terminal result of the run
    Result(RunResult),
}

/// Fields of a terminal `result` record
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub is_error: bool,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<i64>,
    pub num_turns: Option<i64>,
    pub result: Option<String>,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}

impl StreamRecord {
    pub fn parse(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }

    /// Flatten the record into items, preserving content-block order
    pub fn classify(&self) -> Vec<StreamItem> {
        match self.record_type.as_str() {
            "system" => match self.subtype.as_deref() {
                Some("init") => vec![StreamItem::Init {
                    model: self.model.clone(),
                }],
                Some("session_created") => vec![StreamItem::System {
                    content: format!(
                        "Session created with ID: {}",
                        self.session_id.as_deref().unwrap_or_default()
                    ),
                }],
                _ => Vec::new(),
            },
            "assistant" | "user" => self.classify_message(),
            "result" => vec![StreamItem::Result(RunResult {
                is_error: self.is_error,
                cost_usd: self.total_cost_usd,
                duration_ms: self.duration_ms,
                num_turns: self.num_turns,
                result: self.result.clone(),
                usage: self.usage,
                error: self.error.clone(),
            })],
            _ => Vec::new(),
        }
    }

    fn classify_message(&self) -> Vec<StreamItem> {
        let Some(message) = &self.message else {
            return Vec::new();
        };
        let role = if message.role.is_empty() {
            self.record_type.clone()
        } else {
            message.role.clone()
        };

        let mut items: Vec<StreamItem> = message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(StreamItem::Message {
                    role: role.clone(),
                    text: text.clone(),
                }),
                ContentBlock::Thinking { thinking } => Some(StreamItem::Thinking {
                    role: role.clone(),
                    text: thinking.clone(),
                }),
                ContentBlock::ToolUse { id, name, input } => Some(StreamItem::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                    parent_tool_use_id: self.parent_tool_use_id.clone(),
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => Some(StreamItem::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.as_ref().map(|c| c.text()).unwrap_or_default(),
                }),
                ContentBlock::Unknown => None,
            })
            .collect();

        if role == "assistant" {
            if let Some(usage) = message.usage {
                items.push(StreamItem::Usage(usage));
            }
        }
        items
    }
}
