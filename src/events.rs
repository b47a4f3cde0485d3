//! Claude CLI `stream-json` event types.
//!
//! Only the events that carry generated output or the final usage are modelled; everything else
//! (system, assistant, user, ping, message bookkeeping) deserializes to an `Other` variant.

use serde::Deserialize;

/// One NDJSON line from the CLI, discriminated by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    StreamEvent { event: StreamEvent },
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

/// Anthropic streaming event wrapped by `stream_event`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

/// Final event of a CLI run.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResultEvent {
    pub is_error: bool,
    /// Final assistant text, or the error message when `is_error` is set.
    pub result: Option<String>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UsageInfo {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}
