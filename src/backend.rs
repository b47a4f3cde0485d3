//! Generation backend that drives the Claude CLI in streaming mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CliEvent, ContentBlock, Delta, ResultEvent, StreamEvent};
use crate::request::{AiRequest, GenerationBackend, GenerationEvent, GenerationSummary, Usage};

/// Flags the output decoder depends on. Appended after the configured args.
const STREAM_ARGS: [&str; 4] = [
    "-p",
    "--output-format=stream-json",
    "--verbose",
    "--include-partial-messages",
];

/// Maximum length for truncated tool input display.
const TOOL_INPUT_MAX_LEN: usize = 60;

pub struct ClaudeCliBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl ClaudeCliBackend {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backend_command(), config.backend.args.clone())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(STREAM_ARGS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

async fn kill(child: &mut Child) {
    let pid = child.id();
    match child.kill().await {
        Ok(()) => info!(?pid, "process_killed"),
        Err(e) => warn!(?pid, error = %e, "process_kill_failed"),
    }
}

#[async_trait]
impl GenerationBackend for ClaudeCliBackend {
    async fn generate(
        &self,
        request: &AiRequest,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<GenerationEvent>,
    ) -> Result<GenerationSummary> {
        let mut child = self.command().spawn().map_err(|e| {
            Error::Generation(format!("failed to start {}: {}", self.program.display(), e))
        })?;
        debug!(pid = ?child.id(), sequence = request.sequence, "command_spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    warn!(error = %e, "prompt_write_failed");
                }
            });
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if events.send(GenerationEvent::Stderr(line)).is_err() {
                        break;
                    }
                }
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Generation("backend stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut decoder = StreamDecoder::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    kill(&mut child).await;
                    return Err(Error::Generation("cancelled".to_string()));
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        for event in decoder.decode_line(&line) {
                            let _ = events.send(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "stdout_read_failed");
                        break;
                    }
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                kill(&mut child).await;
                return Err(Error::Generation("cancelled".to_string()));
            }
            status = child.wait() => status?,
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if !status.success() {
            warn!(exit_status = %status, "process_exit_nonzero");
            return Err(Error::Generation(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }

        let result = decoder.result.unwrap_or_default();
        if result.is_error {
            return Err(Error::Generation(
                result
                    .result
                    .unwrap_or_else(|| "generation failed".to_string()),
            ));
        }
        Ok(GenerationSummary {
            usage: Some(Usage {
                cost_usd: result.total_cost_usd,
                input_tokens: result.usage.as_ref().and_then(|u| u.input_tokens),
                output_tokens: result.usage.as_ref().and_then(|u| u.output_tokens),
                duration_ms: result.duration_ms,
            }),
        })
    }
}

/// Accumulated input of a tool_use block being streamed.
#[derive(Debug, Default)]
struct ToolBlock {
    name: String,
    input_json: String,
}

/// Turns CLI output lines into generation events.
#[derive(Debug, Default)]
struct StreamDecoder {
    tool_blocks: HashMap<usize, ToolBlock>,
    result: Option<ResultEvent>,
}

impl StreamDecoder {
    fn decode_line(&mut self, line: &str) -> Vec<GenerationEvent> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        trace!(json = line, "raw_json_line");

        let event = match serde_json::from_str::<CliEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed_json_line");
                return Vec::new();
            }
        };

        match event {
            CliEvent::StreamEvent { event } => self.decode_stream_event(event),
            CliEvent::Result(result) => {
                debug!(?result, "result_event");
                self.result = Some(result);
                Vec::new()
            }
            CliEvent::Other => Vec::new(),
        }
    }

    fn decode_stream_event(&mut self, event: StreamEvent) -> Vec<GenerationEvent> {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    vec![GenerationEvent::Text(text)]
                }
                ContentBlock::ToolUse { name } => {
                    self.tool_blocks.insert(
                        index,
                        ToolBlock {
                            name,
                            input_json: String::new(),
                        },
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => vec![GenerationEvent::Text(text)],
                Delta::InputJsonDelta { partial_json } => {
                    if let Some(block) = self.tool_blocks.get_mut(&index) {
                        block.input_json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                Delta::Other => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => match self.tool_blocks.remove(&index) {
                Some(block) => vec![GenerationEvent::Tool(format_tool_summary(
                    &block.name,
                    &block.input_json,
                ))],
                None => Vec::new(),
            },
            StreamEvent::MessageStop => {
                self.tool_blocks.clear();
                Vec::new()
            }
            StreamEvent::Other => Vec::new(),
        }
    }
}

/// Formats a tool invocation for display, e.g. `[Tool: Bash] git status`.
fn format_tool_summary(tool_name: &str, input_json: &str) -> String {
    let prefix = format!("[Tool: {}]", tool_name);

    let input: serde_json::Value = if input_json.trim().is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        match serde_json::from_str(input_json) {
            Ok(v) => v,
            Err(_) => return format!("{} (input parsing failed)", prefix),
        }
    };

    let field = match tool_name {
        "Bash" => Some("command"),
        "Read" | "Edit" | "Write" | "NotebookEdit" => Some("file_path"),
        "Grep" | "Glob" => Some("pattern"),
        "WebFetch" => Some("url"),
        "WebSearch" => Some("query"),
        _ => None,
    };

    let detail = match field {
        Some(field) => input
            .get(field)
            .and_then(|v| v.as_str())
            .map(|v| truncate_str(v, TOOL_INPUT_MAX_LEN))
            .unwrap_or_else(|| format!("(no {})", field)),
        None => truncate_str(&input.to_string(), TOOL_INPUT_MAX_LEN),
    };
    format!("{} {}", prefix, detail)
}

/// Formats a number with thousands separators (e.g., 7371 -> "7,371").
fn format_with_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut result = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i).is_multiple_of(3) {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// One-line usage summary, e.g. `Cost: $0.05 | Tokens: 7,371 in / 9 out | Duration: 2.3s`.
pub fn format_usage_summary(usage: &Usage) -> String {
    let mut parts = Vec::new();

    if let Some(cost) = usage.cost_usd {
        parts.push(format!("Cost: ${:.2}", cost));
    }
    if usage.input_tokens.is_some() || usage.output_tokens.is_some() {
        let count = |n: Option<u64>| n.map(format_with_thousands).unwrap_or_else(|| "?".to_string());
        parts.push(format!(
            "Tokens: {} in / {} out",
            count(usage.input_tokens),
            count(usage.output_tokens)
        ));
    }
    if let Some(duration_ms) = usage.duration_ms {
        parts.push(format!("Duration: {:.1}s", duration_ms as f64 / 1000.0));
    }

    parts.join(" | ")
}

/// Truncates to `max_len` characters on one line, appending "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    let single_line: String = s.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    if single_line.chars().count() <= max_len {
        return single_line;
    }
    let kept: String = single_line
        .chars()
        .take(max_len.saturating_sub(3))
        .collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(lines: &[&str]) -> (StreamDecoder, Vec<GenerationEvent>) {
        let mut decoder = StreamDecoder::default();
        let events = lines
            .iter()
            .flat_map(|line| decoder.decode_line(line))
            .collect();
        (decoder, events)
    }

    #[test]
    fn test_decode_text_deltas() {
        let (_, events) = decode_all(&[
            r#"{"type":"system","subtype":"init"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello "}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"world"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_stop","index":0}}"#,
        ]);
        assert_eq!(
            events,
            vec![
                GenerationEvent::Text("Hello ".to_string()),
                GenerationEvent::Text("world".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_tool_block() {
        let (decoder, events) = decode_all(&[
            r#"{"type":"stream_event","event":{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t","name":"Bash","input":{}}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"command\":"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"git status\"}"}}}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_stop","index":1}}"#,
        ]);
        assert_eq!(
            events,
            vec![GenerationEvent::Tool("[Tool: Bash] git status".to_string())]
        );
        assert!(decoder.tool_blocks.is_empty());
    }

    #[test]
    fn test_decode_skips_malformed_and_blank_lines() {
        let (decoder, events) = decode_all(&["", "   ", "not json", r#"{"no_type":1}"#]);
        assert!(events.is_empty());
        assert!(decoder.result.is_none());
    }

    #[test]
    fn test_decode_keeps_result() {
        let (decoder, events) = decode_all(&[
            r#"{"type":"result","total_cost_usd":0.05,"duration_ms":2300,"usage":{"input_tokens":7371,"output_tokens":9}}"#,
        ]);
        assert!(events.is_empty());
        assert_eq!(decoder.result.unwrap().duration_ms, Some(2300));
    }

    #[test]
    fn test_format_tool_summary_known_tools() {
        assert_eq!(
            format_tool_summary("Read", r#"{"file_path":"src/main.rs"}"#),
            "[Tool: Read] src/main.rs"
        );
        assert_eq!(
            format_tool_summary("Grep", r#"{"pattern":"fn main"}"#),
            "[Tool: Grep] fn main"
        );
        assert_eq!(format_tool_summary("Bash", "{}"), "[Tool: Bash] (no command)");
    }

    #[test]
    fn test_format_tool_summary_unknown_tool() {
        assert_eq!(
            format_tool_summary("TodoWrite", r#"{"a":1}"#),
            r#"[Tool: TodoWrite] {"a":1}"#
        );
        assert_eq!(format_tool_summary("Task", ""), "[Tool: Task] {}");
    }

    #[test]
    fn test_format_tool_summary_bad_json() {
        assert_eq!(
            format_tool_summary("Bash", "{\"command\":"),
            "[Tool: Bash] (input parsing failed)"
        );
    }

    #[test]
    fn test_format_with_thousands() {
        assert_eq!(format_with_thousands(0), "0");
        assert_eq!(format_with_thousands(999), "999");
        assert_eq!(format_with_thousands(7371), "7,371");
        assert_eq!(format_with_thousands(1234567), "1,234,567");
    }

    #[test]
    fn test_format_usage_summary() {
        let usage = Usage {
            cost_usd: Some(0.0512),
            input_tokens: Some(7371),
            output_tokens: Some(9),
            duration_ms: Some(2300),
        };
        assert_eq!(
            format_usage_summary(&usage),
            "Cost: $0.05 | Tokens: 7,371 in / 9 out | Duration: 2.3s"
        );

        let partial = Usage {
            output_tokens: Some(12),
            ..Default::default()
        };
        assert_eq!(format_usage_summary(&partial), "Tokens: ? in / 12 out");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("line one\nline two", 60), "line one line two");
        assert_eq!(truncate_str("abcdefghij", 8), "abcde...");
        assert_eq!(truncate_str("ééééééééé", 5), "éé...");
    }

    #[cfg(unix)]
    mod process {
        use std::sync::Arc;
        use std::time::Duration;

        use tempfile::TempDir;

        use super::*;
        use crate::document::Document;
        use crate::templates::TemplateCatalog;

        fn request() -> AiRequest {
            let document = Document::parse("a.spec.md", "# Alpha\n");
            let fragment = document.fragment("a.spec.md#alpha").unwrap().clone();
            let template = TemplateCatalog::builtin()
                .unwrap()
                .get("review")
                .unwrap()
                .clone();
            AiRequest {
                sequence: 1,
                prompt: template.render(&document, &fragment, "test"),
                fragment,
                template,
                label: "test".to_string(),
            }
        }

        /// A backend running `sh <script>`; the stream flags become ignored positional args.
        fn scripted(dir: &TempDir, body: &str) -> ClaudeCliBackend {
            let script = dir.path().join("fake-claude.sh");
            std::fs::write(&script, body).unwrap();
            ClaudeCliBackend::new("sh", vec![script.to_string_lossy().into_owned()])
        }

        #[tokio::test]
        async fn test_generate_streams_events_and_usage() {
            let dir = TempDir::new().unwrap();
            let backend = scripted(
                &dir,
                r#"cat > /dev/null
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}'
echo 'warming up' >&2
echo '{"type":"result","total_cost_usd":0.01,"usage":{"input_tokens":10,"output_tokens":2}}'
"#,
            );
            let (tx, mut rx) = mpsc::unbounded_channel();

            let summary = backend
                .generate(&request(), CancellationToken::new(), tx)
                .await
                .unwrap();

            let mut events = Vec::new();
            while let Ok(event) = rx.try_recv() {
                events.push(event);
            }
            assert!(events.contains(&GenerationEvent::Text("Hi".to_string())));
            assert!(events.contains(&GenerationEvent::Stderr("warming up".to_string())));
            let usage = summary.usage.unwrap();
            assert_eq!(usage.input_tokens, Some(10));
            assert_eq!(usage.output_tokens, Some(2));
        }

        #[tokio::test]
        async fn test_generate_reports_nonzero_exit() {
            let dir = TempDir::new().unwrap();
            let backend = scripted(&dir, "cat > /dev/null\nexit 3\n");
            let (tx, _rx) = mpsc::unbounded_channel();

            let err = backend
                .generate(&request(), CancellationToken::new(), tx)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Generation(_)));
            assert!(err.to_string().contains("exited"));
        }

        #[tokio::test]
        async fn test_generate_reports_cli_error_result() {
            let dir = TempDir::new().unwrap();
            let backend = scripted(
                &dir,
                "cat > /dev/null\necho '{\"type\":\"result\",\"is_error\":true,\"result\":\"rate limited\"}'\n",
            );
            let (tx, _rx) = mpsc::unbounded_channel();

            let err = backend
                .generate(&request(), CancellationToken::new(), tx)
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), "rate limited");
        }

        #[tokio::test]
        async fn test_generate_kills_child_on_cancel() {
            let dir = TempDir::new().unwrap();
            let backend = Arc::new(scripted(&dir, "cat > /dev/null\nexec sleep 30\n"));
            let cancel = CancellationToken::new();
            let (tx, _rx) = mpsc::unbounded_channel();

            let task = {
                let backend = Arc::clone(&backend);
                let cancel = cancel.clone();
                tokio::spawn(async move { backend.generate(&request(), cancel, tx).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();

            let result = tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(result, Err(Error::Generation(_))));
        }

        #[tokio::test]
        async fn test_generate_missing_program() {
            let backend = ClaudeCliBackend::new("/nonexistent/claude", Vec::new());
            let (tx, _rx) = mpsc::unbounded_channel();
            let err = backend
                .generate(&request(), CancellationToken::new(), tx)
                .await
                .unwrap_err();
            assert!(err.to_string().starts_with("failed to start"));
        }
    }
}
