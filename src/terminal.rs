//! Line-oriented terminal front end.

use std::future::Future;
use std::io::{self, Write};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::backend::format_usage_summary;
use crate::collab::{Editor, NoticeKind, PickItem};
use crate::document::{Document, Position};
use crate::request::{GenerationEvent, GenerationSummary};

/// Reads answers from stdin. Pickers and prompts go to stdout, notices to stderr.
///
/// An empty answer, end of input or Ctrl-C dismisses a picker or prompt.
pub struct TerminalEditor {
    input: Mutex<Lines<BufReader<Stdin>>>,
}

impl Default for TerminalEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalEditor {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn read_line(&self, prompt: &str) -> Option<String> {
        print!("{}", prompt);
        let _ = io::stdout().flush();
        let mut input = self.input.lock().await;
        let line = next_line_or_interrupt(&mut input, interrupted()).await;
        if line.is_none() {
            println!();
        }
        line
    }
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The next input line, or `None` on end of input, read error or `interrupt`.
async fn next_line_or_interrupt<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = ()>,
) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => line.ok().flatten(),
        _ = interrupt => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Selection {
    Index(usize),
    Dismiss,
    Invalid,
}

/// Parse a 1-based menu answer.
fn parse_selection(answer: &str, len: usize) -> Selection {
    let answer = answer.trim();
    if answer.is_empty() {
        return Selection::Dismiss;
    }
    match answer.parse::<usize>() {
        Ok(n) if (1..=len).contains(&n) => Selection::Index(n - 1),
        _ => Selection::Invalid,
    }
}

/// Numbered menu with a heading whenever the group changes.
fn render_picker(title: &str, items: &[PickItem]) -> String {
    let mut out = format!("{}\n", title);
    let mut current_group: Option<&str> = None;
    for (index, item) in items.iter().enumerate() {
        if let Some(group) = item.group()
            && current_group != Some(group)
        {
            out.push_str(&format!("  {}\n", group));
            current_group = Some(group);
        }
        out.push_str(&format!("  {:>3}. {}", index + 1, item.label()));
        if let Some(detail) = item.detail() {
            out.push_str(&format!(" - {}", detail));
        }
        out.push('\n');
    }
    out
}

#[async_trait]
impl Editor for TerminalEditor {
    async fn choose_pick(&self, title: &str, items: &[PickItem]) -> Option<usize> {
        print!("{}", render_picker(title, items));
        loop {
            let answer = self
                .read_line(&format!("Select 1-{} (empty to cancel): ", items.len()))
                .await?;
            match parse_selection(&answer, items.len()) {
                Selection::Index(index) => return Some(index),
                Selection::Dismiss => return None,
                Selection::Invalid => eprintln!("Not a choice: {}", answer.trim()),
            }
        }
    }

    async fn prompt_text(&self, title: &str, description: &str) -> Option<String> {
        println!("{}", title);
        println!("  {}", description);
        let answer = self.read_line("> ").await?;
        if answer.trim().is_empty() {
            None
        } else {
            Some(answer)
        }
    }

    async fn notify(&self, kind: NoticeKind, message: &str) {
        let prefix = match kind {
            NoticeKind::Info => "info",
            NoticeKind::Warning => "warning",
            NoticeKind::Error => "error",
        };
        eprintln!("{}: {}", prefix, message);
    }

    async fn reveal_position(&self, document: &str, position: Position) {
        eprintln!("{}:{}", document, position);
    }
}

/// Writes streamed generation output, keeping tool and stderr lines on lines of their own.
pub struct StreamPrinter<W: Write> {
    out: W,
    at_line_start: bool,
}

impl<W: Write> StreamPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            at_line_start: true,
        }
    }

    fn break_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            writeln!(self.out)?;
            self.at_line_start = true;
        }
        Ok(())
    }

    pub fn event(&mut self, event: &GenerationEvent) -> io::Result<()> {
        match event {
            GenerationEvent::Text(text) => {
                write!(self.out, "{}", text)?;
                if !text.is_empty() {
                    self.at_line_start = text.ends_with('\n');
                }
            }
            GenerationEvent::Tool(summary) => {
                self.break_line()?;
                writeln!(self.out, "{}", summary)?;
            }
            GenerationEvent::Stderr(line) => {
                self.break_line()?;
                writeln!(self.out, "[stderr] {}", line)?;
            }
        }
        self.out.flush()
    }

    /// Close the output of one request, with its usage line when known.
    pub fn finish(&mut self, summary: &GenerationSummary) -> io::Result<()> {
        self.break_line()?;
        if let Some(usage) = &summary.usage {
            let line = format_usage_summary(usage);
            if !line.is_empty() {
                writeln!(self.out, "{}", "─".repeat(35))?;
                writeln!(self.out, "{}", line)?;
            }
        }
        self.out.flush()
    }

    /// End any partial line, e.g. after cancellation.
    pub fn interrupt(&mut self) -> io::Result<()> {
        self.break_line()?;
        self.out.flush()
    }
}

/// Indented outline of a document's fragments with ids, lines and references.
pub fn render_fragment_tree(document: &Document) -> String {
    let mut out = format!("{}\n", document.filename);
    for fragment in &document.fragments {
        let indent = "  ".repeat(fragment.depth);
        out.push_str(&format!(
            "{}{}  [{}] lines {}-{}",
            indent,
            fragment.title,
            fragment.full_id,
            fragment.start.line + 1,
            fragment.end.line
        ));
        if !fragment.references.is_empty() {
            out.push_str(&format!(" refs: {}", fragment.references.join(", ")));
        }
        out.push('\n');
    }
    out
}
