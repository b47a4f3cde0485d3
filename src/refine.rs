//! Inserting refinement notes into specification documents.

use similar::TextDiff;

use crate::document::{Document, Fragment};
use crate::error::{Error, Precondition, Result};

/// Return the document's text with `- <note>` inserted as the last line of `fragment`.
///
/// The fragment must come from this parse of `document`: its `end` line is used as the
/// insertion index. Newlines inside the note are folded to spaces so exactly one line is added.
pub fn apply_refinement(document: &Document, fragment: &Fragment, note: &str) -> Result<String> {
    let note = note.split_whitespace().collect::<Vec<_>>().join(" ");
    if note.is_empty() {
        return Err(Precondition::BlankNote.into());
    }
    if document.fragment(&fragment.full_id) != Some(fragment) {
        return Err(Error::Stale {
            full_id: fragment.full_id.clone(),
        });
    }

    let mut lines: Vec<&str> = document.content.split('\n').collect();
    // CRLF documents keep their `\r` on every split line, so the new line carries one too.
    let line_end = if document.content.contains("\r\n") { "\r" } else { "" };
    let item = format!("- {}{}", note, line_end);
    let index = fragment.end.line.min(lines.len());
    lines.insert(index, &item);
    Ok(lines.join("\n"))
}

/// A unified diff of a document edit, for showing the user what changed.
pub fn unified_diff(filename: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(2)
        .header(filename, filename)
        .to_string()
}
