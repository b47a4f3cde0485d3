//! Interfaces to the collaborators the core drives: the editor/UI, the document store, and the
//! picker items exchanged with the editor.

use async_trait::async_trait;

use crate::document::Position;
use crate::error::Result;
use crate::templates::PromptTemplate;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Warning,
    Error,
}

/// An action offered alongside templates or documents in a picker. Never a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscapeAction {
    /// Author a new prompt template.
    NewTemplate,
    /// Open the community discussion about templates.
    CommunityDiscussion,
    /// Create a new specification document for a referenced file.
    CreateDocument,
}

impl EscapeAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NewTemplate => "+ Author a new template",
            Self::CommunityDiscussion => "? View community discussion",
            Self::CreateDocument => "+ Create a new specification",
        }
    }
}

/// One entry of a picker.
#[derive(Debug, Clone)]
pub enum PickItem {
    Template {
        template: PromptTemplate,
        group: String,
    },
    Action(EscapeAction),
    /// A plain choice identified by `key`, e.g. a document filename.
    Choice {
        key: String,
        label: String,
        detail: Option<String>,
    },
}

impl PickItem {
    pub fn label(&self) -> &str {
        match self {
            Self::Template { template, .. } => &template.title,
            Self::Action(action) => action.label(),
            Self::Choice { label, .. } => label,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Template { template, .. } => template.description.as_deref(),
            Self::Action(_) => None,
            Self::Choice { detail, .. } => detail.as_deref(),
        }
    }

    /// Group heading to display above this item, if any.
    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Template { group, .. } => Some(group),
            Self::Action(_) | Self::Choice { .. } => None,
        }
    }
}

/// The editor/UI side. `None` from a prompt means the user dismissed it.
#[async_trait]
pub trait Editor: Send + Sync {
    /// Show a picker and return the index of the selected item.
    async fn choose_pick(&self, title: &str, items: &[PickItem]) -> Option<usize>;

    async fn prompt_text(&self, title: &str, description: &str) -> Option<String>;

    async fn notify(&self, kind: NoticeKind, message: &str);

    async fn reveal_position(&self, document: &str, position: Position);
}

/// A document currently open in the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDocument {
    /// Project-relative path.
    pub path: String,
    pub text: String,
    pub is_dirty: bool,
}

/// Text persistence. Filenames are project-relative with `/` separators.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read_text(&self, filename: &str) -> Result<String>;

    async fn write_text(&self, filename: &str, text: &str) -> Result<()>;

    async fn save_all_open_documents(&self) -> Result<()>;

    async fn list_open_documents(&self) -> Vec<OpenDocument>;

    async fn exists(&self, filename: &str) -> bool;

    /// Every specification document under the project root, sorted.
    async fn spec_files(&self, suffix: &str) -> Result<Vec<String>>;
}
