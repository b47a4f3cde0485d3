//! User-facing flows: run a template, repeat it, refine it.
//!
//! Every failure is reported through [`Editor::notify`] and turned into
//! [`Outcome::DidNotProceed`]; nothing escapes to the caller as an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collab::{DocumentStore, Editor, EscapeAction, NoticeKind, PickItem};
use crate::document::{Document, Fragment, Position, REFERENCE_MARKER};
use crate::error::{Error, Precondition, Result};
use crate::project::{FragmentStore, Identifier, Resolution};
use crate::refine::{apply_refinement, unified_diff};
use crate::request::{AiRequest, RequestController};
use crate::templates::{PromptTemplate, TEMPLATE_SKELETON, TemplateCatalog, present};

/// Settings the flows need beyond their collaborators.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Where "author a new template" writes its skeleton.
    pub templates_dir: Option<PathBuf>,
    pub discussion_url: String,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Started(Arc<AiRequest>),
    DidNotProceed,
}

impl Outcome {
    pub fn request(&self) -> Option<&Arc<AiRequest>> {
        match self {
            Self::Started(request) => Some(request),
            Self::DidNotProceed => None,
        }
    }
}

pub struct Session {
    editor: Arc<dyn Editor>,
    store: Arc<dyn DocumentStore>,
    fragments: FragmentStore,
    catalog: TemplateCatalog,
    controller: RequestController,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        editor: Arc<dyn Editor>,
        store: Arc<dyn DocumentStore>,
        fragments: FragmentStore,
        catalog: TemplateCatalog,
        controller: RequestController,
        settings: SessionSettings,
    ) -> Self {
        Self {
            editor,
            store,
            fragments,
            catalog,
            controller,
            settings,
        }
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.catalog
    }

    pub fn controller(&mut self) -> &mut RequestController {
        &mut self.controller
    }

    /// Parse every specification document under the project root.
    pub async fn reload(&mut self) -> Result<()> {
        self.fragments.reload(self.store.as_ref()).await
    }

    /// Resolve `target` (or the previous request's fragment), pick a template unless `template_id`
    /// names one, and start generating.
    pub async fn run_template(
        &mut self,
        target: Option<Identifier>,
        template_id: Option<&str>,
        label: Option<&str>,
    ) -> Outcome {
        let result = self.try_run_template(target, template_id, label).await;
        self.conclude(result).await
    }

    /// Run the previous request again with the same fragment, template and label.
    pub async fn repeat_previous(&mut self) -> Outcome {
        let result = self.try_repeat_previous().await;
        self.conclude(result).await
    }

    /// Insert a note into the previous request's fragment and run its template again.
    ///
    /// With `note` absent the user is prompted for one.
    pub async fn refine(&mut self, note: Option<String>) -> Outcome {
        let result = self.try_refine(note).await;
        self.conclude(result).await
    }

    async fn conclude(&self, result: Result<Arc<AiRequest>>) -> Outcome {
        match result {
            Ok(request) => {
                let fragment = &request.fragment;
                self.editor
                    .reveal_position(&fragment.file, fragment.start)
                    .await;
                Outcome::Started(request)
            }
            Err(e) => {
                self.report(&e).await;
                Outcome::DidNotProceed
            }
        }
    }

    async fn report(&self, error: &Error) {
        if error.is_user_cancelled() {
            debug!("user_cancelled");
            return;
        }
        match error {
            Error::Precondition(_) => {
                warn!(error = %error, "precondition_failed");
                self.editor
                    .notify(NoticeKind::Warning, &error.to_string())
                    .await;
            }
            _ if error.is_not_found() => {
                warn!(error = %error, "fragment_not_found");
                self.editor
                    .notify(NoticeKind::Warning, &error.to_string())
                    .await;
            }
            _ => {
                warn!(error = %error, "operation_failed");
                self.editor.notify(NoticeKind::Error, &error.to_string()).await;
            }
        }
    }

    /// Refuse to proceed while the editor holds unsaved changes.
    async fn ensure_clean(&self) -> Result<()> {
        let dirty: Vec<PathBuf> = self
            .store
            .list_open_documents()
            .await
            .into_iter()
            .filter(|d| d.is_dirty)
            .map(|d| PathBuf::from(d.path))
            .collect();
        if dirty.is_empty() {
            Ok(())
        } else {
            Err(Precondition::DirtyDocuments(dirty).into())
        }
    }

    async fn try_run_template(
        &mut self,
        target: Option<Identifier>,
        template_id: Option<&str>,
        label: Option<&str>,
    ) -> Result<Arc<AiRequest>> {
        self.ensure_clean().await?;

        let fragment = self.resolve_target(target).await?;
        info!(fragment = %fragment.full_id, "fragment_resolved");

        let template = match template_id {
            Some(id) => self
                .catalog
                .get(id)
                .cloned()
                .ok_or_else(|| Error::UnknownTemplate { id: id.to_string() })?,
            None => self.pick_template(&fragment).await?,
        };
        if !template.applies_to(&fragment) {
            debug!(template = %template.id, fragment = %fragment.full_id, "template_not_applicable");
        }

        let label = label.unwrap_or(template.title.as_str()).to_string();
        self.start(&fragment, &template, &label).await
    }

    async fn try_repeat_previous(&mut self) -> Result<Arc<AiRequest>> {
        self.ensure_clean().await?;
        let previous = self.controller.resume_previous()?;
        self.start(&previous.fragment, &previous.template, &previous.label)
            .await
    }

    async fn try_refine(&mut self, note: Option<String>) -> Result<Arc<AiRequest>> {
        self.ensure_clean().await?;
        let previous = self.controller.resume_previous()?;

        let note = match note {
            Some(note) => note,
            None => self
                .editor
                .prompt_text(
                    &format!("Refine \"{}\"", previous.fragment.title),
                    "A note added to the specification before the template runs again",
                )
                .await
                .ok_or(Error::UserCancelled)?,
        };
        if note.trim().is_empty() {
            return Err(Precondition::BlankNote.into());
        }

        self.controller.cancel().await;

        // Positions are only trusted straight after a fresh parse of the file being edited.
        let filename = previous.fragment.file.clone();
        self.fragments
            .reload_document(self.store.as_ref(), &filename)
            .await?;
        let project = self.fragments.project();
        let stale = || Error::Stale {
            full_id: previous.fragment.full_id.clone(),
        };
        let document = project.document(&filename).ok_or_else(stale)?;
        let fragment = document
            .fragment(&previous.fragment.full_id)
            .ok_or_else(stale)?;

        let updated = apply_refinement(document, fragment, &note)?;
        debug!(diff = %unified_diff(&filename, &document.content, &updated), "refinement_diff");

        self.store.write_text(&filename, &updated).await?;
        self.store.save_all_open_documents().await?;
        self.fragments.adopt(Document::parse(&filename, &updated));
        info!(file = %filename, fragment = %fragment.full_id, "refinement_applied");

        self.start(&previous.fragment, &previous.template, &previous.label)
            .await
    }

    /// Cancel whatever runs and start the new request.
    async fn start(
        &mut self,
        fragment: &Fragment,
        template: &PromptTemplate,
        label: &str,
    ) -> Result<Arc<AiRequest>> {
        self.controller.cancel().await;
        let project = self.fragments.project();
        self.controller.start(&project, fragment, template, label)
    }

    async fn resolve_target(&mut self, target: Option<Identifier>) -> Result<Fragment> {
        let identifier = match target {
            Some(identifier) => identifier,
            None => match self.controller.last_request() {
                Some(previous) => Identifier::Fragment(previous.fragment.clone()),
                None => {
                    return Err(Error::NotFound {
                        identifier: "the previous request".to_string(),
                    });
                }
            },
        };

        match self.fragments.resolve(&identifier)? {
            Resolution::Found(fragment) => Ok(fragment),
            Resolution::Ambiguous { path, candidates } => {
                self.disambiguate(&path, &candidates).await
            }
            Resolution::Unparsed { path } => self.resolve_unparsed(&path).await,
        }
    }

    /// Let the user choose among the documents referencing `path`, or create a new one.
    async fn disambiguate(&mut self, path: &str, candidates: &[String]) -> Result<Fragment> {
        let mut items: Vec<PickItem> = candidates
            .iter()
            .map(|filename| PickItem::Choice {
                key: filename.clone(),
                label: filename.clone(),
                detail: Some(format!("references {}", path)),
            })
            .collect();
        items.push(PickItem::Action(EscapeAction::CreateDocument));

        let title = format!("Several specifications reference {}", path);
        match self.choose(&title, &items).await? {
            PickItem::Choice { key, .. } => self
                .fragments
                .project()
                .referencing_root(key, path)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    identifier: key.clone(),
                }),
            PickItem::Action(EscapeAction::CreateDocument) => self.create_document(path).await,
            PickItem::Action(_) | PickItem::Template { .. } => Err(Error::UserCancelled),
        }
    }

    /// Nothing parsed covers `path`: try the editor's open buffer, then the disk, then offer to
    /// create a specification for it.
    async fn resolve_unparsed(&mut self, path: &str) -> Result<Fragment> {
        let open = self
            .store
            .list_open_documents()
            .await
            .into_iter()
            .find(|d| self.fragments.key(&d.path) == path);

        let text = if let Some(open) = open {
            Some(open.text)
        } else if self.fragments.is_spec_document(path) && self.store.exists(path).await {
            Some(self.store.read_text(path).await?)
        } else {
            None
        };

        if let Some(text) = text {
            let document = Document::parse(path, &text);
            let root = document.first_root().cloned();
            debug!(file = %path, "document_adopted");
            self.fragments.adopt(document);
            return root.ok_or_else(|| Error::NotFound {
                identifier: path.to_string(),
            });
        }

        if self.fragments.is_spec_document(path) {
            return Err(Error::NotFound {
                identifier: path.to_string(),
            });
        }

        let items = [PickItem::Action(EscapeAction::CreateDocument)];
        let title = format!("No specification references {}", path);
        match self.choose(&title, &items).await? {
            PickItem::Action(EscapeAction::CreateDocument) => self.create_document(path).await,
            _ => Err(Error::UserCancelled),
        }
    }

    /// Write a new specification next to `path` that references it, and resolve to its root.
    async fn create_document(&mut self, path: &str) -> Result<Fragment> {
        let suffix = self.fragments.spec_suffix().to_string();
        let mut attempt = 1;
        let filename = loop {
            let candidate = spec_filename_for(path, &suffix, attempt);
            if !self.store.exists(&candidate).await {
                break candidate;
            }
            attempt += 1;
        };

        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        let text = format!("# {}\n\n{} {}\n", name, REFERENCE_MARKER, path);
        self.store.write_text(&filename, &text).await?;
        info!(file = %filename, reference = %path, "spec_document_created");
        self.editor
            .notify(NoticeKind::Info, &format!("Created {}", filename))
            .await;

        let document = Document::parse(&filename, &text);
        let root = document.first_root().cloned();
        self.fragments.adopt(document);
        root.ok_or_else(|| Error::NotFound {
            identifier: filename,
        })
    }

    async fn pick_template(&mut self, fragment: &Fragment) -> Result<PromptTemplate> {
        let applicable = self.catalog.applicable_templates(fragment);
        let items = present(&applicable);
        let title = format!("Templates for {}", fragment.title);

        match self.choose(&title, &items).await? {
            PickItem::Template { template, .. } => Ok(template.clone()),
            PickItem::Action(action) => {
                self.run_escape_action(*action).await?;
                Err(Error::UserCancelled)
            }
            PickItem::Choice { .. } => Err(Error::UserCancelled),
        }
    }

    async fn choose<'a>(&self, title: &str, items: &'a [PickItem]) -> Result<&'a PickItem> {
        let index = self
            .editor
            .choose_pick(title, items)
            .await
            .ok_or(Error::UserCancelled)?;
        items.get(index).ok_or(Error::UserCancelled)
    }

    async fn run_escape_action(&self, action: EscapeAction) -> Result<()> {
        match action {
            EscapeAction::NewTemplate => {
                let Some(dir) = &self.settings.templates_dir else {
                    self.editor
                        .notify(NoticeKind::Warning, "No templates directory is configured")
                        .await;
                    return Ok(());
                };
                let path = write_template_skeleton(dir).await?;
                info!(path = ?path, "template_skeleton_created");
                self.editor
                    .reveal_position(&path.to_string_lossy(), Position::default())
                    .await;
                self.editor
                    .notify(
                        NoticeKind::Info,
                        &format!("Edit {} and run again to use it", path.display()),
                    )
                    .await;
            }
            EscapeAction::CommunityDiscussion => {
                let message = if self.settings.discussion_url.is_empty() {
                    "No community discussion is configured (community.discussion_url)".to_string()
                } else {
                    format!("Community templates: {}", self.settings.discussion_url)
                };
                self.editor.notify(NoticeKind::Info, &message).await;
            }
            EscapeAction::CreateDocument => {}
        }
        Ok(())
    }
}

/// `<dir>/<stem><suffix>` for `path`, with `-<attempt>` after the stem from the second attempt on.
fn spec_filename_for(path: &str, suffix: &str, attempt: usize) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (Some(dir), name),
        None => (None, path),
    };
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    let base = if attempt > 1 {
        format!("{}-{}{}", stem, attempt, suffix)
    } else {
        format!("{}{}", stem, suffix)
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, base),
        None => base,
    }
}

/// Write the template skeleton into `dir` under a free file name.
async fn write_template_skeleton(dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let mut attempt = 1;
    loop {
        let name = if attempt > 1 {
            format!("my-template-{}.toml", attempt)
        } else {
            "my-template.toml".to_string()
        };
        let path = dir.join(name);
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, TEMPLATE_SKELETON).await?;
            return Ok(path);
        }
        attempt += 1;
    }
}
