//! The parsed project and fragment resolution.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::collab::DocumentStore;
use crate::document::{Document, Fragment, normalize_path};
use crate::error::{Error, Result};

/// Every parsed specification document plus an index from fragment id to owning document.
///
/// A `Project` is immutable once built. Re-parsing builds a new one which the
/// [`FragmentStore`] swaps in whole.
#[derive(Debug, Clone, Default)]
pub struct Project {
    documents: BTreeMap<String, Document>,
    /// `full_id` -> owning document filename.
    fragment_by_full_id: HashMap<String, String>,
}

impl Project {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        let documents: BTreeMap<String, Document> = documents
            .into_iter()
            .map(|d| (d.filename.clone(), d))
            .collect();

        let mut fragment_by_full_id = HashMap::new();
        for document in documents.values() {
            for fragment in &document.fragments {
                fragment_by_full_id.insert(fragment.full_id.clone(), document.filename.clone());
            }
        }

        Self {
            documents,
            fragment_by_full_id,
        }
    }

    /// A copy of this project with `document` added or replaced.
    pub fn with_document(&self, document: Document) -> Self {
        let filename = document.filename.clone();
        let others = self
            .documents
            .values()
            .filter(move |d| d.filename != filename)
            .cloned();
        Self::new(others.chain(std::iter::once(document)))
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn document(&self, filename: &str) -> Option<&Document> {
        self.documents.get(filename)
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_by_full_id.len()
    }

    pub fn fragment(&self, full_id: &str) -> Option<&Fragment> {
        let filename = self.fragment_by_full_id.get(full_id)?;
        self.documents.get(filename)?.fragment(full_id)
    }

    /// Walk `parent` links up to the fragment with no parent.
    ///
    /// The walk is bounded by the number of fragments so it terminates even on malformed input.
    pub fn root_fragment<'a>(&'a self, fragment: &'a Fragment) -> &'a Fragment {
        let mut current = fragment;
        for _ in 0..=self.fragment_by_full_id.len() {
            if current.is_root() {
                return current;
            }
            match current.parent.as_deref().and_then(|id| self.fragment(id)) {
                Some(parent) => current = parent,
                None => return current,
            }
        }
        warn!(full_id = %fragment.full_id, "fragment_parent_cycle");
        current
    }

    /// Documents whose references include `path`.
    pub fn referencing_documents(&self, path: &str) -> Vec<&Document> {
        self.documents
            .values()
            .filter(|d| d.references.iter().any(|r| r == path))
            .collect()
    }

    /// The root fragment of `filename` that declares `path`, else the document's first root.
    pub fn referencing_root(&self, filename: &str, path: &str) -> Option<&Fragment> {
        let document = self.document(filename)?;
        document
            .root_fragments()
            .find(|root| document.subtree_references(root, path))
            .or_else(|| document.first_root())
    }

    /// Resolve an identifier whose paths are already project-relative.
    pub fn resolve(&self, identifier: &Identifier, spec_suffix: &str) -> Result<Resolution> {
        match identifier {
            Identifier::Fragment(fragment) => {
                let current = self.fragment(&fragment.full_id).ok_or_else(|| Error::Stale {
                    full_id: fragment.full_id.clone(),
                })?;
                Ok(Resolution::Found(self.root_fragment(current).clone()))
            }
            Identifier::Id(full_id) => {
                let current = self.fragment(full_id).ok_or_else(|| Error::NotFound {
                    identifier: full_id.clone(),
                })?;
                Ok(Resolution::Found(self.root_fragment(current).clone()))
            }
            Identifier::Path(path) if path.ends_with(spec_suffix) => match self.document(path) {
                Some(document) => document
                    .first_root()
                    .map(|root| Resolution::Found(root.clone()))
                    .ok_or_else(|| Error::NotFound {
                        identifier: path.clone(),
                    }),
                None => Ok(Resolution::Unparsed { path: path.clone() }),
            },
            Identifier::Path(path) => {
                let referencing = self.referencing_documents(path);
                match referencing.as_slice() {
                    [] => Ok(Resolution::Unparsed { path: path.clone() }),
                    [only] => self
                        .referencing_root(&only.filename, path)
                        .map(|root| Resolution::Found(root.clone()))
                        .ok_or_else(|| Error::NotFound {
                            identifier: path.clone(),
                        }),
                    many => Ok(Resolution::Ambiguous {
                        path: path.clone(),
                        candidates: many.iter().map(|d| d.filename.clone()).collect(),
                    }),
                }
            }
            Identifier::Position { path, line } => {
                let fragment = self
                    .document(path)
                    .and_then(|d| d.innermost_at(*line))
                    .ok_or_else(|| Error::NotFound {
                        identifier: identifier.to_string(),
                    })?;
                Ok(Resolution::Found(self.root_fragment(fragment).clone()))
            }
        }
    }
}

/// A loose reference to a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// A fragment captured earlier; re-resolved by id.
    Fragment(Fragment),
    /// A fragment `full_id`.
    Id(String),
    /// A specification document or a file referenced by one.
    Path(String),
    /// A zero-based line inside a specification document.
    Position { path: String, line: usize },
}

impl Identifier {
    /// Parse a command-line target: `file.spec.md#id`, `file.spec.md:12` (1-based line), or a path.
    pub fn parse(raw: &str) -> Self {
        if raw.contains('#') {
            return Self::Id(raw.to_string());
        }
        if let Some((path, line)) = raw.rsplit_once(':')
            && let Ok(line) = line.parse::<usize>()
            && line > 0
        {
            return Self::Position {
                path: path.to_string(),
                line: line - 1,
            };
        }
        Self::Path(raw.to_string())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fragment(fragment) => write!(f, "{}", fragment.full_id),
            Self::Id(id) => write!(f, "{}", id),
            Self::Path(path) => write!(f, "{}", path),
            Self::Position { path, line } => write!(f, "{}:{}", path, line + 1),
        }
    }
}

/// Outcome of resolving an identifier against the parsed project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A root fragment.
    Found(Fragment),
    /// Several documents reference `path`; the caller must choose.
    Ambiguous {
        path: String,
        candidates: Vec<String>,
    },
    /// Nothing parsed covers `path`; it may still be open in the editor or unparsed on disk.
    Unparsed { path: String },
}

impl Resolution {
    /// The resolved root when no user interaction is possible.
    pub fn into_fragment(self) -> Result<Fragment> {
        match self {
            Self::Found(fragment) => Ok(fragment),
            Self::Ambiguous { path, candidates } => Err(Error::Ambiguous {
                candidates: candidates.into_iter().map(PathBuf::from).collect(),
                path: PathBuf::from(path),
            }),
            Self::Unparsed { path } => Err(Error::NotFound { identifier: path }),
        }
    }
}

/// Owns the current [`Project`] snapshot for a project root.
pub struct FragmentStore {
    root: PathBuf,
    spec_suffix: String,
    project: Arc<Project>,
}

impl FragmentStore {
    pub fn new(root: impl Into<PathBuf>, spec_suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            spec_suffix: spec_suffix.into(),
            project: Arc::new(Project::default()),
        }
    }

    /// The current snapshot. Holders keep a consistent view across later re-parses.
    pub fn project(&self) -> Arc<Project> {
        Arc::clone(&self.project)
    }

    pub fn spec_suffix(&self) -> &str {
        &self.spec_suffix
    }

    pub fn is_spec_document(&self, path: &str) -> bool {
        path.ends_with(&self.spec_suffix)
    }

    /// Swap in a fully built project.
    pub fn replace(&mut self, project: Project) {
        debug!(
            documents = project.documents.len(),
            fragments = project.fragment_count(),
            "project_swapped"
        );
        self.project = Arc::new(project);
    }

    /// Add or replace one parsed document.
    pub fn adopt(&mut self, document: Document) {
        let project = self.project.with_document(document);
        self.replace(project);
    }

    /// Re-parse every specification document in the store.
    ///
    /// Documents that cannot be read are skipped with a warning.
    pub async fn reload(&mut self, store: &dyn DocumentStore) -> Result<()> {
        let files = store.spec_files(&self.spec_suffix).await?;
        let mut documents = Vec::with_capacity(files.len());
        for filename in files {
            match store.read_text(&filename).await {
                Ok(text) => documents.push(Document::parse(&filename, &text)),
                Err(e) => warn!(file = %filename, error = %e, "spec_read_failed"),
            }
        }
        let project = Project::new(documents);
        info!(
            documents = project.documents.len(),
            fragments = project.fragment_count(),
            "project_parsed"
        );
        self.replace(project);
        Ok(())
    }

    /// Re-parse a single document from the store.
    pub async fn reload_document(&mut self, store: &dyn DocumentStore, filename: &str) -> Result<()> {
        let text = store.read_text(filename).await?;
        self.adopt(Document::parse(filename, &text));
        Ok(())
    }

    /// Convert a user-supplied path into the project-relative key documents are stored under.
    pub fn key(&self, raw: &str) -> String {
        let path = Path::new(raw);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).unwrap_or(path)
        } else {
            path
        };
        normalize_path(&relative.to_string_lossy())
    }

    /// Resolve an identifier against the current snapshot.
    pub fn resolve(&self, identifier: &Identifier) -> Result<Resolution> {
        let identifier = match identifier {
            Identifier::Path(path) => Identifier::Path(self.key(path)),
            Identifier::Position { path, line } => Identifier::Position {
                path: self.key(path),
                line: *line,
            },
            Identifier::Id(id) => match id.split_once('#') {
                Some((path, rest)) => Identifier::Id(format!("{}#{}", self.key(path), rest)),
                None => identifier.clone(),
            },
            Identifier::Fragment(_) => identifier.clone(),
        };
        self.project.resolve(&identifier, &self.spec_suffix)
    }
}
