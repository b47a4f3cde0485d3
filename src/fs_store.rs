//! Document store backed by the files under a project root.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::collab::{DocumentStore, OpenDocument};
use crate::document::normalize_path;
use crate::error::Result;

/// Directories never searched for specification documents.
const SKIPPED_DIRS: [&str; 2] = ["target", "node_modules"];

/// Plain files on disk. There are no editor buffers, so nothing is ever open or dirty.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn read_text(&self, filename: &str) -> Result<String> {
        Ok(tokio::fs::read_to_string(self.path(filename)).await?)
    }

    async fn write_text(&self, filename: &str, text: &str) -> Result<()> {
        let path = self.path(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, text).await?;
        debug!(file = %filename, bytes = text.len(), "document_written");
        Ok(())
    }

    async fn save_all_open_documents(&self) -> Result<()> {
        Ok(())
    }

    async fn list_open_documents(&self) -> Vec<OpenDocument> {
        Vec::new()
    }

    async fn exists(&self, filename: &str) -> bool {
        tokio::fs::try_exists(self.path(filename))
            .await
            .unwrap_or(false)
    }

    async fn spec_files(&self, suffix: &str) -> Result<Vec<String>> {
        let mut files: Vec<String> = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !is_skipped_dir(e))
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.file_name().to_string_lossy().ends_with(suffix))
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|relative| normalize_path(&relative.to_string_lossy()))
            })
            .collect();
        files.sort();
        debug!(count = files.len(), root = ?self.root, "spec_files_listed");
        Ok(files)
    }
}
