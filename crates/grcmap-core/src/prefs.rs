//! Persisted display preferences
//!
//! Per-page UI state (collapsed widgets, tree-view column choices, sort
//! order) stored as one versioned JSON document. A document written by an
//! older version is discarded on load, never migrated.

use crate::models::ModelDescriptor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the preferences document lives.
pub trait PrefsStorage: Send + Sync {
    fn load(&self) -> anyhow::Result<Option<String>>;
    fn save(&self, document: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPrefsStorage {
    document: Mutex<Option<String>>,
}

impl MemoryPrefsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(Some(document.into())),
        }
    }

    pub fn document(&self) -> Option<String> {
        self.document.lock().clone()
    }
}

impl PrefsStorage for MemoryPrefsStorage {
    fn load(&self) -> anyhow::Result<Option<String>> {
        Ok(self.document.lock().clone())
    }

    fn save(&self, document: &str) -> anyhow::Result<()> {
        *self.document.lock() = Some(document.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FilePrefsStorage {
    path: PathBuf,
}

impl FilePrefsStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl PrefsStorage for FilePrefsStorage {
    fn load(&self) -> anyhow::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(document) => Ok(Some(document)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, document: &str) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, document)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    pub key: String,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagePrefs {
    pub collapsed: BTreeMap<String, bool>,
    pub tree_columns: BTreeMap<String, Vec<String>>,
    pub sort: BTreeMap<String, SortState>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(default)]
    pages: BTreeMap<String, PagePrefs>,
}

pub struct DisplayPrefs {
    storage: Arc<dyn PrefsStorage>,
    version: u32,
    pages: Mutex<BTreeMap<String, PagePrefs>>,
}

impl DisplayPrefs {
    /// Read the stored document. Outdated or unreadable documents start over
    /// empty.
    pub fn load(storage: Arc<dyn PrefsStorage>, version: u32) -> anyhow::Result<Self> {
        let pages = match storage.load()? {
            None => BTreeMap::new(),
            Some(text) => match serde_json::from_str::<Document>(&text) {
                Ok(doc) if doc.version >= version => doc.pages,
                Ok(doc) => {
                    tracing::debug!(stored = doc.version, current = version, "discarding outdated display preferences");
                    BTreeMap::new()
                }
                Err(err) => {
                    tracing::warn!(error = %err, "discarding unreadable display preferences");
                    BTreeMap::new()
                }
            },
        };
        Ok(Self {
            storage,
            version,
            pages: Mutex::new(pages),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn page(&self, page: &str) -> PagePrefs {
        self.pages.lock().get(page).cloned().unwrap_or_default()
    }

    pub fn is_collapsed(&self, page: &str, widget: &str) -> bool {
        self.pages
            .lock()
            .get(page)
            .and_then(|p| p.collapsed.get(widget).copied())
            .unwrap_or(false)
    }

    pub fn set_collapsed(&self, page: &str, widget: &str, collapsed: bool) -> anyhow::Result<()> {
        self.update(page, |p| {
            p.collapsed.insert(widget.to_string(), collapsed);
        })
    }

    /// Columns to show for `model` on `page`: the stored choice checked
    /// against the model's tree-view config.
    pub fn tree_columns(&self, page: &str, model: &ModelDescriptor) -> Vec<String> {
        let stored = self
            .pages
            .lock()
            .get(page)
            .and_then(|p| p.tree_columns.get(&model.model_singular).cloned())
            .unwrap_or_default();
        model.tree_view.resolve_columns(&stored)
    }

    pub fn set_tree_columns(
        &self,
        page: &str,
        model: &str,
        columns: Vec<String>,
    ) -> anyhow::Result<()> {
        self.update(page, |p| {
            p.tree_columns.insert(model.to_string(), columns);
        })
    }

    pub fn sort_state(&self, page: &str, widget: &str) -> Option<SortState> {
        self.pages
            .lock()
            .get(page)
            .and_then(|p| p.sort.get(widget).cloned())
    }

    pub fn set_sort_state(&self, page: &str, widget: &str, sort: SortState) -> anyhow::Result<()> {
        self.update(page, |p| {
            p.sort.insert(widget.to_string(), sort);
        })
    }

    /// Apply `change` and write the whole document back.
    fn update(&self, page: &str, change: impl FnOnce(&mut PagePrefs)) -> anyhow::Result<()> {
        let document = {
            let mut pages = self.pages.lock();
            change(pages.entry(page.to_string()).or_default());
            serde_json::to_string(&Document {
                version: self.version,
                pages: pages.clone(),
            })?
        };
        self.storage.save(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TreeColumn, TreeViewConfig};
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_file() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FilePrefsStorage::new(dir.path().join("prefs/display.json")));

        let prefs = DisplayPrefs::load(storage.clone(), 2).unwrap();
        prefs.set_collapsed("dashboard", "audits", true).unwrap();
        prefs
            .set_sort_state("dashboard", "audits", SortState { key: "title".into(), desc: true })
            .unwrap();

        let reloaded = DisplayPrefs::load(storage, 2).unwrap();
        assert!(reloaded.is_collapsed("dashboard", "audits"));
        assert!(!reloaded.is_collapsed("dashboard", "issues"));
        assert_eq!(
            reloaded.sort_state("dashboard", "audits"),
            Some(SortState { key: "title".into(), desc: true })
        );
    }

    #[test]
    fn outdated_versions_are_discarded() {
        let storage = Arc::new(MemoryPrefsStorage::with_document(
            r#"{"version": 1, "pages": {"dashboard": {"collapsed": {"audits": true}}}}"#,
        ));
        let prefs = DisplayPrefs::load(storage.clone(), 2).unwrap();
        assert!(!prefs.is_collapsed("dashboard", "audits"));

        let same = DisplayPrefs::load(storage, 1).unwrap();
        assert!(same.is_collapsed("dashboard", "audits"));
    }

    #[test]
    fn garbage_is_discarded() {
        let storage = Arc::new(MemoryPrefsStorage::with_document("not json"));
        let prefs = DisplayPrefs::load(storage, 1).unwrap();
        assert_eq!(prefs.page("anything"), PagePrefs::default());
    }

    #[test]
    fn tree_columns_follow_model_config() {
        let storage = Arc::new(MemoryPrefsStorage::new());
        let prefs = DisplayPrefs::load(storage.clone(), 1).unwrap();
        let control = ModelDescriptor::new("Control", "Control", "Controls").tree_view(TreeViewConfig {
            columns: vec![
                TreeColumn::new("title", "Title").mandatory(),
                TreeColumn::new("status", "Status"),
                TreeColumn::new("owner", "Owner"),
            ],
            default_columns: vec!["status".into()],
        });

        assert_eq!(prefs.tree_columns("program", &control), ["title", "status"]);
        prefs
            .set_tree_columns("program", "Control", vec!["owner".into(), "gone".into()])
            .unwrap();
        assert_eq!(prefs.tree_columns("program", &control), ["title", "owner"]);
        assert!(storage.document().unwrap().contains("\"version\":1"));
    }
}
