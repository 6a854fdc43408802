//! Media source backed by a directory tree.
//!
//! - Recursive discovery with walkdir, media detected by extension
//! - Identities are xxh3 hashes of the path, so they are stable across runs
//! - Containers are the parent directories of media files
//! - Native change notifications through `notify`

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;
use xxhash_rust::xxh3::xxh3_64;

use super::metadata::{file_stamp, read_dimensions};
use super::{ChangeNotifier, Locator, MediaSource, SourceConnection};
use crate::error::{SourceError, SourceResult};
use crate::models::{ContainerId, ContainerKind, ContainerRow, MediaId, MediaKind, MediaRow};
use crate::runtime::Handle;

/// Configuration for directory discovery.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Whether to scan directories recursively.
    pub recursive: bool,
    /// Maximum directory depth (0 = unlimited).
    pub max_depth: usize,
    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            max_depth: 0, // unlimited
            follow_symlinks: false,
        }
    }
}

/// Stable media identity for a file path.
pub fn media_id_for(path: &Path) -> MediaId {
    (xxh3_64(path.as_os_str().as_encoded_bytes()) >> 1) as MediaId
}

/// Stable container identity for a directory path.
pub fn container_id_for(dir: &Path) -> ContainerId {
    media_id_for(dir)
}

/// Classifies a directory into a container kind and in-kind priority.
fn classify(dir: &Path, root: &Path) -> (ContainerKind, i32) {
    if dir == root {
        return (ContainerKind::Other, 0);
    }
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match name.as_str() {
        "camera" | "dcim" => (ContainerKind::System, 0),
        "screenshots" => (ContainerKind::System, 1),
        "download" | "downloads" => (ContainerKind::Application, 0),
        _ => (ContainerKind::User, 0),
    }
}

/// A media source over the files below `root`.
pub struct DirectorySource {
    root: PathBuf,
    config: ScanConfig,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_config(root, ScanConfig::default())
    }

    pub fn with_config(root: impl Into<PathBuf>, config: ScanConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MediaSource for DirectorySource {
    fn connect(&self) -> SourceResult<Box<dyn SourceConnection>> {
        if !self.root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "{:?} is not a directory",
                self.root
            )));
        }
        debug!("Connected to directory source {:?}", self.root);
        Ok(Box::new(DirectoryConnection {
            root: self.root.clone(),
            config: self.config.clone(),
            index: HashMap::new(),
        }))
    }

    fn watch(&self, locator: &Locator, on_change: ChangeNotifier) -> SourceResult<Handle> {
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_)
                            | EventKind::Remove(_)
                            | EventKind::Modify(_)
                            | EventKind::Any
                    ) {
                        on_change();
                    }
                }
                Err(e) => warn!(error = ?e, "Directory watcher error"),
            })
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&self.root, mode)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        info!("Watching {:?} for {}", self.root, locator);
        Ok(Handle::open(format!("dir-watch:{}", locator), move || {
            drop(watcher);
        }))
    }
}

/// Information about a discovered media file.
#[derive(Debug, Clone)]
struct DiscoveredEntry {
    path: PathBuf,
    kind: MediaKind,
}

struct DirectoryConnection {
    root: PathBuf,
    config: ScanConfig,
    /// Id to path map from the most recent walk.
    index: HashMap<MediaId, DiscoveredEntry>,
}

impl DirectoryConnection {
    /// Walks the tree and refreshes the id index. Only paths are read here.
    fn discover(&mut self) -> SourceResult<()> {
        if !self.root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "{:?} disappeared",
                self.root
            )));
        }

        let mut walker = WalkDir::new(&self.root).follow_links(self.config.follow_symlinks);
        if !self.config.recursive {
            walker = walker.max_depth(1);
        } else if self.config.max_depth > 0 {
            walker = walker.max_depth(self.config.max_depth);
        }

        let mut index = HashMap::new();
        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            let Some(kind) = MediaKind::from_extension(ext) else {
                continue;
            };
            index.insert(
                media_id_for(path),
                DiscoveredEntry {
                    path: path.to_path_buf(),
                    kind,
                },
            );
        }

        trace!(count = index.len(), "Discovered media files");
        self.index = index;
        Ok(())
    }

    fn build_row(&self, id: MediaId, entry: &DiscoveredEntry) -> Option<MediaRow> {
        let metadata = match fs::metadata(&entry.path) {
            Ok(m) => m,
            Err(e) => {
                // Raced with a delete; the next sync will drop the id.
                trace!("Skipping {:?}: {}", entry.path, e);
                return None;
            }
        };
        let (mtime, size) = file_stamp(&metadata);
        let (width, height) = read_dimensions(&entry.path, entry.kind);
        let container_id = entry
            .path
            .parent()
            .map(container_id_for)
            .unwrap_or_default();

        Some(MediaRow {
            id,
            kind: entry.kind,
            path: entry.path.clone(),
            size,
            mtime,
            width,
            height,
            taken_at: mtime,
            location: None,
            container_id,
        })
    }
}

impl SourceConnection for DirectoryConnection {
    fn media_ids(&mut self) -> SourceResult<Vec<MediaId>> {
        self.discover()?;
        let mut ids: Vec<MediaId> = self.index.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn query_media(&mut self, ids: Option<&[MediaId]>) -> SourceResult<Vec<MediaRow>> {
        let needs_walk = match ids {
            None => true,
            Some(ids) => ids.iter().any(|id| !self.index.contains_key(id)),
        };
        if needs_walk {
            self.discover()?;
        }

        let rows = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.index.get(id).and_then(|e| self.build_row(*id, e)))
                .collect(),
            None => self
                .index
                .iter()
                .filter_map(|(id, e)| self.build_row(*id, e))
                .collect(),
        };
        Ok(rows)
    }

    fn containers(&mut self) -> SourceResult<Vec<ContainerRow>> {
        self.discover()?;

        let mut groups: BTreeMap<PathBuf, usize> = BTreeMap::new();
        for entry in self.index.values() {
            if let Some(parent) = entry.path.parent() {
                *groups.entry(parent.to_path_buf()).or_default() += 1;
            }
        }

        Ok(groups
            .into_iter()
            .map(|(dir, count)| {
                let (kind, priority) = classify(&dir, &self.root);
                let name = dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| dir.to_string_lossy().into_owned());
                ContainerRow {
                    id: container_id_for(&dir),
                    name,
                    path: Some(dir),
                    kind,
                    priority,
                    count,
                }
            })
            .collect())
    }

    fn delete(&mut self, id: MediaId) -> SourceResult<bool> {
        if !self.index.contains_key(&id) {
            self.discover()?;
        }
        let Some(entry) = self.index.remove(&id) else {
            return Ok(false);
        };
        match fs::remove_file(&entry.path) {
            Ok(()) => {
                info!("Deleted {:?}", entry.path);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&mut self, _row: &MediaRow) -> SourceResult<bool> {
        Err(SourceError::Unsupported("update"))
    }
}
