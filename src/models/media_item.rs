use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

/// Stable identity of one media item in the external source.
pub type MediaId = i64;

/// Stable identity of a grouping container (folder, bucket).
pub type ContainerId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tiff" | "tif" | "heic" => {
                Some(Self::Image)
            }
            "webm" | "mp4" | "mkv" | "avi" | "mov" | "3gp" => Some(Self::Video),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// One row of the external media query.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRow {
    pub id: MediaId,
    pub kind: MediaKind,
    /// Local path or opaque locator of the item.
    pub path: PathBuf,
    pub size: i64,
    pub mtime: i64,
    pub width: u32,
    pub height: u32,
    /// Capture time; sources without one report the modification time.
    pub taken_at: i64,
    pub location: Option<GeoLocation>,
    pub container_id: ContainerId,
}

impl MediaRow {
    /// Create a row with just the fields needed for ordering
    pub fn new(id: MediaId, path: impl Into<PathBuf>, taken_at: i64) -> Self {
        Self {
            id,
            kind: MediaKind::Image,
            path: path.into(),
            size: 0,
            mtime: taken_at,
            width: 0,
            height: 0,
            taken_at,
            location: None,
            container_id: 0,
        }
    }

    pub fn with_container(mut self, container_id: ContainerId) -> Self {
        self.container_id = container_id;
        self
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

/// Auxiliary flags kept outside the primary source, keyed by media id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub favorite: bool,
    pub hidden: bool,
}

/// The live, identity-mapped object for one media item.
///
/// At most one `MediaRecord` exists per id while it is held by the catalog
/// table. Updates mutate the record in place so shared references stay valid;
/// the row and the flags are updated independently of each other.
#[derive(Debug)]
pub struct MediaRecord {
    id: MediaId,
    row: RwLock<MediaRow>,
    flags: RwLock<MediaFlags>,
}

impl MediaRecord {
    pub fn new(row: MediaRow, flags: MediaFlags) -> Arc<Self> {
        Arc::new(Self {
            id: row.id,
            row: RwLock::new(row),
            flags: RwLock::new(flags),
        })
    }

    pub fn id(&self) -> MediaId {
        self.id
    }

    /// Copy of the current row values.
    pub fn row(&self) -> MediaRow {
        self.row.read().clone()
    }

    pub fn flags(&self) -> MediaFlags {
        *self.flags.read()
    }

    pub fn kind(&self) -> MediaKind {
        self.row.read().kind
    }

    pub fn path(&self) -> PathBuf {
        self.row.read().path.clone()
    }

    pub fn size(&self) -> i64 {
        self.row.read().size
    }

    pub fn mtime(&self) -> i64 {
        self.row.read().mtime
    }

    pub fn taken_at(&self) -> i64 {
        self.row.read().taken_at
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let row = self.row.read();
        (row.width, row.height)
    }

    pub fn container_id(&self) -> ContainerId {
        self.row.read().container_id
    }

    pub fn location(&self) -> Option<GeoLocation> {
        self.row.read().location
    }

    pub fn is_favorite(&self) -> bool {
        self.flags.read().favorite
    }

    /// Display name used for name ordering (file name of the path).
    pub fn display_name(&self) -> String {
        let row = self.row.read();
        row.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| row.path.to_string_lossy().into_owned())
    }

    pub fn aspect_ratio(&self) -> f32 {
        let (width, height) = self.dimensions();
        if height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        }
    }

    /// Replaces the row values if any column changed. Returns true on change.
    pub fn apply_row(&self, row: &MediaRow) -> bool {
        debug_assert_eq!(row.id, self.id);
        let mut current = self.row.write();
        if *current == *row {
            return false;
        }
        *current = row.clone();
        true
    }

    /// Replaces the flags if they changed. Returns true on change.
    pub fn apply_flags(&self, flags: MediaFlags) -> bool {
        let mut current = self.flags.write();
        if *current == flags {
            return false;
        }
        *current = flags;
        true
    }
}
