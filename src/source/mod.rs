//! The external media source the catalog mirrors.
//!
//! The engine only assumes a queryable source that supports bulk enumeration,
//! point lookups and point deletes, and that emits unscoped "something under
//! this locator changed" notifications. Two implementations ship with the
//! crate:
//! - `DirectorySource` - a directory tree watched with native notifications
//! - `MemorySource` - an in-process source with controllable contents

pub mod directory;
pub mod memory;
pub mod metadata;

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use crate::error::SourceResult;
use crate::models::{ContainerRow, MediaId, MediaRow};
use crate::runtime::Handle;

pub use directory::DirectorySource;
pub use memory::MemorySource;

/// Names a watchable resource of the external source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator(Cow<'static, str>);

impl Locator {
    /// All media items.
    pub const MEDIA: Locator = Locator(Cow::Borrowed("media://all"));

    /// The grouping containers.
    pub const CONTAINERS: Locator = Locator(Cow::Borrowed("media://containers"));

    pub fn new(locator: impl Into<String>) -> Self {
        Self(Cow::Owned(locator.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw "may have changed" signal, callable from any thread.
pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

/// A queryable media source.
pub trait MediaSource: Send + Sync + 'static {
    /// Opens a connection. Only the catalog worker uses it, one request at a time.
    fn connect(&self) -> SourceResult<Box<dyn SourceConnection>>;

    /// Subscribes to native change notifications for `locator`.
    ///
    /// Closing the returned handle tears the subscription down.
    fn watch(&self, locator: &Locator, notify: ChangeNotifier) -> SourceResult<Handle>;
}

/// A live connection to a [`MediaSource`].
pub trait SourceConnection: Send {
    /// Enumerates the identities of every media item.
    fn media_ids(&mut self) -> SourceResult<Vec<MediaId>>;

    /// Returns the rows for `ids`, or for every item when `ids` is `None`.
    ///
    /// Ids that no longer exist are silently skipped.
    fn query_media(&mut self, ids: Option<&[MediaId]>) -> SourceResult<Vec<MediaRow>>;

    /// Point lookup of one row.
    fn query_row(&mut self, id: MediaId) -> SourceResult<Option<MediaRow>> {
        Ok(self.query_media(Some(&[id]))?.into_iter().next())
    }

    /// Enumerates the grouping containers, one row per container id.
    fn containers(&mut self) -> SourceResult<Vec<ContainerRow>>;

    /// Deletes one item. Returns true if it existed.
    fn delete(&mut self, id: MediaId) -> SourceResult<bool>;

    /// Writes back the columns of one row. Returns true if it existed.
    fn update(&mut self, row: &MediaRow) -> SourceResult<bool>;
}
