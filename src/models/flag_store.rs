//! SQLite-backed store for auxiliary media flags.
//!
//! The primary media source knows nothing about favorites or hidden items, so
//! those live in a small local database keyed by media id:
//! - One row per media id with at least one flag set
//! - Clearing every flag deletes the row
//! - Reads go through an in-memory LRU cache

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::media_item::{MediaFlags, MediaId};

/// Number of flag lookups kept in memory.
const FLAG_CACHE_ENTRIES: usize = 4096;

/// Persistent key-value store for [`MediaFlags`].
///
/// The database is stored at `XDG_CONFIG_HOME/idxd/flags.sqlite` by default
/// and uses WAL mode.
pub struct FlagStore {
    conn: Mutex<Connection>,
    cache: Mutex<LruCache<MediaId, MediaFlags>>,
}

impl FlagStore {
    /// Opens or creates the database at the default XDG location.
    pub fn open_default() -> Result<Self> {
        let db_path = Self::default_db_path()?;
        Self::open(&db_path)
    }

    /// Returns the default database path based on XDG directories.
    pub fn default_db_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "idxd").context("Failed to determine project directories")?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        Ok(config_dir.join("flags.sqlite"))
    }

    /// Opens or creates the database at the specified path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open flag store at {:?}", path))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )
        .context("Failed to configure SQLite pragmas")?;

        let store = Self::from_connection(conn)?;
        info!("Opened flag store at {:?}", path);
        Ok(store)
    }

    /// Opens a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory flag store")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS media_flags (
                media_id INTEGER PRIMARY KEY NOT NULL,
                favorite INTEGER NOT NULL DEFAULT 0,
                hidden INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_media_flags_favorite
                ON media_flags(favorite) WHERE favorite = 1;
            ",
        )
        .context("Failed to create flag tables")?;
        debug!("Flag tables created/verified");

        let capacity = NonZeroUsize::new(FLAG_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Returns the flags for `id` (all clear if none are stored).
    pub fn get(&self, id: MediaId) -> Result<MediaFlags> {
        if let Some(flags) = self.cache.lock().get(&id) {
            return Ok(*flags);
        }

        let flags = self
            .conn
            .lock()
            .query_row(
                "SELECT favorite, hidden FROM media_flags WHERE media_id = ?1",
                params![id],
                |row| {
                    Ok(MediaFlags {
                        favorite: row.get::<_, i32>(0)? != 0,
                        hidden: row.get::<_, i32>(1)? != 0,
                    })
                },
            )
            .optional()
            .context("Failed to query media flags")?
            .unwrap_or_default();

        self.cache.lock().put(id, flags);
        Ok(flags)
    }

    /// Stores the flags for `id`. Clearing every flag removes the row.
    pub fn put(&self, id: MediaId, flags: MediaFlags) -> Result<()> {
        if flags == MediaFlags::default() {
            self.delete(id)?;
            self.cache.lock().put(id, flags);
            return Ok(());
        }

        self.conn
            .lock()
            .execute(
                "
            INSERT INTO media_flags (media_id, favorite, hidden, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(media_id) DO UPDATE SET
                favorite = excluded.favorite,
                hidden = excluded.hidden,
                updated_at = excluded.updated_at
            ",
                params![id, flags.favorite as i32, flags.hidden as i32, Self::now()],
            )
            .context("Failed to store media flags")?;

        self.cache.lock().put(id, flags);
        Ok(())
    }

    /// Deletes the flags for `id`. Returns true if a row existed.
    pub fn delete(&self, id: MediaId) -> Result<bool> {
        let rows = self
            .conn
            .lock()
            .execute("DELETE FROM media_flags WHERE media_id = ?1", params![id])
            .context("Failed to delete media flags")?;
        self.cache.lock().pop(&id);
        Ok(rows > 0)
    }

    /// Returns the ids of all favorite media, ascending.
    pub fn favorites(&self) -> Result<Vec<MediaId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT media_id FROM media_flags WHERE favorite = 1 ORDER BY media_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<MediaId>, _>>()
            .context("Failed to list favorites")?;
        Ok(ids)
    }

    /// Returns the number of media ids with stored flags.
    pub fn count(&self) -> Result<i64> {
        let count = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM media_flags", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Drops flags for ids no longer present in `live`.
    pub fn prune(&self, live: &std::collections::HashSet<MediaId>) -> Result<usize> {
        let stored: Vec<MediaId> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare("SELECT media_id FROM media_flags")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut pruned = 0;
        for id in stored.into_iter().filter(|id| !live.contains(id)) {
            match self.delete(id) {
                Ok(true) => pruned += 1,
                Ok(false) => {}
                Err(e) => warn!(id, error = ?e, "Failed to prune media flags"),
            }
        }

        if pruned > 0 {
            info!("Pruned flags for {} missing media items", pruned);
        }
        Ok(pruned)
    }

    /// Returns the current Unix timestamp.
    pub fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}
