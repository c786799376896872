use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

/// SQLite index of poster files warmed onto disk. Survives restarts so a
/// poster fetched once is served from disk until it goes stale.
#[derive(Debug, Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedPoster {
    pub id: i64,
    pub url: String,
    pub content_type: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub fetched_at: DateTime<Utc>,
    /// Bumped on every cache hit; eviction goes least recently used first.
    pub last_used_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

const POSTER_COLUMNS: &str =
    "id, url, content_type, file_path, size_bytes, fetched_at, last_used_at, checksum";

impl Store {
    pub fn open(opts: Options) -> Result<Self> {
        let path = match opts.path {
            Some(path) => path,
            None => default_path().context("storage: resolve default path")?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("storage: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("storage: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("storage: set WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("storage: set busy timeout")?;
        migrate(&conn)?;
        log::debug!("storage: poster index at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Records a freshly downloaded poster, replacing any row for the same
    /// url. Returns the row id.
    pub fn put(&self, poster: &CachedPoster) -> Result<i64> {
        if poster.url.trim().is_empty() {
            bail!("storage: poster url required");
        }
        let conn = self.conn.lock();
        let id = conn.query_row(
            "INSERT INTO poster_cache \
               (url, content_type, file_path, size_bytes, fetched_at, last_used_at, checksum) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(url) DO UPDATE SET \
               content_type = excluded.content_type, \
               file_path = excluded.file_path, \
               size_bytes = excluded.size_bytes, \
               fetched_at = excluded.fetched_at, \
               last_used_at = excluded.last_used_at, \
               checksum = excluded.checksum \
             RETURNING id",
            params![
                poster.url,
                poster.content_type,
                poster.file_path,
                poster.size_bytes,
                poster.fetched_at.timestamp(),
                poster.last_used_at.timestamp(),
                poster.checksum,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get(&self, url: &str) -> Result<Option<CachedPoster>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {POSTER_COLUMNS} FROM poster_cache WHERE url = ?1"),
            params![url],
            poster_from_row,
        )
        .optional()
        .context("storage: look up poster")
    }

    pub fn touch(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE poster_cache SET last_used_at = ?1 WHERE id = ?2",
            params![at.timestamp(), id],
        )?;
        Ok(())
    }

    pub fn total_size(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let total = conn.query_row(
            "SELECT COALESCE(SUM(size_bytes), 0) FROM poster_cache",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Posters fetched at or before `cutoff`.
    pub fn stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<CachedPoster>> {
        self.select(
            &format!(
                "SELECT {POSTER_COLUMNS} FROM poster_cache \
                 WHERE fetched_at <= ?1 ORDER BY fetched_at ASC LIMIT ?2"
            ),
            params![cutoff.timestamp(), limit as i64],
        )
    }

    pub fn least_recently_used(&self, limit: usize) -> Result<Vec<CachedPoster>> {
        self.select(
            &format!(
                "SELECT {POSTER_COLUMNS} FROM poster_cache \
                 ORDER BY last_used_at ASC, id ASC LIMIT ?1"
            ),
            params![limit as i64],
        )
    }

    pub fn remove(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let conn = self.conn.lock();
        conn.execute(
            &format!("DELETE FROM poster_cache WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(ids.iter()),
        )?;
        Ok(())
    }

    fn select(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<CachedPoster>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, poster_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn poster_from_row(row: &Row<'_>) -> rusqlite::Result<CachedPoster> {
    Ok(CachedPoster {
        id: row.get(0)?,
        url: row.get(1)?,
        content_type: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get(4)?,
        fetched_at: timestamp(row.get(5)?),
        last_used_at: timestamp(row.get(6)?),
        checksum: row.get(7)?,
    })
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version INTEGER PRIMARY KEY, \
           applied_at INTEGER NOT NULL)",
    )?;
    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    for (version, sql) in (1i64..).zip(MIGRATIONS) {
        if version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .with_context(|| format!("storage: apply migration {version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![version, Utc::now().timestamp()],
        )?;
        tx.commit()?;
    }
    Ok(())
}

const MIGRATIONS: &[&str] = &["
CREATE TABLE IF NOT EXISTS poster_cache (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  url TEXT NOT NULL UNIQUE,
  content_type TEXT NOT NULL,
  file_path TEXT NOT NULL,
  size_bytes INTEGER NOT NULL DEFAULT 0,
  fetched_at INTEGER NOT NULL,
  last_used_at INTEGER NOT NULL,
  checksum TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_poster_cache_fetched_at ON poster_cache(fetched_at);
CREATE INDEX IF NOT EXISTS idx_poster_cache_last_used_at ON poster_cache(last_used_at);
"];

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("artfeed").join("posters.db"))
}
