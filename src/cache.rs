// =============================================================================
// Persistent bar cache — sqlite-backed, keyed by (symbol key, ts)
// =============================================================================
//
// The cache is the durable source of truth for historical bars: the canonical
// file is regenerated from it, never the other way around (imports only flow
// file -> cache for provider downloads). All timestamps are seconds.
//
// Thread safety: one connection behind a parking_lot::Mutex; every batch
// operation runs inside a single transaction.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::bar::Bar;
use crate::ohlcv_file::{OhlcvReader, OhlcvWriter};
use crate::paths::SymbolKey;

/// Rows per transaction when streaming a file into the cache.
pub const IMPORT_BATCH_SIZE: usize = 2000;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS bars (
    provider  TEXT NOT NULL,
    exchange  TEXT NOT NULL,
    symbol    TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts        INTEGER NOT NULL,
    open      REAL NOT NULL,
    high      REAL NOT NULL,
    low       REAL NOT NULL,
    close     REAL NOT NULL,
    volume    REAL NOT NULL,
    PRIMARY KEY (provider, exchange, symbol, timeframe, ts)
)
"#;

/// Crash-safe bar store shared by the data-service loops.
pub struct BarCache {
    conn: Mutex<Connection>,
}

impl BarCache {
    /// Open (and create, if absent) the cache at `path`. Idempotent.
    pub fn init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open bar cache {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(SCHEMA_SQL, [])
            .context("failed to create bars table")?;

        info!(path = %path.display(), "bar cache initialised");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory cache for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(SCHEMA_SQL, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a batch of bars (ts in seconds) atomically.
    pub fn upsert_batch(&self, key: &SymbolKey, bars: &[Bar]) -> Result<()> {
        if bars.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO bars (provider, exchange, symbol, timeframe, ts, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT (provider, exchange, symbol, timeframe, ts)
                DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume
                "#,
            )?;
            for bar in bars {
                stmt.execute(params![
                    key.provider,
                    key.exchange,
                    key.symbol,
                    key.timeframe_str(),
                    bar.ts,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = bars.len(), "bars upserted into cache");
        Ok(())
    }

    /// True when the partition holds at least one bar.
    pub fn has_any(&self, key: &SymbolKey) -> Result<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM bars
             WHERE provider = ?1 AND exchange = ?2 AND symbol = ?3 AND timeframe = ?4
             LIMIT 1",
        )?;
        let found = stmt
            .query_row(
                params![key.provider, key.exchange, key.symbol, key.timeframe_str()],
                |_| Ok(()),
            )
            .map(|_| true);
        match found {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ts_extreme(&self, key: &SymbolKey, func: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {func}(ts) FROM bars
             WHERE provider = ?1 AND exchange = ?2 AND symbol = ?3 AND timeframe = ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let ts: Option<i64> = stmt.query_row(
            params![key.provider, key.exchange, key.symbol, key.timeframe_str()],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    /// Oldest bar open time (seconds) in the partition.
    pub fn min_ts(&self, key: &SymbolKey) -> Result<Option<i64>> {
        self.ts_extreme(key, "MIN")
    }

    /// Newest bar open time (seconds) in the partition.
    pub fn max_ts(&self, key: &SymbolKey) -> Result<Option<i64>> {
        self.ts_extreme(key, "MAX")
    }

    /// Range scan ordered by ts ascending, optionally bounded below.
    pub fn scan(&self, key: &SymbolKey, since: Option<i64>) -> Result<Vec<Bar>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT ts, open, high, low, close, volume FROM bars
             WHERE provider = ?1 AND exchange = ?2 AND symbol = ?3 AND timeframe = ?4
               AND ts >= ?5
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(
            params![
                key.provider,
                key.exchange,
                key.symbol,
                key.timeframe_str(),
                since.unwrap_or(i64::MIN),
            ],
            |row| {
                Ok(Bar {
                    ts: row.get(0)?,
                    open: row.get(1)?,
                    high: row.get(2)?,
                    low: row.get(3)?,
                    close: row.get(4)?,
                    volume: row.get(5)?,
                })
            },
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Stream a canonical bar file into the cache in batches.
    pub fn import_from_file(&self, key: &SymbolKey, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let mut reader = OhlcvReader::open(path)?;
        let size = reader.size();
        let mut batch = Vec::with_capacity(IMPORT_BATCH_SIZE);
        for idx in 0..size {
            batch.push(reader.read(idx)?);
            if batch.len() >= IMPORT_BATCH_SIZE {
                self.upsert_batch(key, &batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.upsert_batch(key, &batch)?;
        }
        info!(path = %path.display(), bars = size, "file imported into cache");
        Ok(())
    }

    /// Export the partition to `path` as a canonical bar file (truncating,
    /// ts ascending). With `since`, only bars with ts >= since are written.
    pub fn export_to_file(
        &self,
        key: &SymbolKey,
        path: impl AsRef<Path>,
        since: Option<i64>,
    ) -> Result<u64> {
        let path = path.as_ref();
        let bars = self.scan(key, since)?;
        let mut writer = OhlcvWriter::open(path, true)?;
        for bar in &bars {
            writer.write(bar)?;
        }
        writer.flush()?;
        info!(path = %path.display(), bars = bars.len(), "cache exported to file");
        Ok(bars.len() as u64)
    }

    /// Download a time range into the cache: `download` writes a canonical
    /// bar file into a temporary staging directory, which is then imported.
    /// The staging area is removed either way.
    pub fn download_range_into_cache<F>(&self, key: &SymbolKey, download: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let staging = tempfile::tempdir().context("failed to create staging dir")?;
        let staged = staging.path().join("range.ohlcv");
        download(&staged).context("range download failed")?;
        self.import_from_file(key, &staged)
    }
}
