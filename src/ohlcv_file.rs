// =============================================================================
// Canonical bar file — packed fixed-size OHLCV records
// =============================================================================
//
// Record layout (24 bytes, little-endian):
//   i32 ts (seconds) | f32 open | f32 high | f32 low | f32 close | f32 volume
//
// The file holds strictly increasing timestamps at one-timeframe spacing.
// Timestamps in this module are **seconds**; callers on the live path divide
// their millisecond timestamps at the boundary.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::bar::Bar;

/// Size of one packed record in bytes.
pub const RECORD_SIZE: u64 = 24;

fn encode_record(bar: &Bar) -> [u8; RECORD_SIZE as usize] {
    let mut buf = [0u8; RECORD_SIZE as usize];
    buf[0..4].copy_from_slice(&(bar.ts as i32).to_le_bytes());
    buf[4..8].copy_from_slice(&(bar.open as f32).to_le_bytes());
    buf[8..12].copy_from_slice(&(bar.high as f32).to_le_bytes());
    buf[12..16].copy_from_slice(&(bar.low as f32).to_le_bytes());
    buf[16..20].copy_from_slice(&(bar.close as f32).to_le_bytes());
    buf[20..24].copy_from_slice(&(bar.volume as f32).to_le_bytes());
    buf
}

fn decode_record(buf: &[u8; RECORD_SIZE as usize]) -> Bar {
    let i32_at = |i: usize| i32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
    let f32_at = |i: usize| f32::from_le_bytes(buf[i..i + 4].try_into().unwrap());
    Bar {
        ts: i32_at(0) as i64,
        open: f32_at(4) as f64,
        high: f32_at(8) as f64,
        low: f32_at(12) as f64,
        close: f32_at(16) as f64,
        volume: f32_at(20) as f64,
    }
}

// =============================================================================
// OhlcvReader
// =============================================================================

/// Read-only view of a canonical bar file.
pub struct OhlcvReader {
    file: File,
    size: u64,
}

impl OhlcvReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open bar file {}", path.display()))?;
        let len = file.metadata()?.len();
        if len % RECORD_SIZE != 0 {
            bail!(
                "bar file {} has a partial record ({} bytes)",
                path.display(),
                len
            );
        }
        Ok(Self {
            file,
            size: len / RECORD_SIZE,
        })
    }

    /// Number of records in the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read the record at `index` (0-based).
    pub fn read(&mut self, index: u64) -> Result<Bar> {
        if index >= self.size {
            bail!("bar index {index} out of range (size {})", self.size);
        }
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.file.seek(SeekFrom::Start(index * RECORD_SIZE))?;
        self.file.read_exact(&mut buf)?;
        Ok(decode_record(&buf))
    }

    /// Open time of the first record, in seconds.
    pub fn start_ts(&mut self) -> Result<i64> {
        Ok(self.read(0)?.ts)
    }

    /// Open time of the last record, in seconds.
    pub fn end_ts(&mut self) -> Result<i64> {
        Ok(self.read(self.size.saturating_sub(1))?.ts)
    }

    /// Record spacing in seconds, derived from the first two records. Zero
    /// when the file holds fewer than two bars.
    pub fn interval(&mut self) -> Result<i64> {
        if self.size < 2 {
            return Ok(0);
        }
        Ok(self.read(1)?.ts - self.read(0)?.ts)
    }

    /// Read every record in file order.
    pub fn read_all(&mut self) -> Result<Vec<Bar>> {
        let mut out = Vec::with_capacity(self.size as usize);
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = [0u8; RECORD_SIZE as usize];
        for _ in 0..self.size {
            self.file.read_exact(&mut buf)?;
            out.push(decode_record(&buf));
        }
        Ok(out)
    }

    /// Read the last `limit` records in file order.
    pub fn tail(&mut self, limit: u64) -> Result<Vec<Bar>> {
        let start = self.size.saturating_sub(limit);
        let mut out = Vec::with_capacity((self.size - start) as usize);
        for idx in start..self.size {
            out.push(self.read(idx)?);
        }
        Ok(out)
    }
}

// =============================================================================
// OhlcvWriter
// =============================================================================

/// Writable handle over a canonical bar file, with a record cursor.
///
/// The cursor starts at the end of the file (append position); `seek_to_ts`
/// plus `truncate` plus `write` implements the rewrite-tail operation the
/// file updater relies on, through one handle.
pub struct OhlcvWriter {
    path: PathBuf,
    file: File,
    size: u64,
    cursor: u64,
}

impl OhlcvWriter {
    /// Open `path` read-write, creating it when `truncate` is unset; with
    /// `truncate` the file is emptied first (used by cache exports).
    pub fn open(path: impl AsRef<Path>, truncate: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)
            .with_context(|| format!("failed to open bar file {}", path.display()))?;
        let len = file.metadata()?.len();
        if len % RECORD_SIZE != 0 {
            bail!(
                "bar file {} has a partial record ({} bytes)",
                path.display(),
                len
            );
        }
        let size = len / RECORD_SIZE;
        Ok(Self {
            path,
            file,
            size,
            cursor: size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_at(&mut self, index: u64) -> Result<Bar> {
        let mut buf = [0u8; RECORD_SIZE as usize];
        self.file.seek(SeekFrom::Start(index * RECORD_SIZE))?;
        self.file.read_exact(&mut buf)?;
        Ok(decode_record(&buf))
    }

    /// Open time of the last record, in seconds; zero on an empty file.
    pub fn end_ts(&mut self) -> Result<i64> {
        if self.size == 0 {
            return Ok(0);
        }
        Ok(self.read_at(self.size - 1)?.ts)
    }

    /// Position the cursor at the slot where a record with open time `ts`
    /// (seconds) belongs. On an empty file the cursor goes to zero; a ts
    /// beyond the end parks the cursor at the append position.
    pub fn seek_to_ts(&mut self, ts: i64) -> Result<()> {
        if self.size == 0 {
            self.cursor = 0;
            return Ok(());
        }
        let start = self.read_at(0)?.ts;
        if ts <= start {
            self.cursor = 0;
            return Ok(());
        }
        let interval = if self.size >= 2 {
            self.read_at(1)?.ts - start
        } else {
            0
        };
        if interval > 0 {
            self.cursor = (((ts - start) / interval) as u64).min(self.size);
        } else {
            // Single-record file: the only slot after the start is the end.
            self.cursor = self.size;
        }
        Ok(())
    }

    /// Cut the file at the cursor; everything from the cursor on is dropped.
    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(self.cursor * RECORD_SIZE)?;
        self.size = self.cursor;
        Ok(())
    }

    /// Write `bar` (ts in seconds) at the cursor and advance. Extends the
    /// file when the cursor is at the end.
    pub fn write(&mut self, bar: &Bar) -> Result<()> {
        let buf = encode_record(bar);
        self.file.seek(SeekFrom::Start(self.cursor * RECORD_SIZE))?;
        self.file.write_all(&buf)?;
        self.cursor += 1;
        self.size = self.size.max(self.cursor);
        Ok(())
    }

    /// Replace the record whose open time equals `ts` in place, without
    /// moving the logical end of the file.
    pub fn overwrite_at_ts(&mut self, ts: i64, bar: &Bar) -> Result<()> {
        let saved = self.cursor;
        self.seek_to_ts(ts)?;
        if self.cursor >= self.size || self.read_at(self.cursor)?.ts != ts {
            self.cursor = saved;
            bail!("no record with ts {ts} in {}", self.path.display());
        }
        self.write(bar)?;
        self.cursor = saved;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
