//! Write-Ahead Log for durability and crash recovery.
//!
//! Every mutation is appended here before it is applied to the active
//! MemStore, and the log is replayed on startup to rebuild whatever had not
//! yet reached a segment.
//!
//! # Record Format
//!
//! ```text
//! +---------+--------------+------------+-------+--------------+-------+
//! | op (u8) | timestamp    | key_len    | key   | value_len    | value |
//! |  1=put  | (i64 LE)     | (u32 LE)   |       | (u32 LE)     |       |
//! |  2=del  |              |            |       |              |       |
//! +---------+--------------+------------+-------+--------------+-------+
//! ```
//!
//! Delete records carry an empty value. All integers are little-endian.
//!
//! # Durability: group commit
//!
//! `append` only writes into a 256KB in-process buffer. Two mechanisms move
//! bytes toward stable storage:
//!
//! - the background WAL syncer calls [`Wal::sync`] on a timer (default
//!   100ms), which flushes the buffer and forces the OS to commit;
//! - `append` itself flushes the buffer (without an OS sync) once it comes
//!   within 4KB of capacity, so a burst of writes cannot overflow it.
//!
//! This amortizes syscall cost across many writes at the price of losing up
//! to one sync interval of acknowledged writes on an abrupt power failure.

use crate::error::Result;
use crate::memstore::Record;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const OP_PUT: u8 = 1;
pub const OP_DELETE: u8 = 2;

/// WAL file name within the data directory.
pub const WAL_FILE: &str = "wal.log";

const BUFFER_SIZE: usize = 256 * 1024;
const FLUSH_SLACK: usize = 4 * 1024;

struct Inner {
    file: File,
    writer: BufWriter<File>,
}

/// Append-only durable log of mutations. `append`, `sync`, `truncate` and
/// `size` mutually exclude via the internal lock.
pub struct Wal {
    inner: Mutex<Inner>,
    path: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    /// Opens (or creates) the log file in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let writer = BufWriter::with_capacity(BUFFER_SIZE, file.try_clone()?);

        Ok(Self {
            inner: Mutex::new(Inner { file, writer }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes a record into the buffered sink. Does not reach disk on its
    /// own; see the module docs for the group-commit policy.
    pub fn append(&self, record: &Record) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let writer = &mut inner.writer;

        let op = if record.tombstone { OP_DELETE } else { OP_PUT };
        writer.write_u8(op)?;
        writer.write_i64::<LittleEndian>(record.timestamp)?;
        writer.write_u32::<LittleEndian>(record.key.len() as u32)?;
        writer.write_all(&record.key)?;
        writer.write_u32::<LittleEndian>(record.value.len() as u32)?;
        writer.write_all(&record.value)?;

        // Flush (no OS sync) when the buffer is nearly full so the periodic
        // syncer stays the only place paying for fsync.
        if writer.buffer().len() >= BUFFER_SIZE - FLUSH_SLACK {
            writer.flush()?;
        }

        Ok(())
    }

    /// Flushes the buffer and forces the OS to commit to stable storage.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Discards all log contents, resetting the file to length zero. Called
    /// by the flush worker only once every frozen MemStore has been durably
    /// persisted to a segment.
    pub fn truncate(&self) -> Result<()> {
        let mut guard = self.inner.lock()?;
        let inner = &mut *guard;
        // Swap the writer out via into_parts: a plain drop would flush the
        // stale buffered bytes back into the file we are about to wipe.
        let replacement = BufWriter::with_capacity(BUFFER_SIZE, inner.file.try_clone()?);
        let old = std::mem::replace(&mut inner.writer, replacement);
        drop(old.into_parts());
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Current size of the log file on disk. Buffered bytes are not counted.
    pub fn size(&self) -> u64 {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return 0,
        };
        inner.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Iterates every well-formed record from the start of the log. A
    /// truncated trailing record is treated as end-of-log.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path)
    }

    /// Flushes and syncs any buffered records before shutdown.
    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

/// Streams records out of a WAL file through an independent read handle.
pub struct ReplayIterator {
    reader: BufReader<File>,
    done: bool,
}

impl ReplayIterator {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            done: false,
        })
    }

    fn read_record(&mut self) -> Result<Option<Record>> {
        // A clean EOF before the op byte is simply the end of the log.
        let op = match self.reader.read_u8() {
            Ok(op) => op,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if op != OP_PUT && op != OP_DELETE {
            tracing::warn!(op, "unknown op type in WAL, discarding rest of log");
            return Ok(None);
        }

        // Anything cut short past this point is a partially-written record:
        // discard it and everything after it.
        match Self::read_body(&mut self.reader, op) {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::warn!("truncated record at WAL tail, discarding");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read_body<R: Read>(reader: &mut R, op: u8) -> std::io::Result<Record> {
        let timestamp = reader.read_i64::<LittleEndian>()?;

        let key_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0u8; key_len];
        reader.read_exact(&mut key)?;

        let value_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut value = vec![0u8; value_len];
        reader.read_exact(&mut value)?;

        Ok(Record {
            key,
            value,
            timestamp,
            tombstone: op == OP_DELETE,
        })
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
