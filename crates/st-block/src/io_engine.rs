//! Pluggable metadata I/O engines.
//!
//! Defines the [`IoEngine`] trait used for every metadata access
//! (activity-log ring slots and bitmap pages):
//!
//! - **[`PreadPwriteEngine`]**: `pread`/`pwrite` against a file or block
//!   device holding the metadata area.
//! - **[`MemIoEngine`]**: a `Vec<u8>` image, used by tests, the harness and
//!   crash simulation (the image outlives the device that wrote it).
//!
//! # Design
//!
//! Callers build a batch of [`IoOp`] requests, submit them and receive one
//! [`IoCompletion`] per request, in order. Synchronous engines execute the
//! batch before returning; the bitmap uses one batch per `read`/`write`
//! call so all page I/O of that call is in flight together.

use st_error::{Result, StError};
use std::path::Path;
use std::sync::Arc;

/// A single I/O operation in a batch.
#[derive(Debug)]
pub enum IoOp {
    /// Read `buf.len()` bytes from `offset` into the provided buffer.
    Read {
        /// Byte offset on the metadata device.
        offset: u64,
        /// Buffer to read into.
        buf: Vec<u8>,
    },
    /// Write `data` at `offset`.
    Write {
        /// Byte offset on the metadata device.
        offset: u64,
        /// Data to write.
        data: Vec<u8>,
    },
    /// Flush to stable storage.
    Sync,
}

impl IoOp {
    /// Byte offset touched by this operation, if any.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Read { offset, .. } | Self::Write { offset, .. } => Some(*offset),
            Self::Sync => None,
        }
    }
}

/// Result of a completed I/O operation.
#[derive(Debug)]
pub enum IoCompletion {
    /// Read completed: returns the filled buffer.
    Read(Vec<u8>),
    /// Write completed.
    Write,
    /// Sync completed.
    Sync,
    /// Operation failed.
    Error(StError),
}

impl IoCompletion {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// I/O engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct IoEngineStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub batches: u64,
    /// Operations that completed with an error.
    pub errors: u64,
}

/// Pluggable metadata I/O interface.
pub trait IoEngine: Send + Sync {
    /// Submit a batch of I/O operations and return their completions.
    ///
    /// Completions are returned in the same order as the input operations.
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion>;

    /// Engine name for diagnostics.
    fn name(&self) -> &'static str;

    /// Current statistics.
    fn stats(&self) -> IoEngineStats;

    /// Size of the metadata device in bytes.
    fn len_bytes(&self) -> u64;
}

impl<E: IoEngine + ?Sized> IoEngine for Arc<E> {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        (**self).submit_batch(ops)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn stats(&self) -> IoEngineStats {
        (**self).stats()
    }

    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }
}

// ── pread/pwrite engine ────────────────────────────────────────────────────

/// `pread`/`pwrite` engine over a file or block device.
pub struct PreadPwriteEngine {
    file: Arc<std::fs::File>,
    len: u64,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl PreadPwriteEngine {
    /// Open an existing metadata file read-write.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(StError::Io)?;
        Self::from_file(Arc::new(file))
    }

    /// Create (or truncate) a metadata file of `len` bytes.
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StError::Io)?;
        file.set_len(len).map_err(StError::Io)?;
        Self::from_file(Arc::new(file))
    }

    /// Wrap an already open file.
    pub fn from_file(file: Arc<std::fs::File>) -> Result<Self> {
        let len = file.metadata().map_err(StError::Io)?.len();
        Ok(Self {
            file,
            len,
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        })
    }

    fn bounds(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| StError::Format(format!("I/O range overflow at offset {offset}")))?;
        if end > self.len {
            return Err(StError::Format(format!(
                "I/O past end of metadata device: offset={offset} len={len} device_len={}",
                self.len
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PreadPwriteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreadPwriteEngine")
            .field("len", &self.len)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl IoEngine for PreadPwriteEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        use std::os::unix::fs::FileExt;

        self.stats.lock().batches += 1;

        ops.into_iter()
            .map(|op| {
                let completion = match op {
                    IoOp::Read { offset, mut buf } => match self.bounds(offset, buf.len()) {
                        Err(e) => IoCompletion::Error(e),
                        Ok(()) => match self.file.read_exact_at(&mut buf, offset) {
                            Ok(()) => {
                                let mut s = self.stats.lock();
                                s.reads += 1;
                                s.bytes_read += buf.len() as u64;
                                drop(s);
                                IoCompletion::Read(buf)
                            }
                            Err(e) => IoCompletion::Error(StError::Io(e)),
                        },
                    },
                    IoOp::Write { offset, data } => match self.bounds(offset, data.len()) {
                        Err(e) => IoCompletion::Error(e),
                        Ok(()) => match self.file.write_all_at(&data, offset) {
                            Ok(()) => {
                                let mut s = self.stats.lock();
                                s.writes += 1;
                                s.bytes_written += data.len() as u64;
                                drop(s);
                                IoCompletion::Write
                            }
                            Err(e) => IoCompletion::Error(StError::Io(e)),
                        },
                    },
                    IoOp::Sync => {
                        self.stats.lock().syncs += 1;
                        match self.file.sync_data() {
                            Ok(()) => IoCompletion::Sync,
                            Err(e) => IoCompletion::Error(StError::Io(e)),
                        }
                    }
                };
                if completion.is_error() {
                    self.stats.lock().errors += 1;
                }
                completion
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "pread/pwrite"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }
}

// ── In-memory engine ───────────────────────────────────────────────────────

/// In-memory metadata image.
///
/// [`MemIoEngine::snapshot`] captures the image as it would be found after
/// a crash; [`MemIoEngine::from_bytes`] brings such an image back.
pub struct MemIoEngine {
    data: parking_lot::Mutex<Vec<u8>>,
    stats: parking_lot::Mutex<IoEngineStats>,
}

impl MemIoEngine {
    /// Create a zero-filled image of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::from_bytes(vec![0_u8; size])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            data: parking_lot::Mutex::new(bytes),
            stats: parking_lot::Mutex::new(IoEngineStats::default()),
        }
    }

    /// Copy of the current image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Overwrite bytes directly, bypassing statistics (used to stage
    /// torn or corrupted records).
    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = (offset + bytes.len()).min(data.len());
        if offset < end {
            data[offset..end].copy_from_slice(&bytes[..end - offset]);
        }
    }
}

impl std::fmt::Debug for MemIoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemIoEngine")
            .field("size", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl IoEngine for MemIoEngine {
    fn submit_batch(&self, ops: Vec<IoOp>) -> Vec<IoCompletion> {
        let mut data = self.data.lock();
        let mut stats = self.stats.lock();
        stats.batches += 1;

        let range = |offset: u64, len: usize, size: usize| -> Option<(usize, usize)> {
            let start = usize::try_from(offset).ok()?;
            let end = start.checked_add(len)?;
            (end <= size).then_some((start, end))
        };

        ops.into_iter()
            .map(|op| match op {
                IoOp::Read { offset, mut buf } => {
                    let Some((start, end)) = range(offset, buf.len(), data.len()) else {
                        stats.errors += 1;
                        return IoCompletion::Error(StError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "read past end of memory",
                        )));
                    };
                    buf.copy_from_slice(&data[start..end]);
                    stats.reads += 1;
                    stats.bytes_read += buf.len() as u64;
                    IoCompletion::Read(buf)
                }
                IoOp::Write { offset, data: wd } => {
                    let Some((start, end)) = range(offset, wd.len(), data.len()) else {
                        stats.errors += 1;
                        return IoCompletion::Error(StError::Io(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "write past end of memory",
                        )));
                    };
                    data[start..end].copy_from_slice(&wd);
                    stats.writes += 1;
                    stats.bytes_written += wd.len() as u64;
                    IoCompletion::Write
                }
                IoOp::Sync => {
                    stats.syncs += 1;
                    IoCompletion::Sync
                }
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn stats(&self) -> IoEngineStats {
        self.stats.lock().clone()
    }

    fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
