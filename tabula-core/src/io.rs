//! Byte-stream collaborator: the minimal file contract the block manager
//! reads and writes through

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;

/// How a stream is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// Read-only access to an existing file
    Read,
    /// Read-write access, creating the file when missing
    Write,
}

/// An open file. Offsets are absolute, so a stream can be shared between
/// threads without a cursor.
pub trait Stream: Send + Sync + Debug {
    /// Read exactly `len` bytes starting at `offset`
    fn read(&self, offset: u64, len: usize) -> Result<Bytes>;

    /// Write `data` at `offset`, extending the file as needed
    fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size in bytes
    fn size(&self) -> Result<u64>;

    /// Push buffered writes to the backing medium
    fn flush(&self) -> Result<()>;
}

/// A place streams come from
pub trait FileSystem: Send + Sync + Debug {
    /// Open a stream
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn Stream>>;

    /// Delete a file
    fn remove(&self, path: &Path) -> Result<()>;

    /// Check if a file exists
    fn exists(&self, path: &Path) -> bool;

    /// Create a directory and its parents
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Files directly inside `dir`, sorted
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;

    /// Copy a whole file
    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let src = self.open(from, OpenMode::Read)?;
        let len = src.size()?;
        let data = src.read(0, len as usize)?;
        let dst = self.open(to, OpenMode::Write)?;
        dst.write(0, &data)?;
        dst.flush()?;
        Ok(len)
    }

    /// Move a file, replacing `to` if it exists
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.copy(from, to)?;
        self.remove(from)
    }
}

fn unexpected_eof(offset: u64, len: usize, size: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!(
            "read of {} bytes at offset {} past end of stream ({} bytes)",
            len, offset, size
        ),
    )
}

/// Local disk
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn Stream>> {
        match mode {
            OpenMode::Read => Ok(Arc::new(MappedStream::open(path)?)),
            OpenMode::Write => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?;
                Ok(Arc::new(FileStream {
                    file: Mutex::new(file),
                }))
            }
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        Ok(fs::remove_file(path)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        Ok(fs::create_dir_all(path)?)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        Ok(fs::copy(from, to)?)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }
}

/// Read-only memory-mapped file
#[derive(Debug)]
struct MappedStream {
    /// `None` for empty files, which cannot be mapped
    mmap: Option<Mmap>,
}

impl MappedStream {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(Self { mmap: None });
        }
        // SAFETY: segment files are sealed before they are opened for
        // reading and are never modified afterwards.
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap: Some(mmap) })
    }

    fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl Stream for MappedStream {
    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let data = self.as_slice();
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&end| end <= data.len());
        match end {
            Some(end) => Ok(Bytes::copy_from_slice(&data[start..end])),
            None => Err(unexpected_eof(offset, len, data.len() as u64).into()),
        }
    }

    fn write(&self, _offset: u64, _data: &[u8]) -> Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "stream opened read-only").into())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.as_slice().len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Positioned read-write file
#[derive(Debug)]
struct FileStream {
    file: Mutex<File>,
}

impl Stream for FileStream {
    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut file = self.file.lock();
        let size = file.metadata()?.len();
        if offset + len as u64 > size {
            return Err(unexpected_eof(offset, len, size).into());
        }
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

type SharedBuffer = Arc<RwLock<Vec<u8>>>;

/// In-process filesystem. Paths are flat keys; directories exist implicitly.
///
/// Reads and writes can be made to fail on demand to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: RwLock<BTreeMap<PathBuf, SharedBuffer>>,
    faults: Arc<Faults>,
}

#[derive(Debug)]
struct Faults {
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    /// Writes still allowed before they start failing
    write_budget: AtomicUsize,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            write_budget: AtomicUsize::new(usize::MAX),
        }
    }
}

impl Faults {
    fn write_allowed(&self) -> bool {
        !self.fail_writes.load(Ordering::SeqCst)
            && self
                .write_budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                    usize::MAX => Some(usize::MAX),
                    0 => None,
                    n => Some(n - 1),
                })
                .is_ok()
    }
}

impl MemoryFileSystem {
    /// Create an empty filesystem
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail (or stop failing)
    pub fn fail_reads(&self, fail: bool) {
        self.faults.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail (or stop failing)
    pub fn fail_writes(&self, fail: bool) {
        self.faults.fail_writes.store(fail, Ordering::SeqCst);
        self.faults.write_budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Let `n` more writes succeed, then fail every write after them
    pub fn fail_writes_after(&self, n: usize) {
        self.faults.write_budget.store(n, Ordering::SeqCst);
    }

    /// Number of files currently stored
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Flip one byte of a stored file
    pub fn corrupt_byte(&self, path: &Path, offset: usize) -> Result<()> {
        let files = self.files.read();
        let buffer = files.get(path).ok_or_else(|| not_found(path))?;
        let mut data = buffer.write();
        match data.get_mut(offset) {
            Some(byte) => {
                *byte ^= 0xFF;
                Ok(())
            }
            None => Err(unexpected_eof(offset as u64, 1, data.len() as u64).into()),
        }
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Arc<dyn Stream>> {
        let buffer = match mode {
            OpenMode::Read => self
                .files
                .read()
                .get(path)
                .cloned()
                .ok_or_else(|| not_found(path))?,
            OpenMode::Write => Arc::clone(
                self.files
                    .write()
                    .entry(path.to_path_buf())
                    .or_default(),
            ),
        };
        Ok(Arc::new(MemoryStream {
            buffer,
            faults: Arc::clone(&self.faults),
            writable: mode == OpenMode::Write,
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match self.files.write().remove(path) {
            Some(_) => Ok(()),
            None => Err(not_found(path).into()),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn create_dir_all(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.write();
        let buffer = files.remove(from).ok_or_else(|| not_found(from))?;
        files.insert(to.to_path_buf(), buffer);
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryStream {
    buffer: SharedBuffer,
    faults: Arc<Faults>,
    writable: bool,
}

impl Stream for MemoryStream {
    fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if self.faults.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure").into());
        }
        let data = self.buffer.read();
        let start = offset as usize;
        match start.checked_add(len).filter(|&end| end <= data.len()) {
            Some(end) => Ok(Bytes::copy_from_slice(&data[start..end])),
            None => Err(unexpected_eof(offset, len, data.len() as u64).into()),
        }
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(
                io::Error::new(io::ErrorKind::PermissionDenied, "stream opened read-only").into(),
            );
        }
        if !self.faults.write_allowed() {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure").into());
        }
        let mut data = self.buffer.write();
        let start = offset as usize;
        let end = start + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.buffer.read().len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
