//! Bounded pool of open streams

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::Result;
use crate::io::{FileSystem, OpenMode, Stream};

type HandleKey = (PathBuf, OpenMode);

struct Slot {
    stream: Arc<dyn Stream>,
    users: usize,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    open: HashMap<HandleKey, Slot>,
    tick: u64,
}

/// Keeps at most `capacity` streams open. A stream may be shared by many
/// concurrent users; when every slot is in use, [`HandlePool::acquire`]
/// blocks until a guard is dropped. Idle streams are closed least recently
/// used first.
pub struct HandlePool {
    fs: Arc<dyn FileSystem>,
    capacity: usize,
    inner: Mutex<Inner>,
    released: Condvar,
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlePool")
            .field("capacity", &self.capacity)
            .field("open", &self.open_count())
            .finish()
    }
}

impl HandlePool {
    /// Create a pool over `fs` with room for `capacity` streams (at least one)
    pub fn new(fs: Arc<dyn FileSystem>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            fs,
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            released: Condvar::new(),
        })
    }

    /// Borrow a stream for `path`, opening it if needed
    pub fn acquire(self: &Arc<Self>, path: &Path, mode: OpenMode) -> Result<StreamGuard> {
        let key = (path.to_path_buf(), mode);
        let mut inner = self.inner.lock();
        loop {
            inner.tick += 1;
            let tick = inner.tick;

            if let Some(slot) = inner.open.get_mut(&key) {
                slot.users += 1;
                slot.last_used = tick;
                return Ok(self.guard(key, Arc::clone(&slot.stream)));
            }

            if inner.open.len() >= self.capacity {
                let idle = inner
                    .open
                    .iter()
                    .filter(|(_, slot)| slot.users == 0)
                    .min_by_key(|(_, slot)| slot.last_used)
                    .map(|(k, _)| k.clone());
                match idle {
                    Some(victim) => {
                        inner.open.remove(&victim);
                        debug!(path = %victim.0.display(), "closed idle stream");
                    }
                    None => {
                        self.released.wait(&mut inner);
                        continue;
                    }
                }
            }

            let stream = self.fs.open(path, mode)?;
            debug!(path = %path.display(), ?mode, "opened stream");
            inner.open.insert(
                key.clone(),
                Slot {
                    stream: Arc::clone(&stream),
                    users: 1,
                    last_used: tick,
                },
            );
            return Ok(self.guard(key, stream));
        }
    }

    fn guard(self: &Arc<Self>, key: HandleKey, stream: Arc<dyn Stream>) -> StreamGuard {
        StreamGuard {
            pool: Arc::clone(self),
            key,
            stream,
        }
    }

    fn release(&self, key: &HandleKey) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.open.get_mut(key) {
            slot.users = slot.users.saturating_sub(1);
        }
        self.released.notify_one();
    }

    /// Close every stream of `path`, e.g. before the file is deleted.
    /// Streams still borrowed stay valid for their current users.
    pub fn close(&self, path: &Path) {
        let mut inner = self.inner.lock();
        inner.open.retain(|(p, _), _| p != path);
        self.released.notify_all();
    }

    /// Flush every open write-mode stream
    pub fn flush_all(&self) -> Result<()> {
        let streams: Vec<Arc<dyn Stream>> = self
            .inner
            .lock()
            .open
            .iter()
            .filter(|((_, mode), _)| *mode == OpenMode::Write)
            .map(|(_, slot)| Arc::clone(&slot.stream))
            .collect();
        for stream in streams {
            stream.flush()?;
        }
        Ok(())
    }

    /// Number of streams currently open
    pub fn open_count(&self) -> usize {
        self.inner.lock().open.len()
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Borrowed stream; returns its slot to the pool on drop
pub struct StreamGuard {
    pool: Arc<HandlePool>,
    key: HandleKey,
    stream: Arc<dyn Stream>,
}

impl Deref for StreamGuard {
    type Target = dyn Stream;

    fn deref(&self) -> &Self::Target {
        self.stream.as_ref()
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.pool.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::io::MemoryFileSystem;

    fn pool(capacity: usize) -> (Arc<MemoryFileSystem>, Arc<HandlePool>) {
        let fs = Arc::new(MemoryFileSystem::new());
        let pool = HandlePool::new(fs.clone(), capacity);
        (fs, pool)
    }

    #[test]
    fn test_shared_stream_and_idle_close() {
        let (_fs, pool) = pool(2);
        let a1 = pool.acquire(Path::new("/a"), OpenMode::Write).unwrap();
        let a2 = pool.acquire(Path::new("/a"), OpenMode::Write).unwrap();
        a1.write(0, b"x").unwrap();
        assert_eq!(a2.size().unwrap(), 1);
        assert_eq!(pool.open_count(), 1);
        drop((a1, a2));

        let _b = pool.acquire(Path::new("/b"), OpenMode::Write).unwrap();
        let _c = pool.acquire(Path::new("/c"), OpenMode::Write).unwrap();
        // "/a" was idle and got closed to make room
        assert_eq!(pool.open_count(), 2);
    }

    #[test]
    fn test_exhausted_pool_blocks() {
        let (_fs, pool) = pool(1);
        let held = pool.acquire(Path::new("/a"), OpenMode::Write).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _g = pool.acquire(Path::new("/b"), OpenMode::Write).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_open_error_propagates() {
        let (_fs, pool) = pool(1);
        assert!(pool.acquire(Path::new("/missing"), OpenMode::Read).is_err());
        assert_eq!(pool.open_count(), 0);
    }
}
