//! `ShmCache`: the peer side of [`crate::shm_pool::ShmPool`] — opens foreign
//! arenas lazily by name, keeps them mapped for reuse, and notifies a
//! callback when the owning process detaches (§4.5).
//!
//! The original detects this via System V `shmctl(IPC_STAT)`'s attach
//! count; POSIX `shm_open` has no equivalent, so this port polls for the
//! backing `/dev/shm` object's continued existence on a background thread
//! and fires the callback on the poll that first finds it gone.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::ShmResult;
use crate::shm_pool::ShmPool;

const PEER_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub type PeerClosedCallback = Box<dyn Fn(&str) + Send + Sync>;

struct CachedArena {
    pool: Arc<ShmPool>,
}

struct Inner {
    read_only: bool,
    arenas: Mutex<HashMap<String, CachedArena>>,
    peer_closed_cb: Mutex<Option<PeerClosedCallback>>,
}

/// Lazily-populated table of mapped foreign arenas. One `ShmCache` backs
/// either [`crate::server::RsaShmServer`] (mapping each client's request
/// arena) or [`crate::client::RsaShmClientManager`] (mapping a server's
/// response arena, for a transport where the server allocates its own
/// reply buffer rather than writing back into the client's pool).
pub struct ShmCache {
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl ShmCache {
    pub fn create(read_only: bool) -> Self {
        ShmCache {
            inner: Arc::new(Inner {
                read_only,
                arenas: Mutex::new(HashMap::new()),
                peer_closed_cb: Mutex::new(None),
            }),
            watcher: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_peer_closed_cb(&self, cb: PeerClosedCallback) {
        *self.inner.peer_closed_cb.lock() = Some(cb);
        self.ensure_watcher_running();
    }

    fn ensure_watcher_running(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || Self::watch(inner, running));
        *self.watcher.lock() = Some(handle);
    }

    fn watch(inner: Arc<Inner>, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(PEER_POLL_INTERVAL);
            let gone: Vec<String> = {
                let arenas = inner.arenas.lock();
                arenas
                    .keys()
                    .filter(|name| !arena_exists(name))
                    .cloned()
                    .collect()
            };
            if gone.is_empty() {
                continue;
            }
            let mut arenas = inner.arenas.lock();
            for name in &gone {
                arenas.remove(name);
            }
            drop(arenas);
            if let Some(cb) = inner.peer_closed_cb.lock().as_ref() {
                for name in &gone {
                    cb(name);
                }
            }
        }
    }

    /// Maps `name` if not already cached, returning a pointer into the
    /// arena at `offset`.
    pub fn get_memory_ptr(&self, name: &str, offset: isize) -> ShmResult<*mut u8> {
        let pool = self.pool_for(name)?;
        Ok(pool.ptr_at_offset(offset))
    }

    pub fn pool_for(&self, name: &str) -> ShmResult<Arc<ShmPool>> {
        if let Some(cached) = self.inner.arenas.lock().get(name) {
            return Ok(cached.pool.clone());
        }
        let pool = Arc::new(ShmPool::attach(name, self.inner.read_only)?);
        self.inner
            .arenas
            .lock()
            .insert(name.to_string(), CachedArena { pool: pool.clone() });
        self.ensure_watcher_running();
        Ok(pool)
    }

    pub fn release(&self, name: &str) {
        self.inner.arenas.lock().remove(name);
    }

    /// Weak handle for tests/diagnostics: does the cache still hold the
    /// named arena mapped.
    pub fn is_cached(&self, name: &str) -> bool {
        self.inner.arenas.lock().contains_key(name)
    }
}

impl Drop for ShmCache {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.watcher.lock().take() {
            let _ = handle.join();
        }
    }
}

fn arena_exists(name: &str) -> bool {
    let Ok(cname) = CString::new(name) else {
        return false;
    };
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, 0) };
    if fd >= 0 {
        unsafe { libc::close(fd) };
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_a_newly_attached_arena() {
        let owner = ShmPool::create(crate::shm_pool::MIN_POOL_SIZE).unwrap();
        let cache = ShmCache::create(false);
        assert!(!cache.is_cached(owner.name()));
        cache.pool_for(owner.name()).unwrap();
        assert!(cache.is_cached(owner.name()));
        // second call reuses the cached mapping rather than re-attaching
        cache.pool_for(owner.name()).unwrap();
    }

    #[test]
    fn fires_peer_closed_once_the_arena_is_unlinked() {
        let owner = ShmPool::create(crate::shm_pool::MIN_POOL_SIZE).unwrap();
        let name = owner.name().to_string();
        let cache = ShmCache::create(false);
        cache.pool_for(&name).unwrap();

        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen2 = seen.clone();
        cache.set_peer_closed_cb(Box::new(move |closed| {
            if closed == name {
                seen2.store(true, Ordering::SeqCst);
            }
        }));

        drop(owner); // unlinks the backing /dev/shm object
        for _ in 0..20 {
            if seen.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(seen.load(Ordering::SeqCst), "peer-closed callback should fire");
    }
}
