//! `ShmPool`: one `shm_open`-backed arena per process, with a bump-or-freelist
//! allocator guarded by a `PTHREAD_PROCESS_SHARED` mutex so any process that
//! maps the same region (see [`crate::shm_cache::ShmCache`]) can allocate and
//! free blocks safely (§4.5).
//!
//! The arena is addressed by name rather than the System V `shmget` integer
//! id the original uses — this port is built on POSIX `shm_open`/`mmap`,
//! whose natural handle is the name passed to `shm_open`. Everywhere the
//! spec says "shmId", this crate threads that name through instead.

use std::ffi::CString;
use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ShmError, ShmResult};

pub const MIN_POOL_SIZE: usize = 8192;
const ARENA_VERSION: u32 = 1;

static NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Header of an allocated or free block. Free blocks additionally store
/// `next` in the bytes immediately following (see [`FreeBlockTail`]); the
/// allocator never coalesces adjacent free blocks, trading a little
/// fragmentation for a header simple enough to reason about across
/// processes.
#[repr(C)]
struct BlockHeader {
    size: usize,
}

#[repr(C)]
struct FreeBlockTail {
    next: isize,
}

const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlockTail>();

/// Lives at offset 0 of the arena. `lock` guards every field below it and
/// the whole payload region; every process that maps the arena takes this
/// same lock before touching free-list or bump-pointer state.
#[repr(C)]
struct ControlBlock {
    version: u32,
    lock: libc::pthread_mutex_t,
    payload_size: usize,
    bump_offset: usize,
    free_list_head: isize,
}

const CONTROL_SIZE: usize = mem::size_of::<ControlBlock>();

fn init_process_shared_mutex(lock: *mut libc::pthread_mutex_t) -> io::Result<()> {
    unsafe {
        let mut attr: MaybeUninit<libc::pthread_mutexattr_t> = MaybeUninit::uninit();
        if libc::pthread_mutexattr_init(attr.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut attr = attr.assume_init();
        if libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED) != 0 {
            libc::pthread_mutexattr_destroy(&mut attr);
            return Err(io::Error::last_os_error());
        }
        // A crashed peer leaves this mutex locked forever on most platforms;
        // callers that need liveness guarantees pair this pool with a
        // deadline-based wait (see RsaShmClientManager), not a robust mutex,
        // since robust-mutex support is not uniformly available in libc.
        let rc = libc::pthread_mutex_init(lock, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
    }
    Ok(())
}

/// A contiguous shared-memory arena owned by this process and readable (and,
/// for a trusted peer such as [`crate::server::RsaShmServer`], writable) by
/// any other process that maps it by name through [`crate::shm_cache::ShmCache`].
pub struct ShmPool {
    name: String,
    fd: RawFd,
    base: *mut u8,
    size: usize,
    owns_unlink: bool,
}

unsafe impl Send for ShmPool {}
unsafe impl Sync for ShmPool {}

impl ShmPool {
    /// Creates a new arena of `size` bytes (clamped up to [`MIN_POOL_SIZE`])
    /// and initializes its control block.
    pub fn create(size: usize) -> ShmResult<Self> {
        let size = size.max(MIN_POOL_SIZE);
        let name = format!(
            "/rsa-shm-{}-{}",
            std::process::id(),
            NAME_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let pool = Self::open_and_map(&name, size, true)?;
        unsafe {
            let control = pool.base as *mut ControlBlock;
            init_process_shared_mutex(ptr::addr_of_mut!((*control).lock)).map_err(ShmError::from)?;
            (*control).version = ARENA_VERSION;
            (*control).payload_size = size - CONTROL_SIZE;
            (*control).bump_offset = 0;
            (*control).free_list_head = -1;
        }
        Ok(pool)
    }

    /// Maps an arena someone else already created and initialized, without
    /// touching its control block. Used by [`crate::shm_cache::ShmCache`] to
    /// let the server allocate and free directly inside a client's arena.
    /// The arena's size is recovered from the shared-memory object itself
    /// (`fstat`) rather than passed in — POSIX `shm_open` gives no other way
    /// for a peer to learn an arena's size ahead of mapping it.
    pub fn attach(name: &str, read_only: bool) -> ShmResult<Self> {
        Self::open_and_map(name, 0, !read_only).map(|mut p| {
            p.owns_unlink = false;
            p
        })
    }

    fn open_and_map(name: &str, size: usize, create: bool) -> ShmResult<Self> {
        let cname = CString::new(name).map_err(|_| {
            ShmError::AttachFailed(name.to_string(), io::Error::from(io::ErrorKind::InvalidInput))
        })?;
        let flags = if create {
            libc::O_CREAT | libc::O_RDWR
        } else {
            libc::O_RDWR
        };
        let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(ShmError::AttachFailed(name.to_string(), io::Error::last_os_error()));
        }
        if create && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::AttachFailed(name.to_string(), err));
        }
        let size = if create {
            size
        } else {
            let mut st: libc::stat = unsafe { mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(ShmError::AttachFailed(name.to_string(), err));
            }
            st.st_size as usize
        };
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::AttachFailed(name.to_string(), err));
        }
        Ok(ShmPool {
            name: name.to_string(),
            fd,
            base: base as *mut u8,
            size,
            owns_unlink: create,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn control(&self) -> *mut ControlBlock {
        self.base as *mut ControlBlock
    }

    fn payload_base(&self) -> *mut u8 {
        unsafe { self.base.add(CONTROL_SIZE) }
    }

    /// Allocates `requested` bytes from the arena, returning a pointer into
    /// the mapped region. `None`-equivalent failures surface as
    /// [`ShmError::PoolExhausted`] rather than a null pointer so callers
    /// can't forget to check.
    pub fn malloc(&self, requested: usize) -> ShmResult<*mut u8> {
        let block_size = requested.max(MIN_BLOCK_SIZE);
        let total = BLOCK_HEADER_SIZE + block_size;

        unsafe {
            let control = self.control();
            libc::pthread_mutex_lock(ptr::addr_of_mut!((*control).lock));
            let result = self.malloc_locked(control, total, block_size);
            libc::pthread_mutex_unlock(ptr::addr_of_mut!((*control).lock));
            result
        }
    }

    unsafe fn malloc_locked(
        &self,
        control: *mut ControlBlock,
        total: usize,
        block_size: usize,
    ) -> ShmResult<*mut u8> {
        let payload = self.payload_base();

        // First-fit scan of the free list.
        let mut prev: *mut isize = ptr::addr_of_mut!((*control).free_list_head);
        let mut cur = (*control).free_list_head;
        while cur >= 0 {
            let header = payload.add(cur as usize) as *mut BlockHeader;
            let size = (*header).size;
            if size >= block_size {
                let tail = payload.add(cur as usize + BLOCK_HEADER_SIZE) as *mut FreeBlockTail;
                *prev = (*tail).next;
                return Ok(payload.add(cur as usize + BLOCK_HEADER_SIZE));
            }
            let tail = payload.add(cur as usize + BLOCK_HEADER_SIZE) as *mut FreeBlockTail;
            prev = &mut (*tail).next;
            cur = (*tail).next;
        }

        // Fall back to the bump region.
        let offset = (*control).bump_offset;
        if offset + total > (*control).payload_size {
            return Err(ShmError::PoolExhausted {
                requested: total,
                pool_size: (*control).payload_size,
            });
        }
        let header = payload.add(offset) as *mut BlockHeader;
        (*header).size = block_size;
        (*control).bump_offset = offset + total;
        Ok(payload.add(offset + BLOCK_HEADER_SIZE))
    }

    /// Returns a block to the free list. `ptr` must have come from `malloc`
    /// on this same (or, for an attached foreign arena, the owning) pool.
    pub fn free(&self, ptr: *mut u8) {
        unsafe {
            let control = self.control();
            libc::pthread_mutex_lock(ptr::addr_of_mut!((*control).lock));
            let payload = self.payload_base();
            let block_offset = (ptr as usize) - BLOCK_HEADER_SIZE - (payload as usize);
            let header = payload.add(block_offset) as *mut BlockHeader;
            let tail = payload.add(block_offset + BLOCK_HEADER_SIZE) as *mut FreeBlockTail;
            (*tail).next = (*control).free_list_head;
            (*control).free_list_head = block_offset as isize;
            let _ = (*header).size; // kept for the next malloc's first-fit scan
            libc::pthread_mutex_unlock(ptr::addr_of_mut!((*control).lock));
        }
    }

    /// A signed offset from the arena base suitable for cross-process
    /// transport: the peer recomputes the pointer by adding this to its own
    /// mapping's base address.
    pub fn memory_offset(&self, ptr: *mut u8) -> isize {
        (ptr as isize) - (self.base as isize)
    }

    pub fn ptr_at_offset(&self, offset: isize) -> *mut u8 {
        unsafe { self.base.offset(offset) }
    }

    pub fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        unsafe { ptr::addr_of_mut!((*self.control()).lock) }
    }

    pub fn as_fd(&self) -> RawFd {
        self.fd
    }

    pub fn len(&self) -> usize {
        self.size
    }
}

impl Drop for ShmPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
            libc::close(self.fd);
            if self.owns_unlink {
                if let Ok(cname) = CString::new(self.name.as_str()) {
                    libc::shm_unlink(cname.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_then_free_reuses_the_block() {
        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let a = pool.malloc(64).unwrap();
        pool.free(a);
        let b = pool.malloc(64).unwrap();
        assert_eq!(a, b, "freed block should be reused by first-fit");
    }

    #[test]
    fn malloc_writes_roundtrip_through_memory_offset() {
        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let ptr = pool.malloc(16).unwrap();
        unsafe { ptr.write_bytes(0xAB, 16) };
        let offset = pool.memory_offset(ptr);
        let resolved = pool.ptr_at_offset(offset);
        assert_eq!(resolved, ptr);
        unsafe { assert_eq!(*resolved, 0xAB) };
    }

    #[test]
    fn exhausting_the_pool_reports_pool_exhausted() {
        let pool = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let mut err = None;
        for _ in 0..64 {
            if let Err(e) = pool.malloc(4096) {
                err = Some(e);
                break;
            }
        }
        assert!(matches!(err, Some(ShmError::PoolExhausted { .. })));
    }

    #[test]
    fn attach_maps_the_same_bytes_a_peer_wrote() {
        let owner = ShmPool::create(MIN_POOL_SIZE).unwrap();
        let ptr = owner.malloc(8).unwrap();
        unsafe { ptr.write_bytes(0x7E, 8) };
        let offset = owner.memory_offset(ptr);

        let peer = ShmPool::attach(owner.name(), false).unwrap();
        let peer_ptr = peer.ptr_at_offset(offset);
        unsafe { assert_eq!(*peer_ptr, 0x7E) };
    }
}
