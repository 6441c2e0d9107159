//! The request/response descriptor the client places in its own arena and
//! hands to the server by offset (§3 "Shm message descriptor", §4.7).
//!
//! The mutex and condvar embedded in the descriptor are
//! `PTHREAD_PROCESS_SHARED` (the condvar additionally uses `CLOCK_MONOTONIC`
//! so the timeout in step 4 of `sendMsgTo` isn't affected by wall-clock
//! adjustments) — both processes operate on the exact same bytes, there is
//! no message-passing involved in the handshake itself.

use std::mem::{self, MaybeUninit};
use std::time::Duration;

use crate::error::{ShmError, ShmResult};

/// Status codes written into [`ShmDescriptor::status`] by the server.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Pending = 0,
    Success = 1,
    ServiceException = 2,
    IllegalState = 3,
}

impl RpcStatus {
    fn from_i32(v: i32) -> Self {
        match v {
            1 => RpcStatus::Success,
            3 => RpcStatus::IllegalState,
            2 => RpcStatus::ServiceException,
            _ => RpcStatus::Pending,
        }
    }
}

/// Placed at a malloc'd offset inside the client's [`crate::shm_pool::ShmPool`].
/// All offsets are relative to the *client's* arena base, since that's the
/// only arena both sides agree on.
#[repr(C)]
pub struct ShmDescriptor {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    pub request_offset: isize,
    pub request_len: u32,
    pub metadata_offset: isize,
    pub metadata_len: u32,
    pub response_offset: isize,
    pub response_len: u32,
    pub status: i32,
}

pub const DESCRIPTOR_SIZE: usize = mem::size_of::<ShmDescriptor>();

impl ShmDescriptor {
    /// Initializes a descriptor in place at `ptr` (already zeroed malloc'd
    /// memory is not assumed — every field is written explicitly).
    ///
    /// # Safety
    /// `ptr` must point to at least `DESCRIPTOR_SIZE` writable bytes that
    /// outlive every process that will touch this descriptor.
    pub unsafe fn init(ptr: *mut u8) -> ShmResult<()> {
        let desc = ptr as *mut ShmDescriptor;

        let mut mattr: MaybeUninit<libc::pthread_mutexattr_t> = MaybeUninit::uninit();
        libc::pthread_mutexattr_init(mattr.as_mut_ptr());
        let mut mattr = mattr.assume_init();
        libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init(std::ptr::addr_of_mut!((*desc).mutex), &mattr);
        libc::pthread_mutexattr_destroy(&mut mattr);
        if rc != 0 {
            return Err(ShmError::from(std::io::Error::from_raw_os_error(rc)));
        }

        let mut cattr: MaybeUninit<libc::pthread_condattr_t> = MaybeUninit::uninit();
        libc::pthread_condattr_init(cattr.as_mut_ptr());
        let mut cattr = cattr.assume_init();
        libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
        libc::pthread_condattr_setclock(&mut cattr, libc::CLOCK_MONOTONIC);
        let rc = libc::pthread_cond_init(std::ptr::addr_of_mut!((*desc).cond), &cattr);
        libc::pthread_condattr_destroy(&mut cattr);
        if rc != 0 {
            return Err(ShmError::from(std::io::Error::from_raw_os_error(rc)));
        }

        (*desc).request_offset = 0;
        (*desc).request_len = 0;
        (*desc).metadata_offset = 0;
        (*desc).metadata_len = 0;
        (*desc).response_offset = 0;
        (*desc).response_len = 0;
        (*desc).status = RpcStatus::Pending as i32;
        Ok(())
    }

    /// # Safety
    /// `ptr` must point at a descriptor previously initialized by [`Self::init`].
    pub unsafe fn at(ptr: *mut u8) -> *mut ShmDescriptor {
        ptr as *mut ShmDescriptor
    }

    /// Server side: acquire the descriptor's mutex, run `body`, write
    /// `status`/`response`, signal the condvar, release the mutex.
    ///
    /// # Safety
    /// `desc` must be a live, initialized descriptor reachable from this
    /// process's address space.
    pub unsafe fn complete(
        desc: *mut ShmDescriptor,
        status: RpcStatus,
        response_offset: isize,
        response_len: u32,
    ) {
        libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*desc).mutex));
        (*desc).response_offset = response_offset;
        (*desc).response_len = response_len;
        (*desc).status = status as i32;
        libc::pthread_cond_signal(std::ptr::addr_of_mut!((*desc).cond));
        libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*desc).mutex));
    }

    /// Client side: block until the server calls [`Self::complete`] or
    /// `timeout` elapses. Returns the final status, or `None` on timeout.
    ///
    /// # Safety
    /// Same requirement as [`Self::complete`].
    pub unsafe fn wait(desc: *mut ShmDescriptor, timeout: Duration) -> Option<RpcStatus> {
        libc::pthread_mutex_lock(std::ptr::addr_of_mut!((*desc).mutex));

        let mut deadline: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut deadline);
        deadline.tv_sec += timeout.as_secs() as libc::time_t;
        deadline.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }

        let mut rc = 0;
        while (*desc).status == RpcStatus::Pending as i32 && rc == 0 {
            rc = libc::pthread_cond_timedwait(
                std::ptr::addr_of_mut!((*desc).cond),
                std::ptr::addr_of_mut!((*desc).mutex),
                &deadline,
            );
        }
        let status = if rc == 0 {
            Some(RpcStatus::from_i32((*desc).status))
        } else {
            None
        };
        libc::pthread_mutex_unlock(std::ptr::addr_of_mut!((*desc).mutex));
        status
    }

    pub fn status(&self) -> RpcStatus {
        RpcStatus::from_i32(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm_pool::ShmPool;

    #[test]
    fn server_completion_wakes_a_waiting_client() {
        let pool = ShmPool::create(crate::shm_pool::MIN_POOL_SIZE).unwrap();
        let raw = pool.malloc(DESCRIPTOR_SIZE).unwrap();
        unsafe { ShmDescriptor::init(raw).unwrap() };

        let desc_addr = raw as usize;
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            unsafe {
                let desc = ShmDescriptor::at(desc_addr as *mut u8);
                ShmDescriptor::complete(desc, RpcStatus::Success, 0, 4);
            }
        });

        let status = unsafe {
            let desc = ShmDescriptor::at(raw);
            ShmDescriptor::wait(desc, Duration::from_secs(5))
        };
        handle.join().unwrap();
        assert_eq!(status, Some(RpcStatus::Success));
    }

    #[test]
    fn wait_times_out_when_nobody_completes() {
        let pool = ShmPool::create(crate::shm_pool::MIN_POOL_SIZE).unwrap();
        let raw = pool.malloc(DESCRIPTOR_SIZE).unwrap();
        unsafe { ShmDescriptor::init(raw).unwrap() };
        let status = unsafe {
            let desc = ShmDescriptor::at(raw);
            ShmDescriptor::wait(desc, Duration::from_millis(100))
        };
        assert_eq!(status, None);
    }
}
