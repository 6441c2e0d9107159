//! Abstract Unix-domain datagram sockets: the control channel both
//! [`crate::server::RsaShmServer`] and [`crate::client::RsaShmClientManager`]
//! use to hand descriptor offsets back and forth (§6).
//!
//! Linux's abstract socket namespace (a `sockaddr_un` whose `sun_path`
//! starts with a NUL byte) needs no filesystem entry and is cleaned up by
//! the kernel when the owning socket closes — `std::os::unix::net` doesn't
//! expose it, so this goes through `libc` directly, the same way
//! `psa-udpmc` reaches for raw `epoll_ctl`/`sendmsg` for things `std` can't
//! express.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use crate::error::{ShmError, ShmResult};

pub const MAX_SERVER_NAME_LEN: usize = 84;

/// An abstract-namespace `sockaddr_un` plus its actual length, since the
/// embedded NUL in `sun_path[0]` means we can't just `CString`-encode it.
#[derive(Clone, Copy)]
pub struct AbstractAddr {
    pub addr: libc::sockaddr_un,
    pub len: libc::socklen_t,
}

pub fn abstract_addr(name: &str) -> ShmResult<AbstractAddr> {
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(ShmError::Ps(pubsub_types::PsError::IllegalArgument(format!(
            "shm server name {name:?} exceeds {MAX_SERVER_NAME_LEN} bytes"
        ))));
    }
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // sun_path[0] == 0 puts this in the abstract namespace; the name
    // follows starting at sun_path[1], not NUL-terminated.
    let path_bytes = name.as_bytes();
    for (i, b) in path_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = *b as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + 1 + path_bytes.len()) as libc::socklen_t;
    Ok(AbstractAddr { addr, len })
}

/// Opens an `AF_UNIX/SOCK_DGRAM` socket bound to the abstract address
/// `name`. Pass an empty `name` for an anonymous (client-side) socket that
/// only ever sends.
pub fn bind_dgram(name: &str) -> ShmResult<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(ShmError::from(io::Error::last_os_error()));
    }
    if !name.is_empty() {
        let bound = abstract_addr(name)?;
        let rc = unsafe {
            libc::bind(
                fd,
                &bound.addr as *const _ as *const libc::sockaddr,
                bound.len,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(ShmError::from(err));
        }
    }
    Ok(fd)
}

pub fn sendto(fd: RawFd, buf: &[u8], dest_name: &str) -> ShmResult<()> {
    let dest = abstract_addr(dest_name)?;
    let n = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            0,
            &dest.addr as *const _ as *const libc::sockaddr,
            dest.len,
        )
    };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::ConnectionRefused {
            return Err(ShmError::ConnectionRefused(dest_name.to_string()));
        }
        return Err(ShmError::from(err));
    }
    Ok(())
}

/// Raw sender address bytes from `recvfrom`, used as an opaque session key
/// — two datagrams from the same logical peer produce equal bytes.
pub fn recvfrom(fd: RawFd, buf: &mut [u8]) -> ShmResult<(usize, Vec<u8>)> {
    let mut src: libc::sockaddr_un = unsafe { mem::zeroed() };
    let mut src_len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut src as *mut _ as *mut libc::sockaddr,
            &mut src_len,
        )
    };
    if n < 0 {
        return Err(ShmError::from(io::Error::last_os_error()));
    }
    let bytes = unsafe {
        std::slice::from_raw_parts(&src as *const _ as *const u8, src_len as usize)
    }
    .to_vec();
    Ok((n as usize, bytes))
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abstract_roundtrip_send_recv() {
        let name = format!("rsa-shm-test-{}", std::process::id());
        let server = bind_dgram(&name).unwrap();
        let client = bind_dgram("").unwrap();

        sendto(client, b"hello", &name).unwrap();

        let mut buf = [0u8; 16];
        let (n, _src) = recvfrom(server, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        close(server);
        close(client);
    }

    #[test]
    fn rejects_oversized_server_name() {
        let too_long = "x".repeat(MAX_SERVER_NAME_LEN + 1);
        assert!(abstract_addr(&too_long).is_err());
    }
}
