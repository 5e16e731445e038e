//! Raw descriptor reads and writes.

use std::ffi::{c_int, c_void};

use libc::{iovec, off_t, off64_t, size_t, ssize_t};

use super::account;
use crate::real::real;

fn track_read(fd: c_int, rc: ssize_t) {
    if rc > 0 {
        account(|t| t.read(fd, rc as usize));
    }
}

fn track_write(fd: c_int, rc: ssize_t) {
    if rc > 0 {
        account(|t| t.wrote(fd, rc as usize));
    }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let real_read = real!(read(c_int, *mut c_void, size_t) -> ssize_t);
    let rc = unsafe { real_read(fd, buf, count) };
    track_read(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let real_write = real!(write(c_int, *const c_void, size_t) -> ssize_t);
    let rc = unsafe { real_write(fd, buf, count) };
    track_write(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pread(fd: c_int, buf: *mut c_void, count: size_t, offset: off_t) -> ssize_t {
    let real_pread = real!(pread(c_int, *mut c_void, size_t, off_t) -> ssize_t);
    let rc = unsafe { real_pread(fd, buf, count, offset) };
    track_read(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pread64(fd: c_int, buf: *mut c_void, count: size_t, offset: off64_t) -> ssize_t {
    let real_pread64 = real!(pread64(c_int, *mut c_void, size_t, off64_t) -> ssize_t);
    let rc = unsafe { real_pread64(fd, buf, count, offset) };
    track_read(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pwrite(fd: c_int, buf: *const c_void, count: size_t, offset: off_t) -> ssize_t {
    let real_pwrite = real!(pwrite(c_int, *const c_void, size_t, off_t) -> ssize_t);
    let rc = unsafe { real_pwrite(fd, buf, count, offset) };
    track_write(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pwrite64(fd: c_int, buf: *const c_void, count: size_t, offset: off64_t) -> ssize_t {
    let real_pwrite64 = real!(pwrite64(c_int, *const c_void, size_t, off64_t) -> ssize_t);
    let rc = unsafe { real_pwrite64(fd, buf, count, offset) };
    track_write(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let real_readv = real!(readv(c_int, *const iovec, c_int) -> ssize_t);
    let rc = unsafe { real_readv(fd, iov, iovcnt) };
    track_read(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let real_writev = real!(writev(c_int, *const iovec, c_int) -> ssize_t);
    let rc = unsafe { real_writev(fd, iov, iovcnt) };
    track_write(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn preadv(fd: c_int, iov: *const iovec, iovcnt: c_int, offset: off_t) -> ssize_t {
    let real_preadv = real!(preadv(c_int, *const iovec, c_int, off_t) -> ssize_t);
    let rc = unsafe { real_preadv(fd, iov, iovcnt, offset) };
    track_read(fd, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pwritev(fd: c_int, iov: *const iovec, iovcnt: c_int, offset: off_t) -> ssize_t {
    let real_pwritev = real!(pwritev(c_int, *const iovec, c_int, off_t) -> ssize_t);
    let rc = unsafe { real_pwritev(fd, iov, iovcnt, offset) };
    track_write(fd, rc);
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_vectored_io_passes_through() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let (a, b) = (*b"abc", *b"defg");
        let out = [
            iovec {
                iov_base: a.as_ptr() as *mut c_void,
                iov_len: a.len(),
            },
            iovec {
                iov_base: b.as_ptr() as *mut c_void,
                iov_len: b.len(),
            },
        ];
        assert_eq!(unsafe { pwritev(fd, out.as_ptr(), 2, 0) }, 7);

        let mut buf = [0u8; 7];
        assert_eq!(unsafe { pread(fd, buf.as_mut_ptr() as *mut c_void, 7, 0) }, 7);
        assert_eq!(&buf, b"abcdefg");
        assert_eq!(unsafe { read(-1, buf.as_mut_ptr() as *mut c_void, 1) }, -1);
    }
}
