//! Exported replacements for C library functions.
//!
//! Every hook calls the real function first and unconditionally, then
//! reports a successful outcome to the descriptor tracker. The return value
//! and `errno` the application sees are exactly the real function's.
//!
//! Hooks are exported under their C names only outside of unit tests, so
//! the test binary keeps using the C library directly.

pub mod file;
pub mod io;
pub mod process;
pub mod socket;
pub mod stream;
pub mod thread;
pub mod variadic;

use std::ffi::{CStr, c_char, c_int};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use kickmon_core::descriptor::{DescriptorKind, DescriptorTracker};

use crate::guard::{ErrnoGuard, HookGuard};
use crate::runtime;

/// Hands the tracker to `f` unless this thread is already inside a hook or
/// no runtime is installed yet. `errno` is preserved.
pub(crate) fn account(f: impl FnOnce(&mut DescriptorTracker)) {
    let _errno = ErrnoGuard::save();
    let Some(_guard) = HookGuard::enter() else {
        return;
    };
    if let Some(runtime) = runtime::current() {
        runtime.with_tracker(f);
    }
}

/// Current size of the file open on `fd`, 0 if unknown.
pub(crate) fn fd_size(fd: c_int) -> u64 {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills st on success; st is only read after success.
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } == 0 {
        unsafe { st.assume_init() }.st_size.max(0) as u64
    } else {
        0
    }
}

/// Size of the tracked file on `fd`, looked up by path so it also works
/// after the descriptor itself is gone.
pub(crate) fn tracked_size(tracker: &DescriptorTracker, fd: c_int) -> u64 {
    match tracker.table().get(fd) {
        Some(entry) if entry.kind == DescriptorKind::File => std::fs::metadata(&entry.path)
            .map(|m| m.len())
            .unwrap_or(0),
        _ => 0,
    }
}

/// Copies a C string. `None` for a null pointer.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated string.
pub(crate) unsafe fn c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller guarantees a valid C string.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Path a `*at` call refers to: absolute paths and `AT_FDCWD` as given,
/// otherwise joined onto the directory `dirfd` is open on.
pub(crate) fn resolve_at(dirfd: c_int, path: &str) -> String {
    if path.starts_with('/') || dirfd == libc::AT_FDCWD {
        return path.to_string();
    }
    match std::fs::read_link(format!("/proc/self/fd/{}", dirfd)) {
        Ok(dir) => dir.join(path).to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

/// Path a descriptor is open on, as the kernel reports it.
pub(crate) fn fd_target(fd: c_int) -> Option<String> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd))
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Decodes an IPv4 or IPv6 socket address. Other families yield `None`.
///
/// # Safety
/// `addr` must be null or point at `len` readable bytes.
pub(crate) unsafe fn socket_addr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if addr.is_null() || (len as usize) < std::mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    // SAFETY: at least the family field is readable.
    let family = c_int::from(unsafe { (*addr).sa_family });
    match family {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length identify a sockaddr_in.
            let sin = unsafe { std::ptr::read_unaligned(addr as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length identify a sockaddr_in6.
            let sin6 = unsafe { std::ptr::read_unaligned(addr as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}
