//! Descriptor-level file operations.

use std::ffi::{c_char, c_int};

use libc::{mode_t, off_t, off64_t};

use super::{account, c_string, resolve_at, tracked_size};
use crate::real::real;

/// Records a successful open of `path` (relative to `dirfd`) on `fd`.
unsafe fn track_open(fd: c_int, dirfd: c_int, path: *const c_char) {
    if fd < 0 {
        return;
    }
    // SAFETY: path came from the application as a C string.
    if let Some(path) = unsafe { c_string(path) } {
        account(|t| t.opened(fd, &resolve_at(dirfd, &path)));
    }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_open = real!(open(*const c_char, c_int, mode_t) -> c_int);
    let fd = unsafe { real_open(path, flags, mode) };
    unsafe { track_open(fd, libc::AT_FDCWD, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_open64 = real!(open64(*const c_char, c_int, mode_t) -> c_int);
    let fd = unsafe { real_open64(path, flags, mode) };
    unsafe { track_open(fd, libc::AT_FDCWD, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_openat = real!(openat(c_int, *const c_char, c_int, mode_t) -> c_int);
    let fd = unsafe { real_openat(dirfd, path, flags, mode) };
    unsafe { track_open(fd, dirfd, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
    let real_openat64 = real!(openat64(c_int, *const c_char, c_int, mode_t) -> c_int);
    let fd = unsafe { real_openat64(dirfd, path, flags, mode) };
    unsafe { track_open(fd, dirfd, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn creat(path: *const c_char, mode: mode_t) -> c_int {
    let real_creat = real!(creat(*const c_char, mode_t) -> c_int);
    let fd = unsafe { real_creat(path, mode) };
    unsafe { track_open(fd, libc::AT_FDCWD, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn creat64(path: *const c_char, mode: mode_t) -> c_int {
    let real_creat64 = real!(creat64(*const c_char, mode_t) -> c_int);
    let fd = unsafe { real_creat64(path, mode) };
    unsafe { track_open(fd, libc::AT_FDCWD, path) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn mkstemp(template: *mut c_char) -> c_int {
    let real_mkstemp = real!(mkstemp(*mut c_char) -> c_int);
    let fd = unsafe { real_mkstemp(template) };
    // the template now holds the generated name
    unsafe { track_open(fd, libc::AT_FDCWD, template) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn mkostemp(template: *mut c_char, flags: c_int) -> c_int {
    let real_mkostemp = real!(mkostemp(*mut c_char, c_int) -> c_int);
    let fd = unsafe { real_mkostemp(template, flags) };
    unsafe { track_open(fd, libc::AT_FDCWD, template) };
    fd
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let real_close = real!(close(c_int) -> c_int);
    let rc = unsafe { real_close(fd) };
    if rc == 0 {
        account(|t| {
            let size = tracked_size(t, fd);
            t.closed(fd, size);
        });
    }
    rc
}

fn track_dup(old: c_int, new: c_int) {
    if new < 0 {
        return;
    }
    account(|t| {
        let prior = tracked_size(t, new);
        t.duplicated(old, new, prior);
    });
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn dup(old: c_int) -> c_int {
    let real_dup = real!(dup(c_int) -> c_int);
    let new = unsafe { real_dup(old) };
    track_dup(old, new);
    new
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn dup2(old: c_int, new: c_int) -> c_int {
    let real_dup2 = real!(dup2(c_int, c_int) -> c_int);
    let rc = unsafe { real_dup2(old, new) };
    track_dup(old, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn dup3(old: c_int, new: c_int, flags: c_int) -> c_int {
    let real_dup3 = real!(dup3(c_int, c_int, c_int) -> c_int);
    let rc = unsafe { real_dup3(old, new, flags) };
    track_dup(old, rc);
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn lseek(fd: c_int, offset: off_t, whence: c_int) -> off_t {
    let real_lseek = real!(lseek(c_int, off_t, c_int) -> off_t);
    let rc = unsafe { real_lseek(fd, offset, whence) };
    if rc >= 0 {
        account(|t| t.sought(fd, offset));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn lseek64(fd: c_int, offset: off64_t, whence: c_int) -> off64_t {
    let real_lseek64 = real!(lseek64(c_int, off64_t, c_int) -> off64_t);
    let rc = unsafe { real_lseek64(fd, offset, whence) };
    if rc >= 0 {
        account(|t| t.sought(fd, offset));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn truncate(path: *const c_char, length: off_t) -> c_int {
    let real_truncate = real!(truncate(*const c_char, off_t) -> c_int);
    let rc = unsafe { real_truncate(path, length) };
    if rc == 0
        && let Some(path) = unsafe { c_string(path) }
    {
        account(|t| t.truncated_path(&path, length.max(0) as u64));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn ftruncate(fd: c_int, length: off_t) -> c_int {
    let real_ftruncate = real!(ftruncate(c_int, off_t) -> c_int);
    let rc = unsafe { real_ftruncate(fd, length) };
    if rc == 0 {
        account(|t| t.truncated_fd(fd, length.max(0) as u64));
    }
    rc
}
