//! Buffered `FILE *` operations. Accounting happens at the stream level:
//! bytes the application handed to or received from stdio, not the
//! underlying `read`/`write` calls, which stdio makes internally.

use std::ffi::{CStr, c_char, c_int, c_long, c_void};

use libc::{FILE, off_t, off64_t, size_t, ssize_t};

use super::{account, c_string, fd_target, tracked_size};
use crate::real::real;

/// `va_list` as it crosses the C ABI: a pointer on x86_64, and an
/// indirectly passed struct (also a pointer) on aarch64.
pub type VaList = *mut c_void;

unsafe extern "C" {
    static stdout: *mut FILE;
}

fn fd_of(stream: *mut FILE) -> Option<c_int> {
    if stream.is_null() {
        return None;
    }
    // SAFETY: non-null stream handed to us by the application.
    let fd = unsafe { libc::fileno(stream) };
    (fd >= 0).then_some(fd)
}

fn track_read(stream: *mut FILE, bytes: usize) {
    if bytes > 0
        && let Some(fd) = fd_of(stream)
    {
        account(|t| t.read(fd, bytes));
    }
}

fn track_write(stream: *mut FILE, bytes: usize) {
    if bytes > 0
        && let Some(fd) = fd_of(stream)
    {
        account(|t| t.wrote(fd, bytes));
    }
}

unsafe fn track_fopen(stream: *mut FILE, path: *const c_char) {
    let Some(fd) = fd_of(stream) else {
        return;
    };
    // SAFETY: path came from the application as a C string.
    if let Some(path) = unsafe { c_string(path) } {
        account(|t| t.opened(fd, &path));
    }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fopen(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let real_fopen = real!(fopen(*const c_char, *const c_char) -> *mut FILE);
    let stream = unsafe { real_fopen(path, mode) };
    unsafe { track_fopen(stream, path) };
    stream
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fopen64(path: *const c_char, mode: *const c_char) -> *mut FILE {
    let real_fopen64 = real!(fopen64(*const c_char, *const c_char) -> *mut FILE);
    let stream = unsafe { real_fopen64(path, mode) };
    unsafe { track_fopen(stream, path) };
    stream
}

/// The old descriptor of `stream` is implicitly closed; a new path starts
/// fresh accounting. A null path only changes the mode and keeps the entry.
unsafe fn track_freopen(old_fd: Option<c_int>, stream: *mut FILE, path: *const c_char) {
    let Some(new_fd) = fd_of(stream) else {
        return;
    };
    // SAFETY: path came from the application as a C string.
    let Some(path) = (unsafe { c_string(path) }) else {
        return;
    };
    account(|t| {
        if let Some(old) = old_fd {
            let size = tracked_size(t, old);
            t.closed(old, size);
        }
        t.opened(new_fd, &path);
    });
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn freopen(path: *const c_char, mode: *const c_char, stream: *mut FILE) -> *mut FILE {
    let real_freopen = real!(freopen(*const c_char, *const c_char, *mut FILE) -> *mut FILE);
    let old_fd = fd_of(stream);
    let reopened = unsafe { real_freopen(path, mode, stream) };
    unsafe { track_freopen(old_fd, reopened, path) };
    reopened
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn freopen64(path: *const c_char, mode: *const c_char, stream: *mut FILE) -> *mut FILE {
    let real_freopen64 = real!(freopen64(*const c_char, *const c_char, *mut FILE) -> *mut FILE);
    let old_fd = fd_of(stream);
    let reopened = unsafe { real_freopen64(path, mode, stream) };
    unsafe { track_freopen(old_fd, reopened, path) };
    reopened
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn tmpfile() -> *mut FILE {
    let real_tmpfile = real!(tmpfile() -> *mut FILE);
    let stream = unsafe { real_tmpfile() };
    if let Some(fd) = fd_of(stream) {
        account(|t| {
            if let Some(target) = fd_target(fd) {
                t.opened(fd, &target);
            }
        });
    }
    stream
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fclose(stream: *mut FILE) -> c_int {
    let real_fclose = real!(fclose(*mut FILE) -> c_int);
    let fd = fd_of(stream);
    let rc = unsafe { real_fclose(stream) };
    if rc == 0
        && let Some(fd) = fd
    {
        account(|t| {
            let size = tracked_size(t, fd);
            t.closed(fd, size);
        });
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fread(ptr: *mut c_void, size: size_t, nmemb: size_t, stream: *mut FILE) -> size_t {
    let real_fread = real!(fread(*mut c_void, size_t, size_t, *mut FILE) -> size_t);
    let items = unsafe { real_fread(ptr, size, nmemb, stream) };
    track_read(stream, items.saturating_mul(size));
    items
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fwrite(ptr: *const c_void, size: size_t, nmemb: size_t, stream: *mut FILE) -> size_t {
    let real_fwrite = real!(fwrite(*const c_void, size_t, size_t, *mut FILE) -> size_t);
    let items = unsafe { real_fwrite(ptr, size, nmemb, stream) };
    track_write(stream, items.saturating_mul(size));
    items
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fgetc(stream: *mut FILE) -> c_int {
    let real_fgetc = real!(fgetc(*mut FILE) -> c_int);
    let c = unsafe { real_fgetc(stream) };
    if c != libc::EOF {
        track_read(stream, 1);
    }
    c
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn getc(stream: *mut FILE) -> c_int {
    let real_getc = real!(getc(*mut FILE) -> c_int);
    let c = unsafe { real_getc(stream) };
    if c != libc::EOF {
        track_read(stream, 1);
    }
    c
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fputc(c: c_int, stream: *mut FILE) -> c_int {
    let real_fputc = real!(fputc(c_int, *mut FILE) -> c_int);
    let rc = unsafe { real_fputc(c, stream) };
    if rc != libc::EOF {
        track_write(stream, 1);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn putc(c: c_int, stream: *mut FILE) -> c_int {
    let real_putc = real!(putc(c_int, *mut FILE) -> c_int);
    let rc = unsafe { real_putc(c, stream) };
    if rc != libc::EOF {
        track_write(stream, 1);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fgets(s: *mut c_char, size: c_int, stream: *mut FILE) -> *mut c_char {
    let real_fgets = real!(fgets(*mut c_char, c_int, *mut FILE) -> *mut c_char);
    let line = unsafe { real_fgets(s, size, stream) };
    if !line.is_null() {
        // SAFETY: fgets NUL-terminates what it stored.
        let n = unsafe { CStr::from_ptr(line) }.to_bytes().len();
        track_read(stream, n);
    }
    line
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fputs(s: *const c_char, stream: *mut FILE) -> c_int {
    let real_fputs = real!(fputs(*const c_char, *mut FILE) -> c_int);
    let rc = unsafe { real_fputs(s, stream) };
    if rc >= 0 {
        // SAFETY: fputs succeeded, so s is a valid C string.
        let n = unsafe { CStr::from_ptr(s) }.to_bytes().len();
        track_write(stream, n);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn getline(line: *mut *mut c_char, n: *mut size_t, stream: *mut FILE) -> ssize_t {
    let real_getline = real!(getline(*mut *mut c_char, *mut size_t, *mut FILE) -> ssize_t);
    let rc = unsafe { real_getline(line, n, stream) };
    if rc > 0 {
        track_read(stream, rc as usize);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn getdelim(
    line: *mut *mut c_char,
    n: *mut size_t,
    delim: c_int,
    stream: *mut FILE,
) -> ssize_t {
    let real_getdelim = real!(getdelim(*mut *mut c_char, *mut size_t, c_int, *mut FILE) -> ssize_t);
    let rc = unsafe { real_getdelim(line, n, delim, stream) };
    if rc > 0 {
        track_read(stream, rc as usize);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn vfprintf(stream: *mut FILE, format: *const c_char, ap: VaList) -> c_int {
    let real_vfprintf = real!(vfprintf(*mut FILE, *const c_char, VaList) -> c_int);
    let rc = unsafe { real_vfprintf(stream, format, ap) };
    if rc > 0 {
        track_write(stream, rc as usize);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn vprintf(format: *const c_char, ap: VaList) -> c_int {
    let real_vprintf = real!(vprintf(*const c_char, VaList) -> c_int);
    let rc = unsafe { real_vprintf(format, ap) };
    if rc > 0 {
        // SAFETY: reads the C library's stdout pointer.
        track_write(unsafe { stdout }, rc as usize);
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fseek(stream: *mut FILE, offset: c_long, whence: c_int) -> c_int {
    let real_fseek = real!(fseek(*mut FILE, c_long, c_int) -> c_int);
    let rc = unsafe { real_fseek(stream, offset, whence) };
    if rc == 0
        && let Some(fd) = fd_of(stream)
    {
        account(|t| t.sought(fd, i64::from(offset)));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fseeko(stream: *mut FILE, offset: off_t, whence: c_int) -> c_int {
    let real_fseeko = real!(fseeko(*mut FILE, off_t, c_int) -> c_int);
    let rc = unsafe { real_fseeko(stream, offset, whence) };
    if rc == 0
        && let Some(fd) = fd_of(stream)
    {
        account(|t| t.sought(fd, offset));
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fseeko64(stream: *mut FILE, offset: off64_t, whence: c_int) -> c_int {
    let real_fseeko64 = real!(fseeko64(*mut FILE, off64_t, c_int) -> c_int);
    let rc = unsafe { real_fseeko64(stream, offset, whence) };
    if rc == 0
        && let Some(fd) = fd_of(stream)
    {
        account(|t| t.sought(fd, offset));
    }
    rc
}
