//! Lazy resolution of the next definition of an intercepted symbol.

use std::ffi::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Resolves `$name` once through `dlsym(RTLD_NEXT)` and yields it as a
/// function pointer of the given prototype.
///
/// ```ignore
/// let real_read = real!(read(c_int, *mut c_void, size_t) -> ssize_t);
/// ```
macro_rules! real {
    ($name:ident ( $($arg:ty),* $(,)? ) -> $ret:ty) => {{
        static SLOT: ::std::sync::atomic::AtomicUsize = ::std::sync::atomic::AtomicUsize::new(0);
        let addr = $crate::real::lookup(&SLOT, concat!(stringify!($name), "\0"));
        // SAFETY: the address was resolved under the C name whose prototype
        // is spelled out at the call site.
        unsafe { ::std::mem::transmute::<usize, unsafe extern "C" fn($($arg),*) -> $ret>(addr) }
    }};
}

pub(crate) use real;

/// Returns the cached address in `slot`, resolving it on first use.
/// `name` must be NUL-terminated. Aborts if the symbol cannot be found.
pub(crate) fn lookup(slot: &AtomicUsize, name: &'static str) -> usize {
    let cached = slot.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    // SAFETY: name is a NUL-terminated static string.
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) } as usize;
    if addr == 0 {
        fatal(name);
    }
    slot.store(addr, Ordering::Release);
    addr
}

/// Reports an unresolvable symbol on fd 2 and aborts. Uses the raw syscall
/// so the message cannot recurse into a hook.
fn fatal(name: &str) -> ! {
    let symbol = name.trim_end_matches('\0');
    let message = format!("kickmon: cannot resolve real symbol '{}'\n", symbol);
    // SAFETY: writes a live byte buffer to stderr.
    unsafe {
        libc::syscall(
            libc::SYS_write,
            2,
            message.as_ptr() as *const libc::c_void,
            message.len(),
        );
        libc::abort()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_caches_address() {
        let slot = AtomicUsize::new(0);
        let first = lookup(&slot, "getpid\0");
        assert_ne!(first, 0);
        assert_eq!(slot.load(Ordering::Relaxed), first);
        assert_eq!(lookup(&slot, "getpid\0"), first);
    }

    #[test]
    fn test_real_macro_calls_next_definition() {
        let real_getpid = real!(getpid() -> libc::pid_t);
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { real_getpid() };
        assert_eq!(pid as u32, std::process::id());
    }
}
