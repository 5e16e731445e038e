//! Thread creation and exit, for the `threads:` trace line.

use std::cell::Cell;
use std::ffi::{c_int, c_void};

use libc::{pthread_attr_t, pthread_t};

use crate::guard::{self, ErrnoGuard};
use crate::real::real;
use crate::runtime;

type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

thread_local! {
    /// Set on threads that were counted as started and not yet as finished.
    static COUNTED: Cell<bool> = const { Cell::new(false) };
}

struct Start {
    routine: StartRoutine,
    arg: *mut c_void,
    internal: bool,
}

extern "C" fn trampoline(payload: *mut c_void) -> *mut c_void {
    // SAFETY: payload is the Box leaked by pthread_create below.
    let start = unsafe { Box::from_raw(payload as *mut Start) };
    if start.internal {
        guard::mark_internal();
    } else {
        let _ = COUNTED.try_with(|c| c.set(true));
    }
    let result = (start.routine)(start.arg);
    thread_exiting();
    result
}

fn thread_exiting() {
    let counted = COUNTED.try_with(|c| c.replace(false)).unwrap_or(false);
    if counted && let Some(runtime) = runtime::current() {
        runtime.thread_finished();
    }
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_create(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    routine: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let real_create = real!(pthread_create(*mut pthread_t, *const pthread_attr_t, StartRoutine, *mut c_void) -> c_int);

    // threads spawned by the shim's own work are not the application's
    let internal = guard::in_hook();
    let runtime = if internal { None } else { runtime::current() };
    if let Some(runtime) = runtime {
        runtime.thread_started();
    }

    let payload = Box::into_raw(Box::new(Start {
        routine,
        arg,
        internal,
    }));
    let rc = unsafe { real_create(thread, attr, trampoline, payload as *mut c_void) };
    if rc != 0 {
        let _errno = ErrnoGuard::save();
        // SAFETY: the thread was not created, so the payload is still ours.
        drop(unsafe { Box::from_raw(payload) });
        if let Some(runtime) = runtime {
            runtime.thread_not_started();
        }
    }
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_exit(retval: *mut c_void) -> ! {
    let real_exit = real!(pthread_exit(*mut c_void) -> !);
    thread_exiting();
    unsafe { real_exit(retval) }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn double(arg: *mut c_void) -> *mut c_void {
        (arg as usize * 2) as *mut c_void
    }

    #[test]
    fn test_trampoline_runs_routine() {
        let mut handle: pthread_t = 0;
        let rc = unsafe { pthread_create(&mut handle, std::ptr::null(), double, 21 as *mut c_void) };
        assert_eq!(rc, 0);
        let mut result: *mut c_void = std::ptr::null_mut();
        assert_eq!(unsafe { libc::pthread_join(handle, &mut result) }, 0);
        assert_eq!(result as usize, 42);
    }

    extern "C" fn reports_internal(_: *mut c_void) -> *mut c_void {
        guard::in_hook() as usize as *mut c_void
    }

    #[test]
    fn test_thread_created_inside_hook_is_internal() {
        let spawned = std::thread::spawn(|| {
            let _guard = guard::HookGuard::enter().unwrap();
            let mut handle: pthread_t = 0;
            let rc = unsafe {
                pthread_create(&mut handle, std::ptr::null(), reports_internal, std::ptr::null_mut())
            };
            assert_eq!(rc, 0);
            let mut result: *mut c_void = std::ptr::null_mut();
            unsafe { libc::pthread_join(handle, &mut result) };
            result as usize
        });
        assert_eq!(spawned.join().unwrap(), 1);
    }
}
