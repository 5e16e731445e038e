//! Process lifecycle: fork, exec and immediate exit.

use std::ffi::{c_char, c_int};

use kickmon_core::util::current_pid;
use libc::pid_t;

use crate::guard::ErrnoGuard;
use crate::real::real;
use crate::runtime;

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn fork() -> pid_t {
    let real_fork = real!(fork() -> pid_t);
    let parent = current_pid();
    let pid = unsafe { real_fork() };
    if pid == 0 {
        let _errno = ErrnoGuard::save();
        runtime::after_fork(parent);
    }
    pid
}

/// Runs an exec call between finalization and, if it comes back,
/// reinitialization.
fn around_exec(exec: impl FnOnce() -> c_int) -> c_int {
    runtime::before_exec();
    let rc = exec();
    let _errno = ErrnoGuard::save();
    runtime::after_failed_exec();
    rc
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execve(
    path: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real_execve = real!(execve(*const c_char, *const *const c_char, *const *const c_char) -> c_int);
    around_exec(|| unsafe { real_execve(path, argv, envp) })
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execv(path: *const c_char, argv: *const *const c_char) -> c_int {
    let real_execv = real!(execv(*const c_char, *const *const c_char) -> c_int);
    around_exec(|| unsafe { real_execv(path, argv) })
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvp(file: *const c_char, argv: *const *const c_char) -> c_int {
    let real_execvp = real!(execvp(*const c_char, *const *const c_char) -> c_int);
    around_exec(|| unsafe { real_execvp(file, argv) })
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn execvpe(
    file: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let real_execvpe = real!(execvpe(*const c_char, *const *const c_char, *const *const c_char) -> c_int);
    around_exec(|| unsafe { real_execvpe(file, argv, envp) })
}

#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn _exit(status: c_int) -> ! {
    let real_exit = real!(_exit(c_int) -> !);
    runtime::on_exit();
    unsafe { real_exit(status) }
}

#[allow(non_snake_case)]
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn _Exit(status: c_int) -> ! {
    let real_exit = real!(_Exit(c_int) -> !);
    runtime::on_exit();
    unsafe { real_exit(status) }
}
