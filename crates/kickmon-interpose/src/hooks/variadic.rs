//! Variadic entry points.
//!
//! Rust cannot define C-variadic functions, so `fprintf`, `printf` and the
//! `execl` family are exported as naked stubs that jump straight to the C
//! bodies in `native/variadic.c`. A tail jump leaves every argument register
//! (and `%al` on x86_64) exactly as the caller set it.

unsafe extern "C" {
    fn kickmon_fprintf();
    fn kickmon_printf();
    fn kickmon_execl();
    fn kickmon_execlp();
    fn kickmon_execle();
}

#[cfg(target_arch = "x86_64")]
macro_rules! forward {
    ($name:ident => $target:ident) => {
        #[cfg_attr(not(test), unsafe(no_mangle))]
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!("jmp {t}@PLT", t = sym $target)
        }
    };
}

#[cfg(target_arch = "aarch64")]
macro_rules! forward {
    ($name:ident => $target:ident) => {
        #[cfg_attr(not(test), unsafe(no_mangle))]
        #[unsafe(naked)]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!("b {t}", t = sym $target)
        }
    };
}

forward!(fprintf => kickmon_fprintf);
forward!(printf => kickmon_printf);
forward!(execl => kickmon_execl);
forward!(execlp => kickmon_execlp);
forward!(execle => kickmon_execle);
