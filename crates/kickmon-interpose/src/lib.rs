//! kickmon-interpose: `LD_PRELOAD` shim accounting a process's I/O.
//!
//! Loaded ahead of the C library, the shim:
//! - intercepts file, socket, stdio and lifecycle calls (`hooks`)
//! - keeps a per-process descriptor table and trace file (`runtime`)
//! - publishes one final process snapshot when the image ends, to the
//!   coordinator named by `KICKSTART_MON_PEER` or to `KICKSTART_MON_URL`
//!
//! Setup and teardown run from ELF `.init_array` / `.fini_array` entries.

pub mod hooks;

mod guard;
mod hwcounters;
mod real;
mod runtime;

#[cfg(not(test))]
mod init {
    use crate::runtime;

    extern "C" fn on_load() {
        runtime::on_load();
    }

    extern "C" fn on_unload() {
        runtime::on_exit();
    }

    #[used]
    #[unsafe(link_section = ".init_array")]
    static ON_LOAD: extern "C" fn() = on_load;

    #[used]
    #[unsafe(link_section = ".fini_array")]
    static ON_UNLOAD: extern "C" fn() = on_unload;
}
