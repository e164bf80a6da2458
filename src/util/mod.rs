//! Utility helpers shared across the safepoint and signal layers.

pub mod page;
pub mod sync;
pub mod time;

use cfg_if::cfg_if;

/// Last OS error as a raw errno value.
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Address of the calling thread's `errno` slot. Signal handlers
        /// save and restore through this so an interrupted syscall's
        /// errno survives the handler.
        pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
            libc::__errno_location()
        }
    } else if #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))] {
        pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
            libc::__error()
        }
    } else {
        pub(crate) unsafe fn errno_location() -> *mut libc::c_int {
            static mut FALLBACK: libc::c_int = 0;
            std::ptr::addr_of_mut!(FALLBACK)
        }
    }
}
