//! Game globals that our code touches.

#![allow(clippy::unreadable_literal)]

use super::Var;

#[cfg(windows)]
pub use windows_sys::Win32::Foundation::HANDLE as Handle;

#[cfg(not(windows))]
pub type Handle = isize;

/// The mutex the game takes around text decompression.
pub static DECODE_MUTEX: Var<Handle> = Var::new(0x005D66B0);

/// Holds a game mutex until dropped.
#[cfg(windows)]
pub struct HostMutexGuard {
    handle: Handle,
}

#[cfg(windows)]
impl HostMutexGuard {
    /// Waits (without a timeout) for the mutex whose handle is stored in `var`.
    ///
    /// # Safety
    /// `var` must hold a valid mutex handle.
    pub unsafe fn acquire(var: &Var<Handle>) -> HostMutexGuard {
        use windows_sys::Win32::System::Threading::{WaitForSingleObject, INFINITE};

        let handle = var.get();
        WaitForSingleObject(handle, INFINITE);

        HostMutexGuard { handle }
    }
}

#[cfg(windows)]
impl Drop for HostMutexGuard {
    fn drop(&mut self) {
        use windows_sys::Win32::System::Threading::ReleaseMutex;

        unsafe {
            ReleaseMutex(self.handle);
        }
    }
}
