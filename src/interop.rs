//! Access to data and functions that live at fixed addresses inside the game executable.

use cached::proc_macro::cached;
use std::marker::PhantomData;

pub mod globals;

/// Returns the base address of the game executable.
#[cached]
pub fn image_base() -> usize {
    #[cfg(windows)]
    {
        use windows_sys::Win32::System::LibraryLoader::GetModuleHandleA;

        // A null module name gives the handle of the executable, which is its base address.
        unsafe { GetModuleHandleA(std::ptr::null()) as usize }
    }

    #[cfg(not(windows))]
    {
        0
    }
}

/// A value of type `T` stored at a fixed address in the game's memory.
pub struct Var<T> {
    address: usize,
    _marker: PhantomData<*mut T>,
}

// Only the address is stored; the caller is responsible for how the memory behind it is shared.
unsafe impl<T> Sync for Var<T> {}
unsafe impl<T> Send for Var<T> {}

impl<T> Var<T> {
    pub const fn new(address: usize) -> Var<T> {
        Var {
            address,
            _marker: PhantomData,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn as_ptr(&self) -> *mut T {
        self.address as *mut T
    }

    /// Reads the current value.
    ///
    /// # Safety
    /// The address must be mapped, aligned and hold a valid `T`.
    pub unsafe fn get(&self) -> T
    where
        T: Copy,
    {
        self.as_ptr().read()
    }

    /// Overwrites the current value.
    ///
    /// # Safety
    /// The address must be mapped, writable and aligned for `T`.
    pub unsafe fn set(&self, value: T) {
        self.as_ptr().write(value);
    }
}

/// A function inside the game executable with the signature `F`, which must be a function pointer
/// type.
pub struct Function<F> {
    address: usize,
    _marker: PhantomData<F>,
}

impl<F: Copy> Function<F> {
    /// Evaluated when `get` is instantiated, so a non-pointer `F` fails to build.
    const POINTER_SIZED: () = assert!(
        std::mem::size_of::<F>() == std::mem::size_of::<usize>(),
        "`F` must be a function pointer type"
    );

    pub const fn new(address: usize) -> Function<F> {
        Function {
            address,
            _marker: PhantomData,
        }
    }

    pub fn address(&self) -> usize {
        self.address
    }

    /// Returns a callable pointer to the function.
    ///
    /// # Safety
    /// There must be a function with the signature `F` at the address.
    pub unsafe fn get(&self) -> F {
        let () = Self::POINTER_SIZED;

        std::mem::transmute_copy(&self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_reads_and_writes_through_address() {
        let mut slot: u32 = 7;
        let var = Var::<u32>::new(&mut slot as *mut u32 as usize);

        unsafe {
            assert_eq!(var.get(), 7);
            var.set(0xdead);
        }

        assert_eq!(slot, 0xdead);
    }

    extern "C" fn triple(x: u32) -> u32 {
        x * 3
    }

    #[test]
    fn function_calls_through_address() {
        let function =
            Function::<extern "C" fn(u32) -> u32>::new(triple as extern "C" fn(u32) -> u32 as usize);

        let callable = unsafe { function.get() };
        assert_eq!(callable(14), 42);
    }
}
