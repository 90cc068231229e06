//! Redirects game functions to our own implementations by overwriting their first bytes with a
//! jump.
//!
//! Hooks are registered up front and then applied in one go by `init`. Patching is one-way: the
//! bytes that get overwritten are not saved, so the original function can't be called afterwards
//! and nothing can be unhooked.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;

use crate::echo;

/// Opcode of `jmp rel32`.
const JMP_REL32: u8 = 0xE9;

/// Length of the patch written at each source address.
pub const PATCH_SIZE: usize = 5;

/// A request to redirect the code at `source` to `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HookDescriptor {
    /// Address of the game code that gets overwritten.
    pub source: usize,

    /// Address of the replacement function.
    pub target: usize,

    /// Name used in log messages.
    pub name: &'static str,
}

impl HookDescriptor {
    pub const fn new(source: usize, target: usize, name: &'static str) -> HookDescriptor {
        HookDescriptor {
            source,
            target,
            name,
        }
    }
}

/// Creates a `HookDescriptor` that sends calls to the game function at `$src` to `$dst`.
#[macro_export]
macro_rules! hook_function {
    ($src:literal, $dst:path) => {
        $crate::hook::HookDescriptor::new($src, $dst as usize, stringify!($dst))
    };
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("failed to write hook \"{name}\" at {address:#x}: {reason}")]
    WriteFailed {
        name: &'static str,
        address: usize,
        reason: String,
    },

    #[error("hook \"{name}\" target {target:#x} is out of jump range of {address:#x}")]
    OutOfRange {
        name: &'static str,
        address: usize,
        target: usize,
    },
}

/// Encodes a `jmp` at `source` that lands on `target`.
pub fn encode_branch(hook: &HookDescriptor) -> Result<[u8; PATCH_SIZE], PatchError> {
    let distance = hook.target as i128 - hook.source as i128 - PATCH_SIZE as i128;

    // With 32-bit addresses the displacement wraps around the address space, so truncating is
    // exact. With wider addresses it has to fit.
    let rel32 = if cfg!(target_pointer_width = "32") {
        distance as i32
    } else {
        i32::try_from(distance).map_err(|_| PatchError::OutOfRange {
            name: hook.name,
            address: hook.source,
            target: hook.target,
        })?
    };

    let mut bytes = [0u8; PATCH_SIZE];
    bytes[0] = JMP_REL32;
    bytes[1..].copy_from_slice(&rel32.to_le_bytes());

    Ok(bytes)
}

/// Something that can overwrite code in the running process.
pub trait CodeWriter {
    /// Writes `bytes` at `address`. On error, the reason is returned for logging.
    fn write_code(&self, address: usize, bytes: &[u8]) -> Result<(), String>;
}

/// Writes to the memory of the current process.
pub struct ProcessMemory;

#[cfg(windows)]
impl CodeWriter for ProcessMemory {
    fn write_code(&self, address: usize, bytes: &[u8]) -> Result<(), String> {
        use windows_sys::Win32::System::{
            Diagnostics::Debug::{FlushInstructionCache, WriteProcessMemory},
            Threading::GetCurrentProcess,
        };

        let mut written = 0usize;

        // `WriteProcessMemory` deals with the page protection of code for us.
        let ok = unsafe {
            WriteProcessMemory(
                GetCurrentProcess(),
                address as *const _,
                bytes.as_ptr().cast(),
                bytes.len(),
                &mut written,
            )
        };

        if ok == 0 {
            return Err(std::io::Error::last_os_error().to_string());
        }

        if written != bytes.len() {
            return Err(format!("only {written} of {} bytes written", bytes.len()));
        }

        unsafe {
            FlushInstructionCache(GetCurrentProcess(), address as *const _, bytes.len());
        }

        Ok(())
    }
}

/// Returns the start and length of the page-aligned span covering `len` bytes at `address`.
#[cfg(unix)]
fn page_span(address: usize, len: usize, page_size: usize) -> Result<(usize, usize), String> {
    if !page_size.is_power_of_two() {
        return Err(format!("unusable page size {page_size}"));
    }

    let start = address & !(page_size - 1);
    let end = address
        .checked_add(len)
        .ok_or_else(|| "address range overflows".to_string())?;

    Ok((start, end - start))
}

/// Code pages are assumed to be read-execute, so that is what they're left as after the write,
/// whatever they were before.
#[cfg(unix)]
impl CodeWriter for ProcessMemory {
    fn write_code(&self, address: usize, bytes: &[u8]) -> Result<(), String> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

        // -1 when the size can't be determined.
        let page_size = usize::try_from(page_size)
            .map_err(|_| format!("page size unavailable: {}", std::io::Error::last_os_error()))?;

        let (start, len) = page_span(address, bytes.len(), page_size)?;

        let protect = |flags| unsafe { libc::mprotect(start as *mut _, len, flags) == 0 };

        if !protect(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) {
            return Err(std::io::Error::last_os_error().to_string());
        }

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }

        if !protect(libc::PROT_READ | libc::PROT_EXEC) {
            return Err(std::io::Error::last_os_error().to_string());
        }

        Ok(())
    }
}

/// Hooks in the order they were registered.
#[derive(Default, Debug)]
pub struct HookRegistry {
    hooks: Vec<HookDescriptor>,
}

impl HookRegistry {
    pub const fn new() -> HookRegistry {
        HookRegistry { hooks: Vec::new() }
    }

    /// Adds a hook. Nothing is checked: a second hook on the same source is simply applied after
    /// the first.
    pub fn register(&mut self, hook: HookDescriptor) {
        self.hooks.push(hook);
    }

    pub fn all(&self) -> &[HookDescriptor] {
        &self.hooks
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Patches every hook in registration order, stopping at the first failure. Hooks applied
    /// before the failure stay applied. Returns the number of hooks applied.
    pub fn apply_all(&self, writer: &impl CodeWriter) -> Result<usize, PatchError> {
        for hook in &self.hooks {
            if let Err(err) = apply(hook, writer) {
                log::error!("Unable to hook {:#x}", hook.source);
                return Err(err);
            }
        }

        Ok(self.hooks.len())
    }
}

fn apply(hook: &HookDescriptor, writer: &impl CodeWriter) -> Result<(), PatchError> {
    let bytes = encode_branch(hook).map_err(|err| {
        log::error!("{err}");
        err
    })?;

    if let Err(reason) = writer.write_code(hook.source, &bytes) {
        log::error!("Failed to write bytes at {:#x}: {reason}", hook.source);

        return Err(PatchError::WriteFailed {
            name: hook.name,
            address: hook.source,
            reason,
        });
    }

    echo!("Hook \"{}\" applied at {:#x}", hook.name, hook.source);

    Ok(())
}

static REGISTRY: Lazy<Mutex<HookRegistry>> = Lazy::new(|| Mutex::new(HookRegistry::new()));

/// Adds a hook to the process-wide registry.
pub fn register(hook: HookDescriptor) {
    REGISTRY.lock().register(hook);
}

/// Returns a copy of the process-wide registry's hooks in registration order.
pub fn all() -> Vec<HookDescriptor> {
    REGISTRY.lock().all().to_vec()
}

/// Applies every hook in the process-wide registry to the running game. Any error means the
/// interception layer is unusable, and some hooks may already be in place.
pub fn init() -> Result<usize, PatchError> {
    REGISTRY.lock().apply_all(&ProcessMemory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Records writes instead of performing them, and fails for selected addresses.
    #[derive(Default)]
    struct FakeMemory {
        failing: Vec<usize>,
        writes: RefCell<Vec<(usize, Vec<u8>)>>,
    }

    impl CodeWriter for FakeMemory {
        fn write_code(&self, address: usize, bytes: &[u8]) -> Result<(), String> {
            if self.failing.contains(&address) {
                return Err("access denied".to_string());
            }

            self.writes.borrow_mut().push((address, bytes.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn branch_displacement_is_relative_to_next_instruction() {
        let hook = HookDescriptor::new(0x1000, 0x2000, "forward");
        assert_eq!(encode_branch(&hook).unwrap(), [0xE9, 0xFB, 0x0F, 0x00, 0x00]);

        let hook = HookDescriptor::new(0x2000, 0x1000, "backward");
        assert_eq!(encode_branch(&hook).unwrap(), [0xE9, 0xFB, 0xEF, 0xFF, 0xFF]);
    }

    #[test]
    fn branch_to_next_instruction_has_zero_displacement() {
        let hook = HookDescriptor::new(0x00424A20, 0x00424A25, "next");
        assert_eq!(encode_branch(&hook).unwrap(), [0xE9, 0, 0, 0, 0]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn distant_target_is_out_of_range() {
        let hook = HookDescriptor::new(0x1000, 0x7fff_0000_0000, "far");
        assert!(matches!(
            encode_branch(&hook),
            Err(PatchError::OutOfRange { name: "far", .. })
        ));
    }

    #[test]
    fn registry_keeps_registration_order_and_duplicates() {
        let mut registry = HookRegistry::new();
        assert!(registry.is_empty());

        registry.register(HookDescriptor::new(0x30, 0x100, "c"));
        registry.register(HookDescriptor::new(0x10, 0x100, "a"));
        registry.register(HookDescriptor::new(0x10, 0x200, "a2"));

        let names: Vec<_> = registry.all().iter().map(|hook| hook.name).collect();
        assert_eq!(names, ["c", "a", "a2"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn all_hooks_are_written_in_order() {
        let mut registry = HookRegistry::new();
        registry.register(HookDescriptor::new(0x1000, 0x5000, "first"));
        registry.register(HookDescriptor::new(0x2000, 0x6000, "second"));

        let memory = FakeMemory::default();
        assert_eq!(registry.apply_all(&memory), Ok(2));

        let writes = memory.writes.borrow();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, 0x1000);
        assert_eq!(writes[1].0, 0x2000);
        assert_eq!(writes[0].1, encode_branch(&registry.all()[0]).unwrap());
    }

    #[test]
    fn failure_stops_remaining_hooks() {
        let mut registry = HookRegistry::new();
        registry.register(HookDescriptor::new(0x1000, 0x5000, "first"));
        registry.register(HookDescriptor::new(0x2000, 0x6000, "second"));
        registry.register(HookDescriptor::new(0x3000, 0x7000, "third"));

        let memory = FakeMemory {
            failing: vec![0x2000],
            ..Default::default()
        };

        let err = registry.apply_all(&memory).unwrap_err();
        assert!(matches!(
            err,
            PatchError::WriteFailed {
                name: "second",
                address: 0x2000,
                ..
            }
        ));

        // The first hook stays applied; nothing after the failure is attempted.
        let writes = memory.writes.borrow();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x1000);
    }

    extern "C" fn replacement() {}

    #[test]
    fn macro_names_the_target_function() {
        let hook = hook_function!(0x00424A20, replacement);

        assert_eq!(hook.source, 0x00424A20);
        assert_eq!(hook.target, replacement as usize);
        assert_eq!(hook.name, "replacement");
    }

    #[cfg(unix)]
    #[test]
    fn patch_span_covers_every_page_it_touches() {
        assert_eq!(page_span(0x1000, 5, 0x1000), Ok((0x1000, 5)));
        assert_eq!(page_span(0x1ffe, 5, 0x1000), Ok((0x1000, 0x1003)));
    }

    #[cfg(unix)]
    #[test]
    fn unusable_page_size_is_an_error() {
        assert!(page_span(0x1000, 5, 0).is_err());
        assert!(page_span(0x1000, 5, 3000).is_err());
        assert!(page_span(usize::MAX - 2, 5, 0x1000).is_err());
    }

    /// Patches a jump into a real executable page and calls through it.
    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn patched_code_transfers_control_to_target() {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);

        let base = page as usize;
        let source = base;
        let original = base + 0x40;
        let target = base + 0x80;

        unsafe {
            // `source`: mov eax, 1; ret
            std::ptr::copy_nonoverlapping([0xB8, 1, 0, 0, 0, 0xC3].as_ptr(), source as *mut u8, 6);
            // `original`: mov eax, 2; ret
            std::ptr::copy_nonoverlapping([0xB8, 2, 0, 0, 0, 0xC3].as_ptr(), original as *mut u8, 6);
            // `target`: mov eax, 42; ret
            std::ptr::copy_nonoverlapping([0xB8, 42, 0, 0, 0, 0xC3].as_ptr(), target as *mut u8, 6);
        }

        let mut registry = HookRegistry::new();
        registry.register(HookDescriptor::new(source, target, "answer"));
        assert_eq!(registry.apply_all(&ProcessMemory), Ok(1));

        let call: extern "C" fn() -> u32 = unsafe { std::mem::transmute(source) };
        assert_eq!(call(), 42);

        let untouched: extern "C" fn() -> u32 = unsafe { std::mem::transmute(original) };
        assert_eq!(untouched(), 2);

        unsafe {
            libc::munmap(page, page_size);
        }
    }
}
