//! Component A: the memory-mapping engine.
//!
//! Owns page-aligned `/dev/mem`-style views of physical memory and performs
//! typed, fault-tolerant load/store through them. A `SIGBUS` raised by the
//! device while a typed access is in flight is caught and turned into
//! `has_failed = true` instead of killing the process, via the classic
//! `sigsetjmp`/`siglongjmp` recovery pattern.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ffi::c_int;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::MmapMut;

use crate::error::{MempeekError, MempeekResult, RuntimeError};
use crate::location::SourceLocation;

const DEFAULT_DEVICE: &str = "/dev/mem";

/// Opaque, oversized `sigjmp_buf`. The real layout is platform-defined and we
/// never inspect it from Rust; only `__sigsetjmp`/`siglongjmp` touch it.
#[repr(C, align(16))]
struct SigJmpBuf([u8; 256]);

/// Process-wide fault recovery state. Single-threaded by design (see module
/// docs in `crate::mapping` and the concurrency notes in the interpreter's
/// design doc): only ever touched from the interpreter thread, except for the
/// `SIGBUS` handler itself which runs on that same thread synchronously.
struct SignalRecovery {
    enabled: AtomicBool,
    buf: Cell<SigJmpBuf>,
}

// SAFETY: access is serialized by the single-threaded execution model; the
// `Cell` is only mutated while `enabled` is set, and only from the thread
// that set it (or the signal handler interrupting that same thread).
unsafe impl Sync for SignalRecovery {}

static RECOVERY: SignalRecovery = SignalRecovery {
    enabled: AtomicBool::new(false),
    buf: Cell::new(SigJmpBuf([0; 256])),
};

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" {
    #[link_name = "__sigsetjmp"]
    fn sigsetjmp(env: *mut SigJmpBuf, savesigs: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

extern "C" fn sigbus_handler(_signum: c_int) {
    if RECOVERY.enabled.load(Ordering::SeqCst) {
        unsafe {
            siglongjmp(RECOVERY.buf.as_ptr(), 1);
        }
    }
}

/// Installs the process-wide `SIGBUS` handler. Idempotent; call once at
/// startup before any `peek`/`poke` is attempted. The core never installs
/// this on its own — the driver is responsible, per the external interface
/// contract — but tests call it directly since they exercise the engine
/// without a driver.
pub fn install_signal_handler() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigbus_handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGBUS, &sa, std::ptr::null_mut());
    }
}

/// Runs `f`, which must perform exactly one volatile access, under the fault
/// recovery protocol. Returns `true` if the access completed, `false` if it
/// faulted.
fn guarded_access<F: FnOnce()>(f: F) -> bool {
    RECOVERY.enabled.store(false, Ordering::SeqCst);
    let jumped = unsafe { sigsetjmp(RECOVERY.buf.as_ptr(), 1) };
    let ok = if jumped == 0 {
        RECOVERY.enabled.store(true, Ordering::SeqCst);
        f();
        true
    } else {
        false
    };
    RECOVERY.enabled.store(false, Ordering::SeqCst);
    ok
}

/// A single page-aligned live view onto a device, keyed by its logical `at`
/// address for lookup purposes.
pub struct Mapping {
    at: u64,
    phys_base: u64,
    size: u64,
    page_offset: u64,
    mapping_size: usize,
    mmap: MmapMut,
    has_failed: Cell<bool>,
}

impl Mapping {
    fn virt_base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn at(&self) -> u64 {
        self.at
    }

    pub fn phys_base(&self) -> u64 {
        self.phys_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.get()
    }

    fn virt_addr_for(&self, query: u64) -> *mut u8 {
        let offset = (query - self.at) + self.page_offset;
        unsafe { self.virt_base().add(offset as usize) }
    }

    pub fn peek_u8(&self, query: u64) -> u8 {
        self.peek_typed::<u8>(query)
    }
    pub fn peek_u16(&self, query: u64) -> u16 {
        self.peek_typed::<u16>(query)
    }
    pub fn peek_u32(&self, query: u64) -> u32 {
        self.peek_typed::<u32>(query)
    }
    pub fn peek_u64(&self, query: u64) -> u64 {
        self.peek_typed::<u64>(query)
    }

    fn peek_typed<T: Copy + Default>(&self, query: u64) -> T {
        let addr = self.virt_addr_for(query) as *const T;
        let mut out = T::default();
        self.has_failed.set(false);
        let ok = guarded_access(|| unsafe {
            out = std::ptr::read_volatile(addr);
        });
        if !ok {
            self.has_failed.set(true);
        }
        out
    }

    pub fn poke_u8(&self, query: u64, value: u8) {
        self.poke_typed(query, value)
    }
    pub fn poke_u16(&self, query: u64, value: u16) {
        self.poke_typed(query, value)
    }
    pub fn poke_u32(&self, query: u64, value: u32) {
        self.poke_typed(query, value)
    }
    pub fn poke_u64(&self, query: u64, value: u64) {
        self.poke_typed(query, value)
    }

    fn poke_typed<T: Copy>(&self, query: u64, value: T) {
        let addr = self.virt_addr_for(query) as *mut T;
        self.has_failed.set(false);
        let ok = guarded_access(|| unsafe {
            std::ptr::write_volatile(addr, value);
        });
        if !ok {
            self.has_failed.set(true);
        }
    }

    /// `*addr |= mask`, unmasked write-back of a read-modify-write.
    pub fn set_bits(&self, query: u64, mask: u64, width_bytes: u32) {
        self.rmw(query, width_bytes, |v| v | mask);
    }

    /// `*addr &= !mask`.
    pub fn clear_bits(&self, query: u64, mask: u64, width_bytes: u32) {
        self.rmw(query, width_bytes, |v| v & !mask);
    }

    /// `*addr ^= mask`.
    pub fn toggle_bits(&self, query: u64, mask: u64, width_bytes: u32) {
        self.rmw(query, width_bytes, |v| v ^ mask);
    }

    fn rmw(&self, query: u64, width_bytes: u32, f: impl Fn(u64) -> u64) {
        match width_bytes {
            1 => {
                let cur = self.peek_u8(query) as u64;
                if !self.has_failed() {
                    self.poke_u8(query, f(cur) as u8);
                }
            }
            2 => {
                let cur = self.peek_u16(query) as u64;
                if !self.has_failed() {
                    self.poke_u16(query, f(cur) as u16);
                }
            }
            4 => {
                let cur = self.peek_u32(query) as u64;
                if !self.has_failed() {
                    self.poke_u32(query, f(cur) as u32);
                }
            }
            8 => {
                let cur = self.peek_u64(query);
                if !self.has_failed() {
                    self.poke_u64(query, f(cur));
                }
            }
            _ => unreachable!("width_bytes must be 1/2/4/8"),
        }
    }
}

/// Keyed collection of live mappings; component A's top-level handle.
#[derive(Default)]
pub struct MappingEngine {
    mappings: BTreeMap<u64, Mapping>,
    default_device: Option<PathBuf>,
}

impl MappingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides `/dev/mem` as the device opened when a `map(...)` statement
    /// doesn't name one explicitly (set from `--device`).
    pub fn set_default_device(&mut self, device: PathBuf) {
        self.default_device = Some(device);
    }

    /// Creates (or idempotently accepts an existing) mapping. Returns the
    /// `at` key to look the mapping back up by, or a compile error if the
    /// device could not be opened/mapped.
    pub fn create(
        &mut self,
        location: &SourceLocation,
        phys_base: u64,
        at: u64,
        size: u64,
        device: Option<&Path>,
    ) -> MempeekResult<u64> {
        if let Some(existing) = self.lookup(at, size) {
            return Ok(existing.at());
        }

        let device_path: PathBuf = device
            .map(Path::to_path_buf)
            .or_else(|| self.default_device.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEVICE));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(0)
            .open(&device_path)
            .map_err(|_| {
                MempeekError::Compile(crate::error::CompileError::MappingFailure {
                    location: location.clone(),
                    address: phys_base,
                    size,
                    device: device_path.display().to_string(),
                })
            })?;

        let page_size = page_size() as u64;
        let page_offset = phys_base % page_size;
        let page_addr = phys_base - page_offset;

        let mut mapping_size = size + page_offset;
        let remainder = mapping_size % page_size;
        if remainder != 0 {
            mapping_size += page_size - remainder;
        }

        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(page_addr)
                .len(mapping_size as usize)
                .map_mut(&file)
        }
        .map_err(|_| {
            MempeekError::Compile(crate::error::CompileError::MappingFailure {
                location: location.clone(),
                address: phys_base,
                size,
                device: device_path.display().to_string(),
            })
        })?;

        let mapping = Mapping {
            at,
            phys_base,
            size,
            page_offset,
            mapping_size: mapping_size as usize,
            mmap,
            has_failed: Cell::new(false),
        };
        self.mappings.insert(at, mapping);
        Ok(at)
    }

    /// Finds the mapping with the largest `at <= query` that also covers
    /// `[query, query + access_size)`.
    pub fn lookup(&self, query: u64, access_size: u64) -> Option<&Mapping> {
        self.mappings
            .range(..=query)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.at + m.size >= query + access_size)
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_device(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn create_and_lookup() {
        install_signal_handler();
        let device = make_device(8192);
        let mut engine = MappingEngine::new();
        let loc = SourceLocation::builtin();
        let at = engine.create(&loc, 0x1000, 0x1000, 0x100, Some(device.path())).unwrap();
        assert_eq!(at, 0x1000);
        assert!(engine.lookup(0x1010, 1).is_some());
        assert!(engine.lookup(0x2000, 1).is_none());
    }

    #[test]
    fn idempotent_remap() {
        install_signal_handler();
        let device = make_device(8192);
        let mut engine = MappingEngine::new();
        let loc = SourceLocation::builtin();
        engine.create(&loc, 0x1000, 0x1000, 0x100, Some(device.path())).unwrap();
        let result = engine.create(&loc, 0x1000, 0x1000, 0x100, Some(device.path()));
        assert!(result.is_ok());
        assert_eq!(engine.mappings.len(), 1);
    }

    #[test]
    fn peek_poke_roundtrip() {
        install_signal_handler();
        let device = make_device(8192);
        let mut engine = MappingEngine::new();
        let loc = SourceLocation::builtin();
        let at = engine.create(&loc, 0x1000, 0x1000, 0x100, Some(device.path())).unwrap();
        let mapping = engine.lookup(at, 1).unwrap();
        mapping.poke_u8(0x1010, 0x55);
        assert!(!mapping.has_failed());
        assert_eq!(mapping.peek_u8(0x1010), 0x55);

        mapping.set_bits(0x1010, 0x0F, 1);
        assert_eq!(mapping.peek_u8(0x1010), 0x5F);
        mapping.clear_bits(0x1010, 0xF0, 1);
        assert_eq!(mapping.peek_u8(0x1010), 0x0F);
        mapping.toggle_bits(0x1010, 0xFF, 1);
        assert_eq!(mapping.peek_u8(0x1010), 0xF0);
    }
}
