//! Flat memory bus with page-indexed MMIO dispatch.
//!
//! The bus owns a single 32 MiB byte plane shared by every bus master
//! (CPUs, blitter, DMA-style peripherals). Accesses to pages with no
//! device mapping take a lock-free fast path straight into the RAM
//! buffer; pages covered by a mapping fall into the slow path, which
//! dispatches to the first registered region containing the address.
//!
//! # Dispatch order (width-W access at `addr`)
//!
//! 1. `VIDEO_STATUS` (0xF0008) 32-bit reads go through the dedicated
//!    lock-free status reader when one is installed, so a guest can spin
//!    on VBlank without touching any device lock.
//! 2. Addresses at or above 0xFFFF0000 are sign-extended mirrors of the
//!    low 64 KiB and always take the slow path.
//! 3. Out-of-bounds accesses return 0 / drop the write; the `_with_fault`
//!    variants surface the failure to callers that care.
//! 4. If the page bitmap is clear (both end pages for 64-bit), the access
//!    is an unaligned native read/write on the RAM buffer.
//! 5. Everything else dispatches through the region tables.
//!
//! # Sealing
//!
//! `map_io` / `map_io64` / `set_video_status_reader` may only be called
//! before [`MemoryBus::seal_mappings`]. The seal is the one-way barrier
//! that freezes the region tables and the page bitmap, which is what
//! makes the lock-free fast path sound: after sealing, every thread
//! observes an immutable bitmap.
//!
//! # MMIO mirroring
//!
//! Slow-path reads and writes mirror the dispatched value into backing
//! RAM. The 64-bit split path depends on this: when one 32-bit half of a
//! native 64-bit register is rewritten, the untouched half is taken from
//! backing RAM rather than from `on_read64`, because device reads may
//! have side effects (clear-on-read status, FIFO pops).

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use log::warn;

/// Total bus address space: flat 32 MiB.
pub const MEM_SIZE: usize = 32 * 1024 * 1024;

/// MMIO dispatch granularity: one 256-byte page.
pub const PAGE_SIZE: usize = 256;
const PAGE_SHIFT: u32 = 8;

/// Region-table key for an address (256-byte page within the low 1 MiB).
pub const PAGE_KEY_MASK: u32 = 0xFFF00;

/// First address of the memory-mapped I/O window.
pub const IO_REGION_START: u32 = 0xA0000;

/// Last address of the memory-mapped I/O window.
pub const IO_REGION_END: u32 = 0xFFFFF;

/// Video status word (VBlank bit); read through the lock-free fast path.
pub const VIDEO_STATUS: u32 = 0xF0008;

/// Addresses at or above this are sign-extended mirrors of the low 64 KiB,
/// produced by legacy 16-bit guests loading device addresses with sign
/// extension.
pub const SIGN_EXT_BASE: u32 = 0xFFFF_0000;

/// Only regions whose `start` lies in this band participate in the
/// sign-extended mirror; the band is where a 16-bit device address
/// picks up sign extension in the first place.
pub const SIGN_EXT_SRC_START: u32 = 0x8000;
pub const SIGN_EXT_SRC_END: u32 = 0xFFFF;

pub type IoReadFn = Box<dyn Fn(u32) -> u32 + Send + Sync>;
pub type IoWriteFn = Box<dyn Fn(u32, u32) + Send + Sync>;
pub type IoRead64Fn = Box<dyn Fn(u32) -> u64 + Send + Sync>;
pub type IoWrite64Fn = Box<dyn Fn(u32, u64) + Send + Sync>;
pub type VideoStatusFn = Box<dyn Fn() -> u32 + Send + Sync>;

/// A 32-bit MMIO region. `end` is inclusive.
pub struct IoRegion {
    pub start: u32,
    pub end: u32,
    read: IoReadFn,
    write: IoWriteFn,
    /// Reachable through the sign-extended mirror (start in the
    /// `[0x8000, 0xFFFF]` band).
    mirrored: bool,
}

/// A native 64-bit MMIO region, kept in a separate table. `end` is
/// inclusive. Devices that need atomic 64-bit register semantics must
/// register one of these; a 64-bit access split across a legacy 32-bit
/// region is never atomic.
pub struct IoRegion64 {
    pub start: u32,
    pub end: u32,
    read: IoRead64Fn,
    write: IoWrite64Fn,
    /// Reachable through the sign-extended mirror (start in the
    /// `[0x8000, 0xFFFF]` band).
    mirrored: bool,
}

/// True when a region registered at `start` takes part in the
/// sign-extended mirror.
fn in_sign_ext_band(start: u32) -> bool {
    (SIGN_EXT_SRC_START..=SIGN_EXT_SRC_END).contains(&start)
}

/// How a 64-bit access that lands on a legacy 32-bit region is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum LegacyMmio64Policy {
    /// The half is a no-op (write) or zero (read); `_with_fault` reports it.
    #[default]
    Fault = 0,
    /// The half is forwarded to the 32-bit handler.
    Split = 1,
}

/// Flat 32 MiB RAM plus the MMIO dispatch tables.
///
/// Shared across threads as `Arc<MemoryBus>`. All access methods take
/// `&self`; interior mutability is documented in the `Sync` impl below.
pub struct MemoryBus {
    memory: UnsafeCell<Box<[u8]>>,
    io32: UnsafeCell<HashMap<u32, Vec<Arc<IoRegion>>>>,
    io64: UnsafeCell<HashMap<u32, Vec<Arc<IoRegion64>>>>,
    /// One flag per 256-byte page, true iff any mapping covers the page.
    /// Covers the normal range only; sign-extended mirrors are caught by
    /// the address check before the bitmap is consulted.
    io_page_bitmap: UnsafeCell<Box<[bool]>>,
    video_status: UnsafeCell<Option<VideoStatusFn>>,
    legacy_mmio64: AtomicU8,
    sealed: AtomicBool,
}

// SAFETY: the region tables, page bitmap, and video status reader are
// only mutated before `seal_mappings()`, while the bus has a single
// owner; after the seal they are immutable and read lock-free. The RAM
// buffer is guest memory: concurrent guest accesses race at the byte
// level (some stored value wins) and never touch host-side invariants.
// Device callbacks carry their own locking.
unsafe impl Sync for MemoryBus {}
unsafe impl Send for MemoryBus {}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            memory: UnsafeCell::new(vec![0u8; MEM_SIZE].into_boxed_slice()),
            io32: UnsafeCell::new(HashMap::new()),
            io64: UnsafeCell::new(HashMap::new()),
            io_page_bitmap: UnsafeCell::new(
                vec![false; MEM_SIZE >> PAGE_SHIFT].into_boxed_slice(),
            ),
            video_status: UnsafeCell::new(None),
            legacy_mmio64: AtomicU8::new(LegacyMmio64Policy::Fault as u8),
            sealed: AtomicBool::new(false),
        }
    }

    // --- Construction phase -------------------------------------------

    /// Register a 32-bit MMIO region over `[start, end]` (inclusive).
    ///
    /// A region whose `start` lies in `[0x8000, 0xFFFF]` is additionally
    /// reachable at `start | 0xFFFF0000`: sign-extended addresses are
    /// folded back to the low 64 KiB before dispatch, so no duplicate
    /// registration is needed and the mirror never appears in the
    /// fast-path bitmap. Regions starting outside that band are never
    /// dispatchable through the mirror.
    ///
    /// # Panics
    ///
    /// Panics if called after [`seal_mappings`](Self::seal_mappings), or
    /// if the range is inverted or out of bounds.
    pub fn map_io(&self, start: u32, end: u32, on_read: IoReadFn, on_write: IoWriteFn) {
        self.assert_unsealed("map_io");
        assert!(
            start <= end && (end as usize) < MEM_SIZE,
            "map_io: bad range {start:#010X}..={end:#010X}"
        );
        let region = Arc::new(IoRegion {
            start,
            end,
            read: on_read,
            write: on_write,
            mirrored: in_sign_ext_band(start),
        });
        unsafe {
            let map = &mut *self.io32.get();
            for page in ((start & !0xFF)..=end).step_by(PAGE_SIZE) {
                map.entry(page & PAGE_KEY_MASK)
                    .or_default()
                    .push(region.clone());
            }
        }
        self.mark_io_pages(start, end);
    }

    /// Register a native 64-bit MMIO region over `[start, end]`
    /// (inclusive). Registers should be 8-byte aligned; the split path
    /// assumes lane offsets of 0 or 4 within a device word.
    ///
    /// # Panics
    ///
    /// Panics if called after [`seal_mappings`](Self::seal_mappings), or
    /// if the range is inverted or out of bounds.
    pub fn map_io64(&self, start: u32, end: u32, on_read: IoRead64Fn, on_write: IoWrite64Fn) {
        self.assert_unsealed("map_io64");
        assert!(
            start <= end && (end as usize) < MEM_SIZE,
            "map_io64: bad range {start:#010X}..={end:#010X}"
        );
        let region = Arc::new(IoRegion64 {
            start,
            end,
            read: on_read,
            write: on_write,
            mirrored: in_sign_ext_band(start),
        });
        unsafe {
            let map = &mut *self.io64.get();
            for page in ((start & !0xFF)..=end).step_by(PAGE_SIZE) {
                map.entry(page & PAGE_KEY_MASK)
                    .or_default()
                    .push(region.clone());
            }
        }
        self.mark_io_pages(start, end);
    }

    /// Install the lock-free reader for the `VIDEO_STATUS` word, letting
    /// guests poll VBlank without entering the slow path.
    ///
    /// # Panics
    ///
    /// Panics if called after [`seal_mappings`](Self::seal_mappings).
    pub fn set_video_status_reader(&self, f: VideoStatusFn) {
        self.assert_unsealed("set_video_status_reader");
        unsafe {
            *self.video_status.get() = Some(f);
        }
    }

    /// Choose how 64-bit accesses landing on legacy 32-bit regions are
    /// handled. Default is [`LegacyMmio64Policy::Fault`].
    pub fn set_legacy_mmio64_policy(&self, policy: LegacyMmio64Policy) {
        self.legacy_mmio64.store(policy as u8, Ordering::Release);
    }

    /// Freeze the MMIO map and enable the lock-free fast path. One-way
    /// and idempotent.
    pub fn seal_mappings(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn assert_unsealed(&self, what: &str) {
        assert!(
            !self.sealed.load(Ordering::Acquire),
            "{what} after seal_mappings()"
        );
    }

    fn mark_io_pages(&self, start: u32, end: u32) {
        let bitmap = unsafe { &mut *self.io_page_bitmap.get() };
        for page in (start >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            bitmap[page as usize] = true;
        }
    }

    // --- RAM plane -----------------------------------------------------

    /// Zero all of RAM. The MMIO map is untouched.
    pub fn reset(&self) {
        unsafe {
            ptr::write_bytes(self.ram_ptr(), 0, MEM_SIZE);
        }
    }

    /// Shared view of the RAM plane. Bus masters may cache
    /// [`ram_ptr`](Self::ram_ptr) for non-MMIO access, but must honour
    /// the page bitmap (or a stricter rule) when deciding to bypass
    /// dispatch.
    pub fn ram(&self) -> &[u8] {
        unsafe { &(&*self.memory.get())[..] }
    }

    /// Raw pointer to the RAM plane, valid for `MEM_SIZE` bytes for the
    /// life of the bus.
    pub fn ram_ptr(&self) -> *mut u8 {
        unsafe { (*self.memory.get()).as_mut_ptr() }
    }

    #[inline]
    fn page_is_io(&self, addr: u32) -> bool {
        unsafe { (*self.io_page_bitmap.get())[(addr >> PAGE_SHIFT) as usize] }
    }

    #[inline]
    fn legacy_policy(&self) -> LegacyMmio64Policy {
        if self.legacy_mmio64.load(Ordering::Acquire) == LegacyMmio64Policy::Split as u8 {
            LegacyMmio64Policy::Split
        } else {
            LegacyMmio64Policy::Fault
        }
    }

    /// Fold a sign-extended mirror address back onto the low 64 KiB.
    #[inline]
    fn effective_addr(addr: u32) -> u32 {
        if addr >= SIGN_EXT_BASE { addr & 0xFFFF } else { addr }
    }

    // Unaligned native accessors. Callers guarantee bounds.

    #[inline]
    fn ram_read8(&self, addr: u32) -> u8 {
        unsafe { *self.ram_ptr().add(addr as usize) }
    }

    #[inline]
    fn ram_write8(&self, addr: u32, val: u8) {
        unsafe {
            *self.ram_ptr().add(addr as usize) = val;
        }
    }

    #[inline]
    fn ram_read16(&self, addr: u32) -> u16 {
        unsafe {
            u16::from_le(ptr::read_unaligned(
                self.ram_ptr().add(addr as usize) as *const u16
            ))
        }
    }

    #[inline]
    fn ram_write16(&self, addr: u32, val: u16) {
        unsafe {
            ptr::write_unaligned(self.ram_ptr().add(addr as usize) as *mut u16, val.to_le());
        }
    }

    #[inline]
    fn ram_read32(&self, addr: u32) -> u32 {
        unsafe {
            u32::from_le(ptr::read_unaligned(
                self.ram_ptr().add(addr as usize) as *const u32
            ))
        }
    }

    #[inline]
    fn ram_write32(&self, addr: u32, val: u32) {
        unsafe {
            ptr::write_unaligned(self.ram_ptr().add(addr as usize) as *mut u32, val.to_le());
        }
    }

    #[inline]
    fn ram_read64(&self, addr: u32) -> u64 {
        unsafe {
            u64::from_le(ptr::read_unaligned(
                self.ram_ptr().add(addr as usize) as *const u64
            ))
        }
    }

    #[inline]
    fn ram_write64(&self, addr: u32, val: u64) {
        unsafe {
            ptr::write_unaligned(self.ram_ptr().add(addr as usize) as *mut u64, val.to_le());
        }
    }

    // --- Region lookup -------------------------------------------------

    // `via_mirror` is true when the access arrived through a
    // sign-extended address: only regions that opted into the mirror
    // (start in the low-band) match then.

    fn find_io32(&self, addr: u32, via_mirror: bool) -> Option<&IoRegion> {
        let map = unsafe { &*self.io32.get() };
        map.get(&(addr & PAGE_KEY_MASK))?
            .iter()
            .map(|r| r.as_ref())
            .find(|r| addr >= r.start && addr <= r.end && (!via_mirror || r.mirrored))
    }

    fn find_io64(&self, addr: u32, via_mirror: bool) -> Option<&IoRegion64> {
        let map = unsafe { &*self.io64.get() };
        map.get(&(addr & PAGE_KEY_MASK))?
            .iter()
            .map(|r| r.as_ref())
            .find(|r| addr >= r.start && addr <= r.end && (!via_mirror || r.mirrored))
    }

    /// A 64-bit region covering the entire 8-byte span at `addr`.
    fn find_io64_full(&self, addr: u32, via_mirror: bool) -> Option<&IoRegion64> {
        let map = unsafe { &*self.io64.get() };
        map.get(&(addr & PAGE_KEY_MASK))?
            .iter()
            .map(|r| r.as_ref())
            .find(|r| addr >= r.start && addr + 7 <= r.end && (!via_mirror || r.mirrored))
    }

    // --- 8-bit access --------------------------------------------------

    pub fn read8(&self, addr: u32) -> u8 {
        let (val, ok) = self.read8_with_fault(addr);
        if !ok {
            warn!("read8 fault at {addr:#010X}");
        }
        val
    }

    pub fn write8(&self, addr: u32, val: u8) {
        if !self.write8_with_fault(addr, val) {
            warn!("write8 fault at {addr:#010X}");
        }
    }

    pub fn read8_with_fault(&self, addr: u32) -> (u8, bool) {
        if addr >= SIGN_EXT_BASE {
            return self.slow_read8(addr);
        }
        if addr as usize >= MEM_SIZE {
            return (0, false);
        }
        if !self.page_is_io(addr) {
            return (self.ram_read8(addr), true);
        }
        self.slow_read8(addr)
    }

    pub fn write8_with_fault(&self, addr: u32, val: u8) -> bool {
        if addr >= SIGN_EXT_BASE {
            return self.slow_write8(addr, val);
        }
        if addr as usize >= MEM_SIZE {
            return false;
        }
        if !self.page_is_io(addr) {
            self.ram_write8(addr, val);
            return true;
        }
        self.slow_write8(addr, val)
    }

    /// Sub-word MMIO reads address the containing 32-bit register: the
    /// handler is invoked on the aligned word and the lane extracted.
    fn slow_read8(&self, addr: u32) -> (u8, bool) {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize >= MEM_SIZE {
            return (0, false);
        }
        if let Some(r) = self.find_io32(e, via_mirror) {
            let word = e & !3;
            let v = (r.read)(word);
            self.ram_write32(word, v);
            return (((v >> ((e & 3) * 8)) & 0xFF) as u8, true);
        }
        // Native-64 lanes fall through to RAM: the mirror holds the value
        // last presented to the device.
        (self.ram_read8(e), true)
    }

    /// Sub-word MMIO writes merge the lane into the containing 32-bit
    /// register. The untouched lanes come from backing RAM, never from
    /// `on_read` (device reads may have side effects).
    fn slow_write8(&self, addr: u32, val: u8) -> bool {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize >= MEM_SIZE {
            return false;
        }
        if let Some(r) = self.find_io32(e, via_mirror) {
            let word = e & !3;
            let shift = (e & 3) * 8;
            let merged = (self.ram_read32(word) & !(0xFF << shift)) | ((val as u32) << shift);
            (r.write)(word, merged);
            self.ram_write32(word, merged);
            return true;
        }
        if let Some(r) = self.find_io64(e, via_mirror) {
            let base = e & !7;
            let shift = ((e & 7) * 8) as u64;
            let merged = (self.ram_read64(base) & !(0xFFu64 << shift)) | ((val as u64) << shift);
            (r.write)(base, merged);
            self.ram_write64(base, merged);
            return true;
        }
        self.ram_write8(e, val);
        true
    }

    // --- 16-bit access -------------------------------------------------

    pub fn read16(&self, addr: u32) -> u16 {
        let (val, ok) = self.read16_with_fault(addr);
        if !ok {
            warn!("read16 fault at {addr:#010X}");
        }
        val
    }

    pub fn write16(&self, addr: u32, val: u16) {
        if !self.write16_with_fault(addr, val) {
            warn!("write16 fault at {addr:#010X}");
        }
    }

    pub fn read16_with_fault(&self, addr: u32) -> (u16, bool) {
        if addr >= SIGN_EXT_BASE {
            return self.slow_read16(addr);
        }
        if addr as usize + 2 > MEM_SIZE {
            return (0, false);
        }
        if !self.page_is_io(addr) {
            return (self.ram_read16(addr), true);
        }
        self.slow_read16(addr)
    }

    pub fn write16_with_fault(&self, addr: u32, val: u16) -> bool {
        if addr >= SIGN_EXT_BASE {
            return self.slow_write16(addr, val);
        }
        if addr as usize + 2 > MEM_SIZE {
            return false;
        }
        if !self.page_is_io(addr) {
            self.ram_write16(addr, val);
            return true;
        }
        self.slow_write16(addr, val)
    }

    fn slow_read16(&self, addr: u32) -> (u16, bool) {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 2 > MEM_SIZE {
            return (0, false);
        }
        if let Some(r) = self.find_io32(e, via_mirror)
            && (e & 3) <= 2
        {
            let word = e & !3;
            let v = (r.read)(word);
            self.ram_write32(word, v);
            return (((v >> ((e & 3) * 8)) & 0xFFFF) as u16, true);
        }
        // Lane straddling a word boundary, or a native-64 lane: RAM mirror.
        (self.ram_read16(e), true)
    }

    fn slow_write16(&self, addr: u32, val: u16) -> bool {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 2 > MEM_SIZE {
            return false;
        }
        if let Some(r) = self.find_io32(e, via_mirror)
            && (e & 3) <= 2
        {
            let word = e & !3;
            let shift = (e & 3) * 8;
            let merged = (self.ram_read32(word) & !(0xFFFF << shift)) | ((val as u32) << shift);
            (r.write)(word, merged);
            self.ram_write32(word, merged);
            return true;
        }
        if let Some(r) = self.find_io64(e, via_mirror)
            && (e & 7) <= 6
        {
            let base = e & !7;
            let shift = ((e & 7) * 8) as u64;
            let merged =
                (self.ram_read64(base) & !(0xFFFFu64 << shift)) | ((val as u64) << shift);
            (r.write)(base, merged);
            self.ram_write64(base, merged);
            return true;
        }
        self.ram_write16(e, val);
        true
    }

    // --- 32-bit access -------------------------------------------------

    pub fn read32(&self, addr: u32) -> u32 {
        let (val, ok) = self.read32_with_fault(addr);
        if !ok {
            warn!("read32 fault at {addr:#010X}");
        }
        val
    }

    pub fn write32(&self, addr: u32, val: u32) {
        if !self.write32_with_fault(addr, val) {
            warn!("write32 fault at {addr:#010X}");
        }
    }

    pub fn read32_with_fault(&self, addr: u32) -> (u32, bool) {
        if addr == VIDEO_STATUS
            && let Some(f) = unsafe { (*self.video_status.get()).as_ref() }
        {
            return (f(), true);
        }
        if addr >= SIGN_EXT_BASE {
            return self.slow_read32(addr);
        }
        if addr as usize + 4 > MEM_SIZE {
            return (0, false);
        }
        if !self.page_is_io(addr) {
            return (self.ram_read32(addr), true);
        }
        self.slow_read32(addr)
    }

    pub fn write32_with_fault(&self, addr: u32, val: u32) -> bool {
        if addr >= SIGN_EXT_BASE {
            return self.slow_write32(addr, val);
        }
        if addr as usize + 4 > MEM_SIZE {
            return false;
        }
        if !self.page_is_io(addr) {
            self.ram_write32(addr, val);
            return true;
        }
        self.slow_write32(addr, val)
    }

    fn slow_read32(&self, addr: u32) -> (u32, bool) {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 4 > MEM_SIZE {
            return (0, false);
        }
        if let Some(r) = self.find_io32(e, via_mirror) {
            let v = (r.read)(e);
            // Mirror so later RAM-plane reads see the last dispatched value.
            self.ram_write32(e, v);
            return (v, true);
        }
        // A 32-bit lane of a native-64 register reads the RAM mirror, the
        // same rule as the 64-bit split halves; plain RAM otherwise.
        (self.ram_read32(e), true)
    }

    fn slow_write32(&self, addr: u32, val: u32) -> bool {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 4 > MEM_SIZE {
            return false;
        }
        if let Some(r) = self.find_io32(e, via_mirror) {
            (r.write)(e, val);
            self.ram_write32(e, val);
            return true;
        }
        if let Some(r) = self.find_io64(e, via_mirror)
            && (e & 7) <= 4
        {
            // Rewrite one half of a native 64-bit register: the other
            // half comes from backing RAM, the full word goes through
            // the device.
            let base = e & !7;
            let shift = ((e & 7) * 8) as u64;
            let merged = (self.ram_read64(base) & !(0xFFFF_FFFFu64 << shift))
                | ((val as u64) << shift);
            (r.write)(base, merged);
            self.ram_write64(base, merged);
            return true;
        }
        self.ram_write32(e, val);
        true
    }

    // --- 64-bit access -------------------------------------------------

    pub fn read64(&self, addr: u32) -> u64 {
        let (val, ok) = self.read64_with_fault(addr);
        if !ok {
            warn!("read64 fault at {addr:#010X}");
        }
        val
    }

    pub fn write64(&self, addr: u32, val: u64) {
        if !self.write64_with_fault(addr, val) {
            warn!("write64 fault at {addr:#010X}");
        }
    }

    pub fn read64_with_fault(&self, addr: u32) -> (u64, bool) {
        if addr >= SIGN_EXT_BASE {
            return self.slow_read64(addr);
        }
        if addr as usize + 8 > MEM_SIZE {
            return (0, false);
        }
        if !self.page_is_io(addr) && !self.page_is_io(addr + 7) {
            return (self.ram_read64(addr), true);
        }
        self.slow_read64(addr)
    }

    pub fn write64_with_fault(&self, addr: u32, val: u64) -> bool {
        if addr >= SIGN_EXT_BASE {
            return self.slow_write64(addr, val);
        }
        if addr as usize + 8 > MEM_SIZE {
            return false;
        }
        if !self.page_is_io(addr) && !self.page_is_io(addr + 7) {
            self.ram_write64(addr, val);
            return true;
        }
        self.slow_write64(addr, val)
    }

    fn slow_read64(&self, addr: u32) -> (u64, bool) {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 8 > MEM_SIZE {
            return (0, false);
        }
        if let Some(r) = self.find_io64_full(e, via_mirror) {
            let v = (r.read)(e);
            self.ram_write64(e, v);
            return (v, true);
        }
        // Split into two 32-bit halves, low first.
        let (lo, lo_ok) = self.split_half_read(e, via_mirror);
        let (hi, hi_ok) = self.split_half_read(e + 4, via_mirror);
        ((lo as u64) | ((hi as u64) << 32), lo_ok && hi_ok)
    }

    fn slow_write64(&self, addr: u32, val: u64) -> bool {
        let via_mirror = addr >= SIGN_EXT_BASE;
        let e = Self::effective_addr(addr);
        if e as usize + 8 > MEM_SIZE {
            return false;
        }
        if let Some(r) = self.find_io64_full(e, via_mirror) {
            (r.write)(e, val);
            self.ram_write64(e, val);
            return true;
        }
        let lo_ok = self.split_half_write(e, val as u32, via_mirror);
        let hi_ok = self.split_half_write(e + 4, (val >> 32) as u32, via_mirror);
        lo_ok && hi_ok
    }

    /// One 32-bit half of a split 64-bit read.
    fn split_half_read(&self, addr: u32, via_mirror: bool) -> (u32, bool) {
        if self.find_io64(addr, via_mirror).is_some() {
            // The RAM mirror is the value last presented to the device;
            // `on_read64` may clear-on-read or pop a FIFO, so the split
            // never invokes it.
            return (self.ram_read32(addr), true);
        }
        if let Some(r) = self.find_io32(addr, via_mirror) {
            if self.legacy_policy() == LegacyMmio64Policy::Split {
                let v = (r.read)(addr);
                self.ram_write32(addr, v);
                return (v, true);
            }
            return (0, false);
        }
        (self.ram_read32(addr), true)
    }

    /// One 32-bit half of a split 64-bit write.
    fn split_half_write(&self, addr: u32, val: u32, via_mirror: bool) -> bool {
        if let Some(r) = self.find_io64(addr, via_mirror)
            && (addr & 7) <= 4
        {
            let base = addr & !7;
            let shift = ((addr & 7) * 8) as u64;
            let merged = (self.ram_read64(base) & !(0xFFFF_FFFFu64 << shift))
                | ((val as u64) << shift);
            (r.write)(base, merged);
            self.ram_write64(base, merged);
            return true;
        }
        if let Some(r) = self.find_io32(addr, via_mirror) {
            if self.legacy_policy() == LegacyMmio64Policy::Split {
                (r.write)(addr, val);
                self.ram_write32(addr, val);
                return true;
            }
            return false;
        }
        self.ram_write32(addr, val);
        true
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}
