//! Raster coprocessor — command-driven 2D blitter
//!
//! A register-file-driven block engine attached to the bus as MMIO. The
//! CPU programs the data registers, then writes the start bit to
//! `BLT_CTRL`; the job runs to completion in one batch on whichever
//! thread calls [`Blitter::run_one_job`] and the busy bit clears. All
//! pixel traffic goes through the bus so CPU-written data is always
//! visible, and every operation works on 4-byte BGRA pixels.
//!
//! # Register map (offsets from `BLT_BASE`)
//!
//! | Offset | Name           | Description                                |
//! |--------|----------------|--------------------------------------------|
//! | -0x04  | BLT_CTRL       | write bit 0 = start; read bit 0 = busy, bit 1 = error |
//! | +0x00  | BLT_OP         | 0=copy, 1=fill, 2=line, 3=masked copy, 5=mode7 |
//! | +0x04  | BLT_SRC        | source address, or packed (x1,y1) for line |
//! | +0x08  | BLT_DST        | destination address, or packed (x2,y2)     |
//! | +0x0C  | BLT_WIDTH      | rectangle width in pixels                  |
//! | +0x10  | BLT_HEIGHT     | rectangle height in pixels                 |
//! | +0x14  | BLT_SRC_STRIDE | bytes per source row (0 = default)         |
//! | +0x18  | BLT_DST_STRIDE | bytes per destination row (0 = default)    |
//! | +0x1C  | BLT_COLOR      | fill / line colour                         |
//! | +0x20  | BLT_MASK       | address of 1-bit-per-pixel mask (MSB first)|
//! | +0x24  | BLT_U0         | Mode-7 start U (16.16)                     |
//! | +0x28  | BLT_V0         | Mode-7 start V (16.16)                     |
//! | +0x2C  | BLT_DU_COL     | Mode-7 dU per destination column (16.16)   |
//! | +0x30  | BLT_DV_COL     | Mode-7 dV per destination column (16.16)   |
//! | +0x34  | BLT_DU_ROW     | Mode-7 dU per destination row (16.16)      |
//! | +0x38  | BLT_DV_ROW     | Mode-7 dV per destination row (16.16)      |
//! | +0x3C  | BLT_TEX_W      | Mode-7 texture width mask (2^n - 1)        |
//! | +0x40  | BLT_TEX_H      | Mode-7 texture height mask (2^n - 1)       |
//! | +0x44  | BLT_STATUS     | bit 0 = error latch                        |
//!
//! A latched error is sticky across jobs: it clears on the next start,
//! or on an explicit write to `BLT_STATUS`. Reads never clear it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::core::bus::{MEM_SIZE, MemoryBus};

/// Base of the blitter data registers.
pub const BLT_BASE: u32 = 0xF0020;

/// Control word: write bit 0 to start, read back busy/error.
pub const BLT_CTRL: u32 = BLT_BASE - 0x04;

/// Latched error status word.
pub const BLT_STATUS: u32 = BLT_BASE + 0x44;

/// Start of the default VRAM plane. A pixel at (x, y) lives at
/// `VRAM_START + (y * mode.width + x) * 4`.
pub const VRAM_START: u32 = 0x0010_0000;

pub const CTRL_START: u32 = 0x01;
pub const CTRL_BUSY: u32 = 0x01;
pub const CTRL_ERROR: u32 = 0x02;
pub const STATUS_ERROR: u32 = 0x01;

// BLT_OP values
pub const OP_COPY: u32 = 0;
pub const OP_FILL: u32 = 1;
pub const OP_LINE: u32 = 2;
pub const OP_MASKED_COPY: u32 = 3;
pub const OP_MODE7: u32 = 5;

/// Dirty-tile granularity over the VRAM plane.
const TILE_SIZE: u32 = 16;

/// Display geometry of the VRAM plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoMode {
    pub width: u32,
    pub height: u32,
}

impl VideoMode {
    pub const DEFAULT: VideoMode = VideoMode {
        width: 640,
        height: 480,
    };

    pub fn bytes_per_row(&self) -> u32 {
        self.width * 4
    }

    pub fn plane_bytes(&self) -> u32 {
        self.height * self.bytes_per_row()
    }
}

/// Snapshot of the data registers; one queued job.
#[derive(Clone, Copy, Debug, Default)]
struct BlitRegs {
    op: u32,
    src: u32,
    dst: u32,
    width: u32,
    height: u32,
    src_stride: u32,
    dst_stride: u32,
    color: u32,
    mask: u32,
    u0: u32,
    v0: u32,
    du_col: u32,
    dv_col: u32,
    du_row: u32,
    dv_row: u32,
    tex_w: u32,
    tex_h: u32,
}

enum BlitFault {
    Misaligned(u32),
    MaskNotPow2(u32, u32),
    OutOfBounds,
}

impl fmt::Display for BlitFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Misaligned(addr) => write!(f, "misaligned VRAM address {addr:#010X}"),
            Self::MaskNotPow2(w, h) => {
                write!(f, "texture masks {w:#X}/{h:#X} are not 2^n - 1")
            }
            Self::OutOfBounds => write!(f, "rectangle exceeds address space"),
        }
    }
}

/// Dirty 16x16 tiles over the VRAM plane, consumed by a compositor to
/// skip clean tiles. Bookkeeping only; no blit semantics depend on it.
struct DirtyTiles {
    tiles: Vec<bool>,
    cols: u32,
}

impl DirtyTiles {
    fn new(mode: VideoMode) -> Self {
        let cols = mode.width.div_ceil(TILE_SIZE);
        let rows = mode.height.div_ceil(TILE_SIZE);
        Self {
            tiles: vec![false; (cols * rows) as usize],
            cols,
        }
    }

    fn mark(&mut self, px: u32, py: u32, w: u32, h: u32) {
        if w == 0 || h == 0 {
            return;
        }
        let rows = self.tiles.len() as u32 / self.cols;
        let tx0 = px / TILE_SIZE;
        let ty0 = py / TILE_SIZE;
        let tx1 = ((px + w - 1) / TILE_SIZE).min(self.cols.saturating_sub(1));
        let ty1 = ((py + h - 1) / TILE_SIZE).min(rows.saturating_sub(1));
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                self.tiles[(ty * self.cols + tx) as usize] = true;
            }
        }
    }
}

/// The blitter device. Shared as `Arc<Blitter>`: MMIO closures clone the
/// handle, a frame runner drains the job queue.
pub struct Blitter {
    bus: Arc<MemoryBus>,
    mode: VideoMode,
    regs: Mutex<BlitRegs>,
    jobs: Mutex<VecDeque<BlitRegs>>,
    busy: AtomicBool,
    error: AtomicBool,
    dirty: Mutex<DirtyTiles>,
}

impl Blitter {
    pub fn new(bus: Arc<MemoryBus>, mode: VideoMode) -> Self {
        Self {
            bus,
            mode,
            regs: Mutex::new(BlitRegs::default()),
            jobs: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            error: AtomicBool::new(false),
            dirty: Mutex::new(DirtyTiles::new(mode)),
        }
    }

    /// Register the blitter's MMIO window on the bus. Must run before
    /// `seal_mappings()`.
    pub fn map(self: &Arc<Self>, bus: &MemoryBus) {
        let rd = self.clone();
        let wr = self.clone();
        bus.map_io(
            BLT_CTRL,
            BLT_STATUS,
            Box::new(move |addr| rd.read_register(addr)),
            Box::new(move |addr, val| wr.write_register(addr, val)),
        );
    }

    pub fn mode(&self) -> VideoMode {
        self.mode
    }

    /// Read a blitter register over the bus.
    pub fn read_register(&self, addr: u32) -> u32 {
        if addr == BLT_CTRL {
            let mut v = 0;
            if self.busy.load(Ordering::Acquire) {
                v |= CTRL_BUSY;
            }
            if self.error.load(Ordering::Acquire) {
                v |= CTRL_ERROR;
            }
            return v;
        }
        if addr == BLT_STATUS {
            return if self.error.load(Ordering::Acquire) {
                STATUS_ERROR
            } else {
                0
            };
        }
        let r = self.regs.lock().unwrap();
        match addr.wrapping_sub(BLT_BASE) {
            0x00 => r.op,
            0x04 => r.src,
            0x08 => r.dst,
            0x0C => r.width,
            0x10 => r.height,
            0x14 => r.src_stride,
            0x18 => r.dst_stride,
            0x1C => r.color,
            0x20 => r.mask,
            0x24 => r.u0,
            0x28 => r.v0,
            0x2C => r.du_col,
            0x30 => r.dv_col,
            0x34 => r.du_row,
            0x38 => r.dv_row,
            0x3C => r.tex_w,
            0x40 => r.tex_h,
            _ => 0,
        }
    }

    /// Write a blitter register over the bus. A start-bit write to
    /// `BLT_CTRL` snapshots the register file into a queued job.
    pub fn write_register(&self, addr: u32, val: u32) {
        if addr == BLT_CTRL {
            if val & CTRL_START != 0 {
                self.start_job();
            }
            return;
        }
        if addr == BLT_STATUS {
            // Explicit write clears the latch; reads never do.
            self.error.store(false, Ordering::Release);
            return;
        }
        let mut r = self.regs.lock().unwrap();
        match addr.wrapping_sub(BLT_BASE) {
            0x00 => r.op = val,
            0x04 => r.src = val,
            0x08 => r.dst = val,
            0x0C => r.width = val,
            0x10 => r.height = val,
            0x14 => r.src_stride = val,
            0x18 => r.dst_stride = val,
            0x1C => r.color = val,
            0x20 => r.mask = val,
            0x24 => r.u0 = val,
            0x28 => r.v0 = val,
            0x2C => r.du_col = val,
            0x30 => r.dv_col = val,
            0x34 => r.du_row = val,
            0x38 => r.dv_row = val,
            0x3C => r.tex_w = val,
            0x40 => r.tex_h = val,
            _ => {}
        }
    }

    fn start_job(&self) {
        let snapshot = *self.regs.lock().unwrap();
        self.error.store(false, Ordering::Release);
        self.busy.store(true, Ordering::Release);
        self.jobs.lock().unwrap().push_back(snapshot);
    }

    /// Execute one queued job to completion on the calling thread.
    /// Returns false when the queue was empty.
    pub fn run_one_job(&self) -> bool {
        let job = match self.jobs.lock().unwrap().pop_front() {
            Some(j) => j,
            None => {
                self.busy.store(false, Ordering::Release);
                return false;
            }
        };

        let result = match job.op {
            OP_COPY => self.op_copy(&job, false),
            OP_FILL => self.op_fill(&job),
            OP_LINE => self.op_line(&job),
            OP_MASKED_COPY => self.op_copy(&job, true),
            OP_MODE7 => self.op_mode7(&job),
            // Unknown command values are no-ops.
            _ => Ok(()),
        };

        if let Err(fault) = result {
            warn!("blitter: {fault}");
            self.error.store(true, Ordering::Release);
        }
        if self.jobs.lock().unwrap().is_empty() {
            self.busy.store(false, Ordering::Release);
        }
        true
    }

    /// Execute every queued job to completion on the calling thread.
    /// The frame runner calls this once per frame; a dedicated blitter
    /// thread would loop on it instead.
    pub fn drain_jobs(&self) {
        while self.run_one_job() {}
    }

    /// Test hook: synchronous drain.
    pub fn run_for_test(&self) {
        self.drain_jobs();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn error_latched(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Take the set of dirty tile coordinates accumulated since the last
    /// call, clearing it.
    pub fn take_dirty_tiles(&self) -> Vec<(u32, u32)> {
        let mut dirty = self.dirty.lock().unwrap();
        let cols = dirty.cols;
        let mut out = Vec::new();
        for (idx, flag) in dirty.tiles.iter_mut().enumerate() {
            if *flag {
                *flag = false;
                out.push((idx as u32 % cols, idx as u32 / cols));
            }
        }
        out
    }

    // --- Geometry helpers ----------------------------------------------

    fn in_vram(&self, addr: u32) -> bool {
        addr >= VRAM_START && addr < VRAM_START + self.mode.plane_bytes()
    }

    /// Zero strides default to the video mode's row pitch inside the
    /// VRAM plane, and to a tightly packed `width * 4` elsewhere.
    fn resolve_stride(&self, stride: u32, addr: u32, width: u32) -> u32 {
        if stride != 0 {
            stride
        } else if self.in_vram(addr) {
            self.mode.bytes_per_row()
        } else {
            width * 4
        }
    }

    fn check_plane_alignment(&self, addr: u32) -> Result<(), BlitFault> {
        if self.in_vram(addr) && addr & 3 != 0 {
            return Err(BlitFault::Misaligned(addr));
        }
        Ok(())
    }

    fn check_rect_bounds(
        base: u32,
        stride: u32,
        width: u32,
        height: u32,
    ) -> Result<(), BlitFault> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let last = base as u64 + (height as u64 - 1) * stride as u64 + width as u64 * 4;
        if last > MEM_SIZE as u64 {
            return Err(BlitFault::OutOfBounds);
        }
        Ok(())
    }

    fn mark_dirty_rect(&self, dst: u32, width: u32, height: u32) {
        if !self.in_vram(dst) {
            return;
        }
        let pixel = (dst - VRAM_START) / 4;
        let px = pixel % self.mode.width;
        let py = pixel / self.mode.width;
        self.dirty.lock().unwrap().mark(px, py, width, height);
    }

    // --- Operations -----------------------------------------------------

    /// Rectangle copy, rows top to bottom, pixels left to right. In
    /// masked mode a 1-bit-per-pixel bitmap gates each pixel: bit set
    /// copies, bit clear skips. Mask rows are packed tight, MSB first.
    fn op_copy(&self, j: &BlitRegs, masked: bool) -> Result<(), BlitFault> {
        let src_stride = self.resolve_stride(j.src_stride, j.src, j.width);
        let dst_stride = self.resolve_stride(j.dst_stride, j.dst, j.width);
        self.check_plane_alignment(j.src)?;
        self.check_plane_alignment(j.dst)?;
        Self::check_rect_bounds(j.src, src_stride, j.width, j.height)?;
        Self::check_rect_bounds(j.dst, dst_stride, j.width, j.height)?;

        let mask_row_bytes = j.width.div_ceil(8);
        for y in 0..j.height {
            for x in 0..j.width {
                if masked {
                    let byte = self.bus.read8(j.mask + y * mask_row_bytes + x / 8);
                    if byte & (0x80 >> (x % 8)) == 0 {
                        continue;
                    }
                }
                let pixel = self.bus.read32(j.src + y * src_stride + x * 4);
                self.bus.write32(j.dst + y * dst_stride + x * 4, pixel);
            }
        }
        self.mark_dirty_rect(j.dst, j.width, j.height);
        Ok(())
    }

    /// Solid rectangle fill with `BLT_COLOR`.
    fn op_fill(&self, j: &BlitRegs) -> Result<(), BlitFault> {
        let dst_stride = self.resolve_stride(j.dst_stride, j.dst, j.width);
        self.check_plane_alignment(j.dst)?;
        Self::check_rect_bounds(j.dst, dst_stride, j.width, j.height)?;

        for y in 0..j.height {
            let row = j.dst + y * dst_stride;
            for x in 0..j.width {
                self.bus.write32(row + x * 4, j.color);
            }
        }
        self.mark_dirty_rect(j.dst, j.width, j.height);
        Ok(())
    }

    /// One-pixel line from (x1,y1) to (x2,y2), both endpoints inclusive,
    /// drawn into the default VRAM plane. Coordinates pack x in the low
    /// 16 bits and y in the high 16 of `BLT_SRC`/`BLT_DST`. Bresenham
    /// with both-axis stepping; pixels outside the mode rectangle are
    /// clipped.
    fn op_line(&self, j: &BlitRegs) -> Result<(), BlitFault> {
        let mut x = (j.src & 0xFFFF) as i32;
        let mut y = (j.src >> 16) as i32;
        let x2 = (j.dst & 0xFFFF) as i32;
        let y2 = (j.dst >> 16) as i32;

        let dx = (x2 - x).abs();
        let dy = -(y2 - y).abs();
        let sx = if x < x2 { 1 } else { -1 };
        let sy = if y < y2 { 1 } else { -1 };
        let mut err = dx + dy;

        let (min_x, min_y) = (x.min(x2).max(0), y.min(y2).max(0));
        let (w, h) = (
            (x.max(x2) - min_x + 1) as u32,
            (y.max(y2) - min_y + 1) as u32,
        );

        loop {
            if x >= 0 && y >= 0 && (x as u32) < self.mode.width && (y as u32) < self.mode.height {
                let addr = VRAM_START + (y as u32 * self.mode.width + x as u32) * 4;
                self.bus.write32(addr, j.color);
            }
            if x == x2 && y == y2 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
        self.dirty
            .lock()
            .unwrap()
            .mark(min_x as u32, min_y as u32, w, h);
        Ok(())
    }

    /// Affine texture map: for every destination pixel, sample the
    /// texture at 16.16 fixed-point coordinates stepped by the column and
    /// row deltas, wrapping through the `2^n - 1` dimension masks. The
    /// masks apply to the signed integer part, so negative coordinates
    /// wrap from the far edge.
    fn op_mode7(&self, j: &BlitRegs) -> Result<(), BlitFault> {
        if !is_pow2_mask(j.tex_w) || !is_pow2_mask(j.tex_h) {
            return Err(BlitFault::MaskNotPow2(j.tex_w, j.tex_h));
        }
        let src_stride = self.resolve_stride(j.src_stride, j.src, j.tex_w.wrapping_add(1));
        let dst_stride = self.resolve_stride(j.dst_stride, j.dst, j.width);
        self.check_plane_alignment(j.src)?;
        self.check_plane_alignment(j.dst)?;
        Self::check_rect_bounds(j.dst, dst_stride, j.width, j.height)?;

        for y in 0..j.height {
            let mut u = (j.u0 as i32).wrapping_add((j.du_row as i32).wrapping_mul(y as i32));
            let mut v = (j.v0 as i32).wrapping_add((j.dv_row as i32).wrapping_mul(y as i32));
            let dst_row = j.dst + y * dst_stride;
            for x in 0..j.width {
                let tex_x = ((u >> 16) as u32) & j.tex_w;
                let tex_y = ((v >> 16) as u32) & j.tex_h;
                let pixel = self.bus.read32(j.src + tex_y * src_stride + tex_x * 4);
                self.bus.write32(dst_row + x * 4, pixel);
                u = u.wrapping_add(j.du_col as i32);
                v = v.wrapping_add(j.dv_col as i32);
            }
        }
        self.mark_dirty_rect(j.dst, j.width, j.height);
        Ok(())
    }
}

/// True for values of the form `2^n - 1` (including 0).
fn is_pow2_mask(m: u32) -> bool {
    m & m.wrapping_add(1) == 0
}
