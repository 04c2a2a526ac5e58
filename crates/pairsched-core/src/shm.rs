//! Reader for the kernel IPC monitor's shared-memory region.
//!
//! The kernel publishes per-PGID cycle/instruction counters into a mapped
//! region of `/dev/IPC_monitor`. The kernel is the only writer; this side
//! only ever reads, synchronised per slot by a seqlock: the sequence word is
//! odd while the kernel is mid-write, and a read is accepted only when the
//! sequence is even and unchanged across the field reads. Torn slots are
//! retried a bounded number of times and then skipped for the cycle.

use std::io;
use std::path::Path;
use std::sync::atomic::{Ordering, fence};

use log::debug;

use crate::counters::ipc_from;
use crate::error::{ControlError, Result};

/// Capacity of the kernel's slot table.
pub const MAX_SLOTS: usize = 4096;
const MASK_WORDS: usize = MAX_SLOTS / 64;

/// Retries before a slot is declared torn for this cycle.
const SEQLOCK_RETRIES: usize = 128;

/// `_IO('I', 0)`: zero every slot's counters.
const IPC_IOC_RESET_COUNTERS: libc::c_ulong = io_none(b'I', 0);

const fn io_none(magic: u8, nr: u8) -> libc::c_ulong {
    ((magic as libc::c_ulong) << 8) | nr as libc::c_ulong
}

// ---------------------------------------------------------------------------
// Region layout (kernel ABI; do not reorder)
// ---------------------------------------------------------------------------

/// One per-PGID counter slot. 32 bytes, 16-byte aligned, written only by the
/// kernel under its seqlock.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct RawSlot {
    pub seq: u32,
    pub pgid: i32,
    pub global_jobid: i32,
    pub worker_num: i32,
    pub cycles: u64,
    pub instructions: u64,
}

/// The full exported region.
#[repr(C)]
pub struct SharedRegion {
    count: i32,
    _pad0: i32,
    active_mask: [u64; MASK_WORDS],
    _pad1: [u8; 8],
    slots: [RawSlot; MAX_SLOTS],
}

/// A consistent snapshot of one slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotSample {
    pub pgid: i32,
    pub global_jobid: i32,
    pub worker_num: i32,
    pub cycles: u64,
    pub instructions: u64,
}

impl SlotSample {
    /// IPC over the slot's accumulation window, 0.0 when no cycles elapsed.
    pub fn ipc(&self) -> f64 {
        ipc_from(self.instructions, self.cycles)
    }
}

/// Seqlock-protocol read of a single slot.
///
/// # Safety
/// `slot` must point at a live `RawSlot` whose writer follows the
/// odd-during-write discipline.
unsafe fn read_slot(slot: *const RawSlot) -> Option<SlotSample> {
    for _ in 0..SEQLOCK_RETRIES {
        // SAFETY: caller guarantees `slot` is valid; volatile reads keep the
        // compiler from caching fields across the concurrent kernel writer.
        let seq_before = unsafe { std::ptr::read_volatile(&raw const (*slot).seq) };
        if seq_before & 1 != 0 {
            std::hint::spin_loop();
            continue;
        }
        fence(Ordering::Acquire);
        // SAFETY: as above.
        let sample = unsafe {
            SlotSample {
                pgid: std::ptr::read_volatile(&raw const (*slot).pgid),
                global_jobid: std::ptr::read_volatile(&raw const (*slot).global_jobid),
                worker_num: std::ptr::read_volatile(&raw const (*slot).worker_num),
                cycles: std::ptr::read_volatile(&raw const (*slot).cycles),
                instructions: std::ptr::read_volatile(&raw const (*slot).instructions),
            }
        };
        fence(Ordering::Acquire);
        // SAFETY: as above.
        let seq_after = unsafe { std::ptr::read_volatile(&raw const (*slot).seq) };
        if seq_before == seq_after {
            return Some(sample);
        }
        std::hint::spin_loop();
    }
    None
}

/// Indices of set bits in a word array, ascending.
fn set_bits(words: &[u64]) -> Vec<usize> {
    let mut out = Vec::new();
    for (wi, &word) in words.iter().enumerate() {
        let mut w = word;
        while w != 0 {
            let bit = w.trailing_zeros() as usize;
            out.push(wi * 64 + bit);
            w &= w - 1;
        }
    }
    out
}

/// Scan every active slot of a region. Torn slots are skipped.
///
/// # Safety
/// `region` must point at a live `SharedRegion` written under the seqlock
/// discipline.
unsafe fn scan_region(region: *const SharedRegion) -> Vec<(usize, SlotSample)> {
    // SAFETY: the active mask is written before slots are activated; a stale
    // mask bit only leads to reading an inactive slot, which the seqlock and
    // pgid checks tolerate.
    let mask = unsafe { std::ptr::read_volatile(&raw const (*region).active_mask) };
    let mut out = Vec::new();
    for idx in set_bits(&mask) {
        // SAFETY: idx < MAX_SLOTS by construction of the mask.
        match unsafe { read_slot(&raw const (*region).slots[idx]) } {
            Some(sample) => out.push((idx, sample)),
            None => {
                debug!("{}", ControlError::SeqlockInconsistent(idx));
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Mapped device
// ---------------------------------------------------------------------------

/// The mapped `/dev/IPC_monitor` region. Unmapped and closed on drop.
#[derive(Debug)]
pub struct ShmReader {
    fd: libc::c_int,
    map: *mut SharedRegion,
    map_len: usize,
}

// SAFETY: the mapping is read-only traffic from this side and every access
// goes through the seqlock protocol; moving the handle between threads is
// fine. Concurrent use is limited to the telemetry role by construction.
unsafe impl Send for ShmReader {}

impl ShmReader {
    pub const DEVICE: &'static str = "/dev/IPC_monitor";

    /// Map the region exported by the kernel monitor.
    pub fn open() -> Result<Self> {
        Self::open_at(Path::new(Self::DEVICE))
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        use std::os::unix::ffi::OsStrExt;
        let mut raw = path.as_os_str().as_bytes().to_vec();
        raw.push(0);
        // SAFETY: `raw` is NUL-terminated and outlives the call.
        let fd = unsafe { libc::open(raw.as_ptr() as *const libc::c_char, libc::O_RDWR) };
        if fd < 0 {
            return Err(ControlError::Io(io::Error::last_os_error()));
        }

        let map_len = page_align(std::mem::size_of::<SharedRegion>());
        // SAFETY: fresh fd, page-aligned length, offset 0; the kernel module
        // exports at least `map_len` bytes.
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: fd was opened above and is not otherwise referenced.
            unsafe { libc::close(fd) };
            return Err(ControlError::Io(err));
        }
        Ok(ShmReader { fd, map: map as *mut SharedRegion, map_len })
    }

    /// Number of slots the kernel currently tracks.
    pub fn registered_count(&self) -> i32 {
        // SAFETY: self.map is a live mapping for the life of self.
        unsafe { std::ptr::read_volatile(&raw const (*self.map).count) }
    }

    /// Consistent samples of every active slot; torn slots are skipped for
    /// this cycle.
    pub fn active_slots(&self) -> Vec<(usize, SlotSample)> {
        // SAFETY: self.map is a live mapping written by the kernel seqlock
        // writer for the life of self.
        unsafe { scan_region(self.map) }
    }

    /// Ask the kernel to zero every slot's counters (end of a telemetry
    /// window).
    pub fn reset_counters(&self) -> Result<()> {
        // SAFETY: fd is the open IPC monitor device; the request takes no
        // argument.
        let rc = unsafe { libc::ioctl(self.fd, IPC_IOC_RESET_COUNTERS as _, 0) };
        if rc < 0 {
            return Err(ControlError::TransientKernelIo(format!(
                "reset_counters: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for ShmReader {
    fn drop(&mut self) {
        // SAFETY: map/map_len came from a successful mmap; fd is owned.
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
            libc::close(self.fd);
        }
    }
}

fn page_align(len: usize) -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    len.div_ceil(page) * page
}
