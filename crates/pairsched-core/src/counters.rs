//! Per-CPU hardware counters via raw `perf_event_open`.
//!
//! Each in-use CPU gets two events (retired instructions and cycles), opened
//! user-mode only, inheritable, initially disabled, and always toggled as a
//! pair so the IPC quotient is taken over the same wall window. The syscall
//! has no libc wrapper, so the number is supplied per ISA.

use std::io;
use std::os::fd::RawFd;

use crate::error::{ControlError, Result};

#[cfg(target_arch = "x86_64")]
const SYS_PERF_EVENT_OPEN: libc::c_long = 298;
#[cfg(any(target_arch = "aarch64", target_arch = "riscv64"))]
const SYS_PERF_EVENT_OPEN: libc::c_long = 241;

const PERF_TYPE_HARDWARE: u32 = 0;
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

// Flag bits within perf_event_attr's packed bitfield word.
const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_INHERIT: u64 = 1 << 1;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// ioctls on a perf event fd.
const PERF_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_IOC_RESET: libc::c_ulong = 0x2403;

/// `struct perf_event_attr`, VER6 layout (120 bytes). Fields past `config`
/// stay zero for plain counting events.
#[repr(C)]
#[derive(Clone, Copy)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events: u32,
    bp_type: u32,
    bp_addr: u64,
    bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    _reserved_2: u16,
    aux_sample_size: u32,
    _reserved_3: u32,
}

impl PerfEventAttr {
    fn counting(config: u64) -> Self {
        // SAFETY: PerfEventAttr is plain-old-data; all-zero is a valid value.
        let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
        attr.type_ = PERF_TYPE_HARDWARE;
        attr.size = std::mem::size_of::<PerfEventAttr>() as u32;
        attr.config = config;
        attr.flags = ATTR_DISABLED | ATTR_INHERIT | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV;
        attr
    }
}

/// One perf event fd, closed on drop.
#[derive(Debug)]
struct EventFd(RawFd);

impl EventFd {
    fn ioctl(&self, request: libc::c_ulong) -> Result<()> {
        // SAFETY: self.0 is a perf event fd owned by this struct; the three
        // requests used here take no argument.
        let rc = unsafe { libc::ioctl(self.0, request as _, 0) };
        if rc < 0 {
            return Err(ControlError::TransientKernelIo(format!(
                "perf ioctl {request:#x}: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn value(&self) -> Result<u64> {
        let mut val: u64 = 0;
        // SAFETY: reading exactly 8 bytes of counter value into a u64 we own.
        let n = unsafe {
            libc::read(self.0, &mut val as *mut u64 as *mut libc::c_void, 8)
        };
        if n != 8 {
            return Err(ControlError::TransientKernelIo(format!(
                "perf counter read: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(val)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.0);
        }
    }
}

fn perf_event_open(attr: &PerfEventAttr, cpu: u32) -> Result<EventFd> {
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64"))]
    {
        // SAFETY: attr points at a fully initialized perf_event_attr with a
        // correct size field; pid -1 + a concrete cpu selects per-CPU counting.
        let fd = unsafe {
            libc::syscall(
                SYS_PERF_EVENT_OPEN,
                attr as *const PerfEventAttr,
                -1 as libc::c_int,
                cpu as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(ControlError::TransientKernelIo(format!(
                "perf_event_open(cpu {cpu}): {}",
                io::Error::last_os_error()
            )));
        }
        Ok(EventFd(fd as RawFd))
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    {
        let _ = (attr, cpu);
        Err(ControlError::UnsupportedArch(std::env::consts::ARCH))
    }
}

/// The cycle/instruction counter pair of one logical CPU.
#[derive(Debug)]
pub struct CpuCounter {
    cpu: u32,
    cycles: EventFd,
    instructions: EventFd,
}

impl CpuCounter {
    /// Open both counters on `cpu`, disabled.
    pub fn open(cpu: u32) -> Result<Self> {
        let cycles = perf_event_open(&PerfEventAttr::counting(PERF_COUNT_HW_CPU_CYCLES), cpu)?;
        let instructions =
            perf_event_open(&PerfEventAttr::counting(PERF_COUNT_HW_INSTRUCTIONS), cpu)?;
        Ok(CpuCounter { cpu, cycles, instructions })
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Zero both counters and start them. Idempotent.
    pub fn enable_reset(&self) -> Result<()> {
        self.cycles.ioctl(PERF_IOC_RESET)?;
        self.instructions.ioctl(PERF_IOC_RESET)?;
        self.cycles.ioctl(PERF_IOC_ENABLE)?;
        self.instructions.ioctl(PERF_IOC_ENABLE)
    }

    /// Stop both counters. Idempotent.
    pub fn disable(&self) -> Result<()> {
        self.cycles.ioctl(PERF_IOC_DISABLE)?;
        self.instructions.ioctl(PERF_IOC_DISABLE)
    }

    /// Instructions retired per cycle over the last enabled window.
    pub fn ipc(&self) -> Result<f64> {
        let cycles = self.cycles.value()?;
        let instructions = self.instructions.value()?;
        Ok(ipc_from(instructions, cycles))
    }
}

/// IPC quotient with the zero-cycle guard.
pub fn ipc_from(instructions: u64, cycles: u64) -> f64 {
    if cycles == 0 {
        0.0
    } else {
        instructions as f64 / cycles as f64
    }
}

/// Counters for a set of CPUs, opened together and addressed by CPU id.
#[derive(Debug, Default)]
pub struct CounterSet {
    counters: Vec<CpuCounter>,
}

impl CounterSet {
    /// Open counters on every listed CPU. Fails closed: either all CPUs get
    /// their pair or none stay open.
    pub fn open(cpus: &[u32]) -> Result<Self> {
        let mut counters = Vec::with_capacity(cpus.len());
        for &cpu in cpus {
            counters.push(CpuCounter::open(cpu)?);
        }
        Ok(CounterSet { counters })
    }

    pub fn get(&self, cpu: u32) -> Option<&CpuCounter> {
        self.counters.iter().find(|c| c.cpu == cpu)
    }

    /// Zero-and-start every counter pair.
    pub fn enable_reset_all(&self) -> Result<()> {
        for c in &self.counters {
            c.enable_reset()?;
        }
        Ok(())
    }

    /// Stop every counter pair.
    pub fn disable_all(&self) -> Result<()> {
        for c in &self.counters {
            c.disable()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_cycles_reads_zero_ipc() {
        assert_eq!(ipc_from(500, 0), 0.0);
        assert_eq!(ipc_from(0, 100), 0.0);
        assert!((ipc_from(250, 100) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn attr_requests_user_mode_only_disabled_inheritable() {
        let attr = PerfEventAttr::counting(PERF_COUNT_HW_INSTRUCTIONS);
        assert_eq!(attr.type_, PERF_TYPE_HARDWARE);
        assert_eq!(attr.size as usize, std::mem::size_of::<PerfEventAttr>());
        assert_eq!(attr.config, PERF_COUNT_HW_INSTRUCTIONS);
        assert_eq!(
            attr.flags,
            ATTR_DISABLED | ATTR_INHERIT | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV
        );
        assert_eq!(attr.sample_period, 0);
    }

    #[test]
    fn attr_layout_is_ver6() {
        assert_eq!(std::mem::size_of::<PerfEventAttr>(), 120);
    }
}
