//! Kernel control channel: runtime-monitor ioctls and the netlink event
//! socket.
//!
//! The runtime monitor (`/dev/runtime_monitor`) is told which PGIDs to
//! watch, the long-running threshold, and which process receives events.
//! Detection events arrive over a netlink family-31 socket as an ASCII
//! `"pgid,elapsed,jobid"` payload; acknowledgements go back as a packed
//! `i32` pgid. ACK loss is tolerable; the kernel re-raises on its next
//! sampling window.

use std::io;
use std::path::Path;
use std::time::Duration;

use log::warn;

use crate::error::{ControlError, Result};

/// Netlink protocol family used by the runtime monitor.
pub const NETLINK_USER: libc::c_int = 31;

/// Netlink message header length (`struct nlmsghdr`).
const NLMSG_HDR_LEN: usize = 16;

/// Maximum event payload the kernel sends.
const MAX_PAYLOAD: usize = 4096;

// _IOC encoding: dir<<30 | size<<16 | magic<<8 | nr, with dir=1 for write.
const fn iow(magic: u8, nr: u8, size: usize) -> libc::c_ulong {
    ((1 << 30) | ((size as libc::c_ulong) << 16) | ((magic as libc::c_ulong) << 8))
        | nr as libc::c_ulong
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AddPgidArgs {
    pgid: i32,
    global_jobid: i32,
    worker_num: i32,
}

const RTMON_IOC_ADD_PGID: libc::c_ulong = iow(b'k', 0, std::mem::size_of::<AddPgidArgs>());
const RTMON_IOC_REMOVE_PGID: libc::c_ulong = iow(b'k', 1, std::mem::size_of::<i32>());
const RTMON_IOC_SET_THRESHOLD: libc::c_ulong = iow(b'k', 2, std::mem::size_of::<i32>());
const RTMON_IOC_SET_DATA_LOADER: libc::c_ulong = iow(b'k', 3, std::mem::size_of::<i32>());
const RTMON_IOC_REQUEST_PROFILE: libc::c_ulong = iow(b'k', 4, std::mem::size_of::<i32>());

// ---------------------------------------------------------------------------
// Runtime monitor device
// ---------------------------------------------------------------------------

/// Handle on `/dev/runtime_monitor`.
#[derive(Debug)]
pub struct RuntimeMonitor {
    fd: libc::c_int,
}

impl RuntimeMonitor {
    pub const DEVICE: &'static str = "/dev/runtime_monitor";

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
        Ok(RuntimeMonitor { fd })
    }

    fn ioctl<T>(&self, request: libc::c_ulong, arg: &T) -> Result<()> {
        loop {
            // SAFETY: fd is the open device; `arg` lives across the call and
            // matches the size encoded in `request`.
            let rc = unsafe { libc::ioctl(self.fd, request as _, arg as *const T) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(ControlError::TransientKernelIo(format!(
                "runtime_monitor ioctl {request:#x}: {err}"
            )));
        }
    }

    /// Ask the kernel to watch a process group.
    pub fn register_pgid(&self, pgid: i32, global_jobid: i32, worker_num: i32) -> Result<()> {
        self.ioctl(RTMON_IOC_ADD_PGID, &AddPgidArgs { pgid, global_jobid, worker_num })
    }

    pub fn remove_pgid(&self, pgid: i32) -> Result<()> {
        self.ioctl(RTMON_IOC_REMOVE_PGID, &pgid)
    }

    /// Seconds of runtime after which a group is flagged long-running.
    pub fn set_long_running_threshold(&self, seconds: i32) -> Result<()> {
        self.ioctl(RTMON_IOC_SET_THRESHOLD, &seconds)
    }

    /// Tell the kernel which process receives netlink events.
    pub fn set_data_loader(&self, pid: i32) -> Result<()> {
        self.ioctl(RTMON_IOC_SET_DATA_LOADER, &pid)
    }

    /// Reserved in-kernel profile trigger; kept for ABI completeness.
    pub fn request_profile(&self, global_jobid: i32) -> Result<()> {
        self.ioctl(RTMON_IOC_REQUEST_PROFILE, &global_jobid)
    }
}

impl Drop for RuntimeMonitor {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---------------------------------------------------------------------------
// Netlink event socket
// ---------------------------------------------------------------------------

/// A long-running-workload detection event from the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEvent {
    pub pgid: i32,
    /// Seconds the group had been running when detected.
    pub elapsed: i64,
    pub global_jobid: i32,
}

/// Parse the kernel's ASCII event payload `"pgid,elapsed,jobid"` (trailing
/// NULs tolerated).
pub fn parse_event(payload: &[u8]) -> Result<KernelEvent> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    let text = std::str::from_utf8(&payload[..end])
        .map_err(|_| ControlError::BadEvent(format!("{payload:?}")))?;
    let mut parts = text.trim().split(',');
    let mut next = |what: &str| -> Result<i64> {
        parts
            .next()
            .and_then(|tok| tok.trim().parse::<i64>().ok())
            .ok_or_else(|| ControlError::BadEvent(format!("{what} in {text:?}")))
    };
    let pgid = next("pgid")?;
    let elapsed = next("elapsed")?;
    let jobid = next("jobid")?;
    if parts.next().is_some() {
        return Err(ControlError::BadEvent(format!("trailing fields in {text:?}")));
    }
    Ok(KernelEvent { pgid: pgid as i32, elapsed, global_jobid: jobid as i32 })
}

/// Blocking netlink socket bound to the controller's pid.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: libc::c_int,
    pid: u32,
}

// SAFETY: all operations are plain syscalls on one fd; the kernel serialises
// concurrent send/recv on a netlink socket.
unsafe impl Send for NetlinkSocket {}
unsafe impl Sync for NetlinkSocket {}

impl NetlinkSocket {
    /// Open and bind the family-31 socket. Receives time out after
    /// `recv_timeout` so the reader thread can poll its shutdown flag.
    pub fn open(recv_timeout: Duration) -> Result<Self> {
        // SAFETY: plain socket(2) call.
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_USER) };
        if fd < 0 {
            return Err(ControlError::Io(io::Error::last_os_error()));
        }

        let pid = std::process::id();
        // SAFETY: sockaddr_nl is POD; zeroed then filled.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_pid = pid;
        // SAFETY: fd is our socket; addr is a valid sockaddr_nl.
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd opened above.
            unsafe { libc::close(fd) };
            return Err(ControlError::Io(err));
        }

        let tv = libc::timeval {
            tv_sec: recv_timeout.as_secs() as libc::time_t,
            tv_usec: recv_timeout.subsec_micros() as libc::suseconds_t,
        };
        // SAFETY: fd is our socket; tv is a valid timeval.
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            );
        }

        Ok(NetlinkSocket { fd, pid })
    }

    /// Receive one kernel event. `Ok(None)` on receive timeout so callers
    /// can poll shutdown; transient errors are surfaced for the caller to
    /// log and loop.
    pub fn recv_event(&self) -> Result<Option<KernelEvent>> {
        let mut buf = [0u8; NLMSG_HDR_LEN + MAX_PAYLOAD];
        // SAFETY: buf lives across the call and its length is passed.
        let n = unsafe {
            libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Ok(None),
                Some(libc::EINTR) => Ok(None),
                _ => Err(ControlError::TransientKernelIo(format!("netlink recv: {err}"))),
            };
        }
        let n = n as usize;
        if n < NLMSG_HDR_LEN {
            return Err(ControlError::BadEvent(format!("short netlink message ({n} bytes)")));
        }
        let msg_len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let end = msg_len.clamp(NLMSG_HDR_LEN, n);
        parse_event(&buf[NLMSG_HDR_LEN..end]).map(Some)
    }

    /// Best-effort acknowledgement: the kernel may now register `pgid` with
    /// the IPC monitor. Loss is tolerated (the kernel re-raises), so send
    /// failures are logged, not propagated.
    pub fn send_ack(&self, pgid: i32) {
        let payload = pgid.to_ne_bytes();
        let total = NLMSG_HDR_LEN + payload.len();
        let mut msg = Vec::with_capacity(total);
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes()); // type
        msg.extend_from_slice(&0u16.to_ne_bytes()); // flags
        msg.extend_from_slice(&0u32.to_ne_bytes()); // seq
        msg.extend_from_slice(&self.pid.to_ne_bytes());
        msg.extend_from_slice(&payload);

        // SAFETY: sockaddr_nl is POD; nl_pid 0 addresses the kernel.
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        // SAFETY: msg and addr live across the call with correct lengths.
        let rc = unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            warn!("netlink ack for pgid {pgid} not sent: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_encodings_match_kernel_header() {
        // _IOW('k', 0, struct { i32; i32; i32 }) and friends.
        assert_eq!(RTMON_IOC_ADD_PGID, 0x400C_6B00);
        assert_eq!(RTMON_IOC_REMOVE_PGID, 0x4004_6B01);
        assert_eq!(RTMON_IOC_SET_THRESHOLD, 0x4004_6B02);
        assert_eq!(RTMON_IOC_SET_DATA_LOADER, 0x4004_6B03);
        assert_eq!(RTMON_IOC_REQUEST_PROFILE, 0x4004_6B04);
    }

    #[test]
    fn event_payload_parses() {
        let ev = parse_event(b"1234,61,7\0\0\0").unwrap();
        assert_eq!(ev, KernelEvent { pgid: 1234, elapsed: 61, global_jobid: 7 });
        // No NUL terminator is fine too.
        assert_eq!(parse_event(b"1,2,3").unwrap().global_jobid, 3);
    }

    #[test]
    fn bad_event_payloads_are_rejected() {
        assert!(matches!(parse_event(b""), Err(ControlError::BadEvent(_))));
        assert!(matches!(parse_event(b"12,61"), Err(ControlError::BadEvent(_))));
        assert!(matches!(parse_event(b"a,b,c"), Err(ControlError::BadEvent(_))));
        assert!(matches!(parse_event(b"1,2,3,4"), Err(ControlError::BadEvent(_))));
        assert!(matches!(parse_event(&[0xff, 0xfe, 1]), Err(ControlError::BadEvent(_))));
    }
}
