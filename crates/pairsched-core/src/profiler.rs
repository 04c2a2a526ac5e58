//! TCP client for the out-of-band profiling server.
//!
//! One connection per request: send the job id in ASCII, block until the
//! server reports completion. The server answers `"Benchmark completed"`
//! when the profiling session finished and its documents are in the store.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::error::{ControlError, Result};

/// Reply the profiling server sends on success.
pub const PROFILE_DONE_REPLY: &str = "Benchmark completed";

/// Client configuration: server address plus a total per-request budget
/// covering connect, send, and the (long) profiling wait.
#[derive(Debug, Clone)]
pub struct ProfileClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ProfileClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        ProfileClient { host: host.to_string(), port, timeout }
    }

    /// Request profiling of `job` and wait for the completion reply.
    pub fn request(&self, job: i32) -> Result<()> {
        self.request_inner(job).map_err(|reason| ControlError::ProfileRequestFailed {
            job,
            reason,
        })
    }

    fn request_inner(&self, job: i32) -> std::result::Result<(), String> {
        let started = Instant::now();
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| format!("resolve {}:{}: {e}", self.host, self.port))?
            .next()
            .ok_or_else(|| format!("no address for {}:{}", self.host, self.port))?;

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| format!("connect {addr}: {e}"))?;

        let remaining = |started: Instant, timeout: Duration| -> std::result::Result<Duration, String> {
            timeout
                .checked_sub(started.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or_else(|| "request timed out".to_string())
        };

        stream
            .set_write_timeout(Some(remaining(started, self.timeout)?))
            .map_err(|e| e.to_string())?;
        stream
            .write_all(job.to_string().as_bytes())
            .map_err(|e| format!("send job id: {e}"))?;

        stream
            .set_read_timeout(Some(remaining(started, self.timeout)?))
            .map_err(|e| e.to_string())?;
        let mut reply = [0u8; 4096];
        let n = stream.read(&mut reply).map_err(|e| format!("await reply: {e}"))?;
        if n == 0 {
            return Err("server closed connection without a reply".to_string());
        }
        let text = String::from_utf8_lossy(&reply[..n]);
        if text.trim_end_matches('\0').trim() == PROFILE_DONE_REPLY {
            Ok(())
        } else {
            Err(format!("unexpected reply {text:?}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn stub_server(reply: &'static str) -> (std::net::SocketAddr, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(reply.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (addr, handle)
    }

    #[test]
    fn sends_ascii_job_id_and_accepts_completion() {
        let (addr, server) = stub_server(PROFILE_DONE_REPLY);
        let client = ProfileClient::new("127.0.0.1", addr.port(), Duration::from_secs(5));
        client.request(42).unwrap();
        assert_eq!(server.join().unwrap(), "42");
    }

    #[test]
    fn unexpected_reply_is_a_request_failure() {
        let (addr, _server) = stub_server("Benchmark failed");
        let client = ProfileClient::new("127.0.0.1", addr.port(), Duration::from_secs(5));
        let err = client.request(7).unwrap_err();
        assert!(matches!(err, ControlError::ProfileRequestFailed { job: 7, .. }));
    }

    #[test]
    fn refused_connection_is_a_request_failure() {
        // Bind-then-drop to find a port with nothing listening.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let client = ProfileClient::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(client.request(1).is_err());
    }
}
