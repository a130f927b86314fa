//! Data-plane workers.
//!
//! A worker dials the server's ephemeral data port, moves `byte_goal` bytes
//! in fixed chunks and reports progress as byte deltas on a channel. Dropping
//! the report sender on return is the completion signal.

use std::net::TcpStream;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::proto::command::CtrlRequest;

pub mod rx;
pub mod tx;

pub const CHUNK_SIZE: usize = 8 * 1024;
/// Progress is reported every 16 chunks.
pub const REPORT_EVERY: u64 = 16 * CHUNK_SIZE as u64;
pub const IO_DEADLINE: Duration = Duration::from_secs(5);

/// Local side of a test. The server plays the mirrored role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Upload: we write, the server receives.
    Sender,
    /// Download: the server writes, we read.
    Receiver,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Sender => "Upload",
            Role::Receiver => "Download",
        }
    }

    /// The server operation that mirrors this role.
    pub fn remote_request(self, bytes: u64) -> CtrlRequest {
        match self {
            Role::Sender => CtrlRequest::Receive { bytes },
            Role::Receiver => CtrlRequest::Send { bytes },
        }
    }

    /// Runs the transfer on the current thread. Dial failures are logged and
    /// end the worker without any report.
    pub fn work(self, stop: Receiver<()>, report: Sender<u64>, byte_goal: u64, addr: &str) {
        debug!(role = self.name(), %addr, byte_goal, "dialing data port");
        let conn = match TcpStream::connect(addr) {
            Ok(c) => c,
            Err(e) => {
                warn!(role = self.name(), %addr, "data dial failed: {e}");
                return;
            }
        };
        let mut progress = Progress::new(report);
        let res = match self {
            Role::Sender => tx::run(conn, &stop, &mut progress, byte_goal),
            Role::Receiver => rx::run(conn, &stop, &mut progress, byte_goal),
        };
        if let Err(e) = res {
            warn!(role = self.name(), moved = progress.moved, "transfer aborted: {e}");
        }
        debug!(role = self.name(), moved = progress.moved, "worker done");
    }
}

/// Batches byte counts into reports of at least [`REPORT_EVERY`] bytes.
/// Whatever is still pending goes out on drop.
pub struct Progress {
    pending: u64,
    pub moved: u64,
    report: Sender<u64>,
}

impl Progress {
    pub fn new(report: Sender<u64>) -> Self {
        Self {
            pending: 0,
            moved: 0,
            report,
        }
    }
    pub fn add(&mut self, n: u64) {
        self.pending += n;
        self.moved += n;
        if self.pending >= REPORT_EVERY {
            self.flush();
        }
    }
    pub fn flush(&mut self) {
        if self.pending > 0 {
            // dispatcher may already be gone
            let _ = self.report.send(self.pending);
            self.pending = 0;
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Non-blocking check of the stop signal.
fn stop_requested(stop: &Receiver<()>) -> bool {
    stop.try_recv().is_ok()
}
