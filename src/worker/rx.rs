use std::io::{self, Read};
use std::net::TcpStream;

use crossbeam_channel::Receiver;
use tracing::debug;

use super::{CHUNK_SIZE, IO_DEADLINE, Progress, stop_requested};

/// Reads until `byte_goal` bytes arrived, the peer closes, or stop is signalled.
/// Never asks for more than what is still missing.
pub fn run(
    mut conn: TcpStream,
    stop: &Receiver<()>,
    progress: &mut Progress,
    byte_goal: u64,
) -> io::Result<()> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;

    while received < byte_goal {
        let want = (byte_goal - received).min(CHUNK_SIZE as u64) as usize;
        conn.set_read_timeout(Some(IO_DEADLINE))?;
        let n = conn.read(&mut buf[..want])?;
        if n == 0 {
            debug!(received, byte_goal, "peer closed data connection");
            break;
        }
        received += n as u64;
        progress.add(n as u64);
        if stop_requested(stop) {
            break;
        }
    }
    Ok(())
}
