use std::io::{self, Write};
use std::net::TcpStream;

use crossbeam_channel::Receiver;

use super::{CHUNK_SIZE, IO_DEADLINE, Progress, stop_requested};

/// Writes `byte_goal` bytes in [`CHUNK_SIZE`] chunks. A short write aborts.
pub fn run(
    mut conn: TcpStream,
    stop: &Receiver<()>,
    progress: &mut Progress,
    byte_goal: u64,
) -> io::Result<()> {
    let buf = [0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    while sent < byte_goal {
        let len = (byte_goal - sent).min(CHUNK_SIZE as u64) as usize;
        conn.set_write_timeout(Some(IO_DEADLINE))?;
        let n = conn.write(&buf[..len])?;
        sent += n as u64;
        progress.add(n as u64);
        if n != len {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {n} of {len} bytes"),
            ));
        }
        if stop_requested(stop) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::Role;
    use crossbeam_channel::{bounded, unbounded};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn write_deadline_reports_partial_transfer() {
        let goal = 1u64 << 30;
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (release_tx, release_rx) = bounded::<()>(1);
        // accept and never read, so the socket buffers fill up
        let peer = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let _ = release_rx.recv();
            drop(conn);
        });

        let (_stop_tx, stop_rx) = bounded(1);
        let (report_tx, report_rx) = unbounded();
        Role::Sender.work(stop_rx, report_tx, goal, &addr);
        let moved: u64 = report_rx.iter().sum();
        assert!(moved > 0);
        assert!(moved < goal);

        release_tx.send(()).unwrap();
        peer.join().unwrap();
    }
}
