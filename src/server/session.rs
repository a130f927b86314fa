use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{MeterError, Result};
use crate::worker::IO_DEADLINE;

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub enum SessionState {
    Idle,
    Listening(TcpListener),
    /// Started, but the listener was dropped after an accept timeout.
    Closed,
}

/// Server side of one measurement: owns the ephemeral data listener.
///
/// Every operation takes `&mut self`, so calls are serialized by ownership and
/// a process serves one control client at a time.
#[derive(Debug)]
pub struct PayloadSession {
    bind_ip: IpAddr,
    accept_timeout: Duration,
    state: SessionState,
}

impl PayloadSession {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_ip,
            accept_timeout: ACCEPT_TIMEOUT,
            state: SessionState::Idle,
        }
    }

    #[cfg(test)]
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Binds a fresh data listener on an ephemeral port, replacing any
    /// previous one, and returns the port.
    pub fn start(&mut self) -> Result<u16> {
        // close the old listener before binding the new one
        self.state = SessionState::Idle;
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0))?;
        let port = listener.local_addr()?.port();
        info!(port, "payload listener bound");
        self.state = SessionState::Listening(listener);
        Ok(port)
    }

    /// Ends a started session. Succeeds even if an accept timeout already
    /// closed the listener.
    pub fn stop(&mut self) -> Result<bool> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Listening(_) => {
                info!("payload listener closed");
                Ok(true)
            }
            SessionState::Closed => {
                debug!("session stopped after accept timeout");
                Ok(true)
            }
            SessionState::Idle => Err(MeterError::SessionMisuse("STOP without START")),
        }
    }

    /// Pulls exactly `n` bytes from one data connection and discards them.
    pub fn receive(&mut self, n: u64) -> Result<u64> {
        let conn = self.accept_data()?;
        let mut limited = (&conn).take(n);
        let got = io::copy(&mut limited, &mut io::sink()).map_err(MeterError::Transfer)?;
        if got < n {
            return Err(MeterError::Transfer(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed after {got} of {n} bytes"),
            )));
        }
        debug!(bytes = got, "receive done");
        Ok(got)
    }

    /// Writes `n` zero bytes to one data connection.
    pub fn send(&mut self, n: u64) -> Result<u64> {
        let mut conn = self.accept_data()?;
        let sent = io::copy(&mut io::repeat(0).take(n), &mut conn).map_err(MeterError::Transfer)?;
        conn.flush().map_err(MeterError::Transfer)?;
        debug!(bytes = sent, "send done");
        Ok(sent)
    }

    /// Echoes everything received back to the peer until it closes.
    pub fn copy(&mut self) -> Result<u64> {
        let conn = self.accept_data()?;
        let copied = io::copy(&mut &conn, &mut &conn).map_err(MeterError::Transfer)?;
        debug!(bytes = copied, "copy done");
        Ok(copied)
    }

    /// Accepts one data connection or gives up after the accept timeout. On
    /// timeout the listener is closed; only STOP or a new START is valid after.
    fn accept_data(&mut self) -> Result<TcpStream> {
        let listener = match &self.state {
            SessionState::Listening(listener) => listener,
            SessionState::Closed => {
                return Err(MeterError::SessionMisuse(
                    "data listener closed after accept timeout",
                ));
            }
            SessionState::Idle => {
                return Err(MeterError::SessionMisuse("data transfer without START"));
            }
        };
        let deadline = Instant::now() + self.accept_timeout;
        match accept_before(listener, deadline)? {
            Some(conn) => Ok(conn),
            None => {
                warn!(timeout = ?self.accept_timeout, "no data connection, closing listener");
                self.state = SessionState::Closed;
                Err(MeterError::AcceptTimeout(self.accept_timeout))
            }
        }
    }
}

fn accept_before(listener: &TcpListener, deadline: Instant) -> Result<Option<TcpStream>> {
    listener.set_nonblocking(true)?;
    let res = loop {
        match listener.accept() {
            Ok((conn, peer)) => {
                debug!(%peer, "data connection accepted");
                break Ok(Some(conn));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break Ok(None);
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => break Err(MeterError::Io(e)),
        }
    };
    listener.set_nonblocking(false)?;
    let Some(conn) = res? else {
        return Ok(None);
    };
    // accepted sockets may inherit O_NONBLOCK on some platforms
    conn.set_nonblocking(false)?;
    conn.set_read_timeout(Some(IO_DEADLINE))?;
    conn.set_write_timeout(Some(IO_DEADLINE))?;
    Ok(Some(conn))
}
