use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
#[cfg(test)]
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::cli::ServerOpts;
use crate::control::{read_crlf_line, write_line};
use crate::error::Result;
use crate::proto::command::{CtrlReply, CtrlRequest};
use crate::proto::parser::{format_reply, parse_request};

pub mod session;

pub use session::PayloadSession;

pub fn run(opts: ServerOpts) -> anyhow::Result<()> {
    let server = Server::bind(&opts.addr)
        .with_context(|| format!("binding control listener on {}", opts.addr))?;
    server.serve().context("control listener failed")
}

/// Control endpoint. Serves one control connection at a time against a
/// single [`PayloadSession`].
pub struct Server {
    listener: TcpListener,
    session: PayloadSession,
}

impl Server {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        // data listeners go on the same interface as the control listener
        let session = PayloadSession::new(listener.local_addr()?.ip());
        Ok(Self { listener, session })
    }

    #[cfg(test)]
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.session = self.session.with_accept_timeout(timeout);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; returns only if the listener itself fails.
    pub fn serve(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "control server listening");
        loop {
            let (conn, peer) = self.listener.accept()?;
            info!(%peer, "control client connected");
            match serve_control(conn, &mut self.session) {
                Ok(()) => info!(%peer, "control client disconnected"),
                Err(e) => warn!(%peer, "control connection failed: {e}"),
            }
        }
    }
}

/// Answers request lines on one control connection until EOF.
pub fn serve_control(conn: TcpStream, session: &mut PayloadSession) -> Result<()> {
    let mut reader = BufReader::new(conn.try_clone()?);
    let mut writer = conn;

    while let Some(line) = read_crlf_line(&mut reader)? {
        let reply = match parse_request(&line) {
            Ok(req) => handle(session, req),
            Err(e) => {
                warn!(%line, "bad request: {e}");
                CtrlReply::Error {
                    reason: e.to_string(),
                }
            }
        };
        write_line(&mut writer, &format_reply(&reply))?;
    }
    Ok(())
}

fn handle(session: &mut PayloadSession, req: CtrlRequest) -> CtrlReply {
    debug!(?req, "control request");
    let res = match req {
        CtrlRequest::Start => session.start().map(|port| CtrlReply::Started { port }),
        CtrlRequest::Stop => session.stop().map(|ok| CtrlReply::Stopped { ok }),
        CtrlRequest::Receive { bytes } => session
            .receive(bytes)
            .map(|bytes| CtrlReply::Received { bytes }),
        CtrlRequest::Send { bytes } => session
            .send(bytes)
            .map(|bytes| CtrlReply::Sent { bytes }),
        CtrlRequest::Copy => session.copy().map(|bytes| CtrlReply::Copied { bytes }),
    };
    res.unwrap_or_else(|e| {
        warn!("{e}");
        CtrlReply::Error {
            reason: e.to_string(),
        }
    })
}
