use std::io::BufReader;
use std::net::TcpStream;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::control::{read_crlf_line, write_line};
use crate::error::{MeterError, Result};
use crate::proto::command::{CtrlReply, CtrlRequest};
use crate::proto::parser::{format_request, parse_reply};

type Reader = BufReader<TcpStream>;

/// Client half of the control connection.
///
/// Requests are answered in order, so at most one call may be outstanding. A
/// [`PendingCall`] borrows the read half until [`ControlClient::finish`]
/// hands it back.
pub struct ControlClient {
    writer: TcpStream,
    reader: Option<Reader>,
}

/// Fire-and-forget request whose reply is collected by a background thread.
pub struct PendingCall {
    handle: JoinHandle<(Reader, Result<CtrlReply>)>,
}

impl ControlClient {
    pub fn dial(addr: &str) -> Result<Self> {
        let writer = TcpStream::connect(addr).map_err(|source| MeterError::Dial {
            addr: addr.to_string(),
            source,
        })?;
        let reader = BufReader::new(writer.try_clone()?);
        debug!(%addr, "control connected");
        Ok(Self {
            writer,
            reader: Some(reader),
        })
    }

    /// Asks the server for a fresh data listener and returns its port.
    pub fn start(&mut self) -> Result<String> {
        match self.call(&CtrlRequest::Start)? {
            CtrlReply::Started { port } => Ok(port.to_string()),
            other => Err(unexpected("START", other)),
        }
    }

    pub fn stop(&mut self) -> Result<bool> {
        match self.call(&CtrlRequest::Stop)? {
            CtrlReply::Stopped { ok } => Ok(ok),
            other => Err(unexpected("STOP", other)),
        }
    }

    /// Sends `req` without waiting for the reply.
    pub fn begin(&mut self, req: &CtrlRequest) -> Result<PendingCall> {
        let mut reader = self.take_reader()?;
        if let Err(e) = write_line(&mut self.writer, &format_request(req)) {
            self.reader = Some(reader);
            return Err(e);
        }
        let handle = thread::Builder::new()
            .name("control-reply".into())
            .spawn(move || {
                let reply = read_reply(&mut reader);
                (reader, reply)
            })?;
        Ok(PendingCall { handle })
    }

    /// Blocks until the reply of a [`begin`](Self::begin) call arrives and
    /// returns the byte count the server reports.
    pub fn finish(&mut self, pending: PendingCall) -> Result<u64> {
        let (reader, reply) = pending
            .handle
            .join()
            .map_err(|_| MeterError::Protocol("reply reader panicked".into()))?;
        self.reader = Some(reader);
        match reply? {
            CtrlReply::Received { bytes }
            | CtrlReply::Sent { bytes }
            | CtrlReply::Copied { bytes } => Ok(bytes),
            other => Err(unexpected("transfer", other)),
        }
    }

    fn call(&mut self, req: &CtrlRequest) -> Result<CtrlReply> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| MeterError::Protocol("a call is already pending".into()))?;
        write_line(&mut self.writer, &format_request(req))?;
        read_reply(reader)
    }

    fn take_reader(&mut self) -> Result<Reader> {
        self.reader
            .take()
            .ok_or_else(|| MeterError::Protocol("a call is already pending".into()))
    }
}

fn read_reply(reader: &mut Reader) -> Result<CtrlReply> {
    let line = read_crlf_line(reader)?
        .ok_or_else(|| MeterError::Protocol("control connection closed".into()))?;
    match parse_reply(&line)? {
        CtrlReply::Error { reason } => Err(MeterError::Protocol(reason)),
        reply => Ok(reply),
    }
}

fn unexpected(op: &str, reply: CtrlReply) -> MeterError {
    MeterError::Protocol(format!("unexpected reply to {op}: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;

    // Scripted peer: answers each request line with the next canned reply.
    fn scripted_server(replies: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut writer = conn;
            let mut seen = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                seen.push(line.trim_end().to_string());
                write_line(&mut writer, reply).unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[test]
    fn start_begin_finish_stop() {
        let (addr, server) = scripted_server(vec![
            "START OK port=40001\r\n",
            "RECEIVE OK bytes=1024\r\n",
            "STOP OK ok=true\r\n",
        ]);
        let mut client = ControlClient::dial(&addr).unwrap();
        assert_eq!(client.start().unwrap(), "40001");
        let pending = client
            .begin(&CtrlRequest::Receive { bytes: 1024 })
            .unwrap();
        // reply reader is busy until finish()
        assert!(matches!(client.stop(), Err(MeterError::Protocol(_))));
        assert_eq!(client.finish(pending).unwrap(), 1024);
        assert!(client.stop().unwrap());
        drop(client);
        let seen = server.join().unwrap();
        assert_eq!(seen[0], "START");
        assert_eq!(seen[1], "RECEIVE bytes=1024");
    }

    #[test]
    fn error_reply_is_protocol_failure() {
        let (addr, _server) = scripted_server(vec!["ERROR reason=no_listener\r\n"]);
        let mut client = ControlClient::dial(&addr).unwrap();
        match client.start() {
            Err(MeterError::Protocol(reason)) => assert_eq!(reason, "no listener"),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn dial_failure() {
        // grab a free port, then close it so nothing listens there
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().to_string()
        };
        assert!(matches!(
            ControlClient::dial(&addr),
            Err(MeterError::Dial { .. })
        ));
    }
}
