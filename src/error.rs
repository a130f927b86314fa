use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::proto::parser::ParseError;

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("control protocol: {0}")]
    Protocol(String),
    #[error("malformed control line: {0}")]
    Parse(#[from] ParseError),
    #[error("transfer: {0}")]
    Transfer(#[source] io::Error),
    #[error("no data connection within {0:?}")]
    AcceptTimeout(Duration),
    #[error("session misuse: {0}")]
    SessionMisuse(&'static str),
    #[error("unknown test request: {0}")]
    UnknownRequest(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = MeterError> = std::result::Result<T, E>;
