// src/proto/parser.rs
use std::collections::BTreeMap;

use thiserror::Error;

use super::command::{CtrlReply, CtrlRequest};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing tag")]
    MissingTag,
    #[error("malformed key=value pair: {0}")]
    BadPair(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid integer for {0}: {1}")]
    BadInt(&'static str, String),
    #[error("invalid bool for {0}: {1}")]
    BadBool(&'static str, String),
    #[error("unknown tag: {0}")]
    UnknownTag(String),
}

macro_rules! push_pair {
    ($out:ident, $k:literal, $v:expr) => {{
        $out.push(' ');
        $out.push_str($k);
        $out.push('=');
        $out.push_str(&$v.to_string());
    }};
}

/// Serialize a request to a CRLF-terminated line.
pub fn format_request(req: &CtrlRequest) -> String {
    use CtrlRequest::*;
    let mut out = String::new();

    match req {
        Start => out.push_str("START"),
        Stop => out.push_str("STOP"),
        Receive { bytes } => {
            out.push_str("RECEIVE");
            push_pair!(out, "bytes", bytes);
        }
        Send { bytes } => {
            out.push_str("SEND");
            push_pair!(out, "bytes", bytes);
        }
        Copy => out.push_str("COPY"),
    }

    out.push_str("\r\n");
    out
}

/// Serialize a reply to a CRLF-terminated line.
pub fn format_reply(reply: &CtrlReply) -> String {
    use CtrlReply::*;
    let mut out = String::new();

    match reply {
        Started { port } => {
            out.push_str("START OK");
            push_pair!(out, "port", port);
        }
        Stopped { ok } => {
            out.push_str("STOP OK");
            push_pair!(out, "ok", ok);
        }
        Received { bytes } => {
            out.push_str("RECEIVE OK");
            push_pair!(out, "bytes", bytes);
        }
        Sent { bytes } => {
            out.push_str("SEND OK");
            push_pair!(out, "bytes", bytes);
        }
        Copied { bytes } => {
            out.push_str("COPY OK");
            push_pair!(out, "bytes", bytes);
        }
        Error { reason } => {
            out.push_str("ERROR");
            if !reason.is_empty() {
                push_pair!(out, "reason", escape_reason(reason));
            }
        }
    }

    out.push_str("\r\n");
    out
}

pub fn parse_request(line: &str) -> Result<CtrlRequest, ParseError> {
    let (tag, map) = split_line(line)?;
    use CtrlRequest::*;

    match tag.as_str() {
        "START" => Ok(Start),
        "STOP" => Ok(Stop),
        "RECEIVE" => Ok(Receive {
            bytes: req_u64(&map, "bytes")?,
        }),
        "SEND" => Ok(Send {
            bytes: req_u64(&map, "bytes")?,
        }),
        "COPY" => Ok(Copy),
        _ => Err(ParseError::UnknownTag(tag)),
    }
}

pub fn parse_reply(line: &str) -> Result<CtrlReply, ParseError> {
    let (tag, map) = split_line(line)?;
    use CtrlReply::*;

    match tag.as_str() {
        "START OK" => Ok(Started {
            port: req_u16(&map, "port")?,
        }),
        "STOP OK" => Ok(Stopped {
            ok: req_bool(&map, "ok")?,
        }),
        "RECEIVE OK" => Ok(Received {
            bytes: req_u64(&map, "bytes")?,
        }),
        "SEND OK" => Ok(Sent {
            bytes: req_u64(&map, "bytes")?,
        }),
        "COPY OK" => Ok(Copied {
            bytes: req_u64(&map, "bytes")?,
        }),
        "ERROR" => Ok(Error {
            reason: map
                .get("reason")
                .map(|s| unescape_reason(s))
                .unwrap_or_default(),
        }),
        _ => Err(ParseError::UnknownTag(tag)),
    }
}

/* ---------- helpers ---------- */

/// Everything before the first k=v token is the (possibly multi-word) tag.
fn split_line(line: &str) -> Result<(String, BTreeMap<String, String>), ParseError> {
    let s = line.trim_matches(|c| c == '\r' || c == '\n' || c == ' ');
    if s.is_empty() {
        return Err(ParseError::Empty);
    }

    let tokens: Vec<&str> = s.split_whitespace().collect();
    let kv_start = tokens
        .iter()
        .position(|t| t.contains('='))
        .unwrap_or(tokens.len());
    if kv_start == 0 {
        return Err(ParseError::MissingTag);
    }
    let tag = tokens[..kv_start].join(" ");
    let mut map = BTreeMap::<String, String>::new();

    for &tok in &tokens[kv_start..] {
        let (k, v) = tok
            .split_once('=')
            .ok_or_else(|| ParseError::BadPair(tok.to_string()))?;
        if k.is_empty() {
            return Err(ParseError::BadPair(tok.to_string()));
        }
        map.insert(k.to_string(), v.to_string());
    }
    Ok((tag, map))
}

fn req_u16(map: &BTreeMap<String, String>, k: &'static str) -> Result<u16, ParseError> {
    map.get(k).ok_or(ParseError::MissingField(k)).and_then(|v| {
        v.parse::<u16>()
            .map_err(|_| ParseError::BadInt(k, v.clone()))
    })
}
fn req_u64(map: &BTreeMap<String, String>, k: &'static str) -> Result<u64, ParseError> {
    map.get(k).ok_or(ParseError::MissingField(k)).and_then(|v| {
        v.parse::<u64>()
            .map_err(|_| ParseError::BadInt(k, v.clone()))
    })
}
fn req_bool(map: &BTreeMap<String, String>, k: &'static str) -> Result<bool, ParseError> {
    map.get(k).ok_or(ParseError::MissingField(k)).and_then(|v| {
        match v.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ParseError::BadBool(k, v.clone())),
        }
    })
}

/* ---------- value escaping for reason ---------- */

fn escape_reason(s: &str) -> String {
    // values can't contain whitespace; '_' stands for a space
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '_' => out.push_str("\\_"),
            ' ' => out.push('_'),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
fn unescape_reason(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '_' => out.push(' '),
            '\\' => match chars.next() {
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            },
            c => out.push(c),
        }
    }
    out
}

/* ---------- tests ---------- */
