/// Requests sent by the client over the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlRequest {
    // ---- Session ----
    Start,
    Stop,

    // ---- Data plane ----
    Receive { bytes: u64 },
    Send { bytes: u64 },
    Copy,
}

/// Server replies, one per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlReply {
    Started { port: u16 },
    Stopped { ok: bool },
    Received { bytes: u64 },
    Sent { bytes: u64 },
    Copied { bytes: u64 },
    Error { reason: String },
}
