use std::str::FromStr;

use crate::error::{MeterError, Result};
use crate::worker::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    pub target_host: String,
    pub control_port: String,
    pub byte_goal: u64,
    pub continuous: bool, // accepted, never consulted
}

impl TestConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.target_host, self.control_port)
    }
    pub fn data_addr(&self, port: &str) -> String {
        format!("{}:{}", self.target_host, port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub name: String,
    pub config: TestConfig,
}

/// What a request name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Run(Role),
    /// Explicit "stop" token. Nothing is running to stop, so it is ignored.
    Noop,
}

pub fn resolve_test(name: &str) -> Result<TestKind> {
    match name.to_ascii_lowercase().as_str() {
        "upload" | "up" => Ok(TestKind::Run(Role::Sender)),
        "download" | "down" => Ok(TestKind::Run(Role::Receiver)),
        "stop" => Ok(TestKind::Noop),
        _ => Err(MeterError::UnknownRequest(name.to_string())),
    }
}

/// Multiplier applied to the requested byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Kb,
    Mb,
    Gb,
}

impl Unit {
    pub fn multiplier(self) -> u64 {
        match self {
            Unit::Kb => 1 << 10,
            Unit::Mb => 1 << 20,
            Unit::Gb => 1 << 30,
        }
    }
    pub fn bytes(self, count: u64) -> u64 {
        count.saturating_mul(self.multiplier())
    }
}

impl FromStr for Unit {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "KB" => Ok(Unit::Kb),
            "MB" => Ok(Unit::Mb),
            "GB" => Ok(Unit::Gb),
            _ => Err(format!("unit must be KB, MB or GB, got {s:?}")),
        }
    }
}
