use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::client::{TestConfig, TestRequest, Unit};

#[derive(Parser, Debug, Clone)]
#[command(name = "tcp-meter", about = "TCP throughput meter (client/server)")]
pub struct Cli {
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Serve control requests and the payload endpoint
    Server(ServerOpts),
    /// Run throughput tests against a server
    Client(ClientOpts),
}

#[derive(Args, Debug, Clone)]
pub struct ServerOpts {
    /// Control listen address
    #[arg(long, default_value = "0.0.0.0:8001")]
    pub addr: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientOpts {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server control port
    #[arg(long, default_value_t = 8001)]
    pub port: u16,
    /// Test to run: upload or download. Repeat to queue several.
    #[arg(long = "test", required = true)]
    pub tests: Vec<String>,
    /// Amount to transfer, in --unit
    #[arg(long, default_value_t = 10)]
    pub count: u64,
    /// KB, MB or GB
    #[arg(long, default_value = "MB")]
    pub unit: Unit,
    /// Repeat the test (accepted, currently has no effect)
    #[arg(long, default_value_t = false)]
    pub continuous: bool,
}

impl ClientOpts {
    pub fn config(&self) -> TestConfig {
        TestConfig {
            target_host: self.host.clone(),
            control_port: self.port.to_string(),
            byte_goal: self.unit.bytes(self.count),
            continuous: self.continuous,
        }
    }

    pub fn requests(&self) -> Vec<TestRequest> {
        self.tests
            .iter()
            .map(|name| TestRequest {
                name: name.clone(),
                config: self.config(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_flags_build_requests() {
        let cli = Cli::parse_from([
            "tcp-meter",
            "--log-file",
            "/tmp/meter.log",
            "client",
            "--host",
            "10.0.0.2",
            "--test",
            "upload",
            "--test",
            "rtt",
            "--count",
            "5",
            "--unit",
            "KB",
        ]);
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/meter.log")));
        let Cmd::Client(opts) = cli.cmd else {
            panic!("expected client subcommand");
        };
        let reqs = opts.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].name, "upload");
        assert_eq!(reqs[1].name, "rtt");
        assert_eq!(reqs[0].config.control_addr(), "10.0.0.2:8001");
        assert_eq!(reqs[0].config.byte_goal, 5 * 1024);
        assert!(!reqs[0].config.continuous);
    }

    #[test]
    fn server_defaults() {
        let cli = Cli::parse_from(["tcp-meter", "server"]);
        let Cmd::Server(opts) = cli.cmd else {
            panic!("expected server subcommand");
        };
        assert_eq!(opts.addr, "0.0.0.0:8001");
    }

    #[test]
    fn bad_unit_rejected() {
        assert!(
            Cli::try_parse_from(["tcp-meter", "client", "--test", "up", "--unit", "TB"]).is_err()
        );
    }
}
