use anyhow::Result;
use clap::Parser;

mod cli;
mod client;
mod control;
mod error;
mod logging;
mod proto;
mod server;
mod stats;
mod worker;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.log_file.as_deref())?;
    match args.cmd {
        cli::Cmd::Server(opts) => server::run(opts),
        cli::Cmd::Client(opts) => client::run(opts),
    }
}
