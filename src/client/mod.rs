use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use crossbeam_channel::{Receiver, Sender, bounded, select, tick, unbounded};
use tracing::{debug, info, warn};

use crate::cli::ClientOpts;
use crate::stats::{StatEvent, log_stats};

pub mod dispatch;
pub mod test_config;

pub use dispatch::dispatch;
pub use test_config::{TestConfig, TestKind, TestRequest, Unit, resolve_test};

pub const IDLE_INTERVAL: Duration = Duration::from_secs(1);
const STATS_CAPACITY: usize = 10;

/// Feeds the requested tests to a command loop and logs its stats until the
/// loop shuts down.
pub fn run(opts: ClientOpts) -> anyhow::Result<()> {
    let (req_tx, req_rx) = unbounded();
    let (stats_tx, stats_rx) = bounded(STATS_CAPACITY);

    let looper = thread::Builder::new()
        .name("command-loop".into())
        .spawn(move || command_loop(req_rx, stats_tx))
        .context("spawning command loop")?;
    let sink = thread::Builder::new()
        .name("stats".into())
        .spawn(move || log_stats(stats_rx))
        .context("spawning stats sink")?;

    for req in opts.requests() {
        req_tx.send(req).context("command loop exited early")?;
    }
    drop(req_tx);

    looper.join().map_err(|_| anyhow!("command loop panicked"))?;
    sink.join().map_err(|_| anyhow!("stats sink panicked"))?;
    Ok(())
}

/// Runs requests one at a time until the request channel closes, then drops
/// `stats` so the consumer sees the sink close. While idle a Stopped event is
/// offered every [`IDLE_INTERVAL`].
pub fn command_loop(requests: Receiver<TestRequest>, stats: Sender<StatEvent>) {
    info!("command loop started");
    let idle = tick(IDLE_INTERVAL);

    loop {
        select! {
            recv(requests) -> msg => {
                let Ok(req) = msg else {
                    info!("request source closed, shutting down");
                    break;
                };
                run_request(&req, &stats);
            }
            recv(idle) -> _ => {
                let _ = stats.try_send(StatEvent::stopped());
            }
        }
    }
    drop(stats);
}

fn run_request(req: &TestRequest, stats: &Sender<StatEvent>) {
    debug!(name = %req.name, "request");
    match resolve_test(&req.name) {
        Ok(TestKind::Run(role)) => match dispatch(stats, &req.config, role) {
            Ok(summary) => info!(
                test = summary.role.name(),
                bytes = summary.bytes,
                server_bytes = ?summary.server_bytes,
                avg_mbps = summary.average.mbps(),
                window_mbps = summary.window_average.mbps(),
                "test complete"
            ),
            Err(e) => warn!(test = role.name(), "test failed: {e}"),
        },
        Ok(TestKind::Noop) => debug!("stop requested while idle"),
        Err(e) => {
            warn!("{e}");
            let _ = stats.try_send(StatEvent::error(format!("Illegal command: {}", req.name)));
        }
    }
}
