use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, bounded, select, tick, unbounded};
use tracing::{debug, info, warn};

use crate::client::test_config::TestConfig;
use crate::control::ControlClient;
use crate::error::Result;
use crate::stats::{BitRate, Sampler, StatEvent};
use crate::worker::Role;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on the wait for the closing stats publish.
const FINAL_PUBLISH_WAIT: Duration = Duration::from_secs(1);

/// Outcome of one measurement.
#[derive(Debug, Clone)]
pub struct TestSummary {
    pub role: Role,
    /// Bytes reported by the local worker.
    pub bytes: u64,
    /// Byte count reported by the server, if its side completed.
    pub server_bytes: Option<u64>,
    /// Total bytes over total wall time.
    pub average: BitRate,
    /// Last value of the sliding-window average.
    pub window_average: BitRate,
}

/// Runs one test end to end: control handshake, local worker, sampling loop
/// and teardown. Only control-plane failures are errors; a worker that dies
/// mid-transfer ends the test with whatever it moved.
pub fn dispatch(
    stats: &Sender<StatEvent>,
    config: &TestConfig,
    role: Role,
) -> Result<TestSummary> {
    let name = role.name();
    info!(test = name, host = %config.target_host, bytes = config.byte_goal, "measuring");

    let mut control = ControlClient::dial(&config.control_addr())?;
    let port = control.start()?;
    let data_addr = config.data_addr(&port);
    debug!(%data_addr, "payload address");

    let pending = match control.begin(&role.remote_request(config.byte_goal)) {
        Ok(pending) => pending,
        Err(e) => {
            stop_session(&mut control, name);
            return Err(e);
        }
    };

    let (stop_tx, stop_rx) = bounded::<()>(1);
    let (report_tx, report_rx) = unbounded::<u64>();
    let goal = config.byte_goal;
    let spawned = thread::Builder::new()
        .name(format!("worker-{}", name.to_ascii_lowercase()))
        .spawn(move || role.work(stop_rx, report_tx, goal, &data_addr));
    let worker = match spawned {
        Ok(worker) => worker,
        Err(e) => {
            // the server gives up on its own once the accept deadline passes
            if let Err(e) = control.finish(pending) {
                debug!(test = name, "server side after failed spawn: {e}");
            }
            stop_session(&mut control, name);
            return Err(e.into());
        }
    };

    let ticker = tick(SAMPLE_INTERVAL);
    let mut sampler = Sampler::new();

    let rate = loop {
        select! {
            recv(ticker) -> _ => {
                let rate = sampler.sample();
                if sampler.total >= config.byte_goal {
                    let _ = stop_tx.try_send(());
                    break rate;
                }
                // best effort, a busy sink just misses this tick
                let _ = stats.try_send(StatEvent::running(name, rate));
            }
            recv(report_rx) -> msg => match msg {
                Ok(n) => sampler.add_bytes(n),
                Err(_) => break sampler.sample(),
            }
        }
    };

    if stats
        .send_timeout(StatEvent::running(name, rate), FINAL_PUBLISH_WAIT)
        .is_err()
    {
        debug!("final stats dropped");
    }

    if worker.join().is_err() {
        warn!(test = name, "worker panicked");
    }
    // reports that raced with the goal check
    for n in report_rx.try_iter() {
        sampler.add_bytes(n);
    }

    let server_bytes = match control.finish(pending) {
        Ok(n) => Some(n),
        Err(e) => {
            warn!(test = name, "server side of transfer failed: {e}");
            None
        }
    };
    let average = sampler.session_average();
    info!(
        test = name,
        goal = config.byte_goal,
        local = sampler.total,
        server = ?server_bytes,
        mbps = average.mbps(),
        throughput = %average.byte_rate(),
        "test finished"
    );

    stop_session(&mut control, name);

    Ok(TestSummary {
        role,
        bytes: sampler.total,
        server_bytes,
        average,
        window_average: rate,
    })
}

/// Releases the server's data listener; failures are only logged.
fn stop_session(control: &mut ControlClient, name: &str) {
    match control.stop() {
        Ok(true) => {}
        Ok(false) => warn!(test = name, "server refused to stop session"),
        Err(e) => warn!(test = name, "stop failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeterError;
    use crate::server::Server;
    use crate::control::write_line;
    use crate::stats::StatStatus;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn spawn_server() -> u16 {
        let server = Server::bind("127.0.0.1:0")
            .unwrap()
            .with_accept_timeout(Duration::from_millis(500));
        let port = server.local_addr().unwrap().port();
        thread::spawn(move || server.serve());
        port
    }

    fn config(port: u16, byte_goal: u64) -> TestConfig {
        TestConfig {
            target_host: "127.0.0.1".into(),
            control_port: port.to_string(),
            byte_goal,
            continuous: false,
        }
    }

    #[test]
    fn upload_five_million_bytes() {
        let port = spawn_server();
        let (stats_tx, stats_rx) = bounded(64);
        let summary = dispatch(&stats_tx, &config(port, 5_000_000), Role::Sender).unwrap();
        assert_eq!(summary.bytes, 5_000_000);
        assert_eq!(summary.server_bytes, Some(5_000_000));
        assert!(summary.average.bps() > 0);

        let events: Vec<StatEvent> = stats_rx.try_iter().collect();
        let last = events.last().unwrap();
        assert_eq!(last.status, StatStatus::Running);
        assert_eq!(last.test_name, "Upload");
        assert!(last.rate.mbps() > 0.0);
    }

    #[test]
    fn download_reaches_goal() {
        let port = spawn_server();
        let (stats_tx, _stats_rx) = bounded(64);
        let summary = dispatch(&stats_tx, &config(port, 3 << 20), Role::Receiver).unwrap();
        assert_eq!(summary.bytes, 3 << 20);
        assert_eq!(summary.server_bytes, Some(3 << 20));
    }

    #[test]
    fn zero_byte_goal_still_finishes() {
        let port = spawn_server();
        let (stats_tx, stats_rx) = bounded(4);
        let summary = dispatch(&stats_tx, &config(port, 0), Role::Sender).unwrap();
        assert_eq!(summary.bytes, 0);
        let events: Vec<StatEvent> = stats_rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, StatStatus::Running);
    }

    #[test]
    fn dial_failure_is_reported() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let (stats_tx, stats_rx) = bounded(4);
        let err = dispatch(&stats_tx, &config(port, 1024), Role::Sender).unwrap_err();
        assert!(matches!(err, MeterError::Dial { .. }));
        assert!(stats_rx.try_recv().is_err());
    }

    #[test]
    fn full_stats_sink_does_not_block() {
        let port = spawn_server();
        // capacity one and never drained
        let (stats_tx, _stats_rx) = bounded(1);
        stats_tx.send(StatEvent::stopped()).unwrap();
        let summary = dispatch(&stats_tx, &config(port, 1 << 20), Role::Sender).unwrap();
        assert_eq!(summary.bytes, 1 << 20);
    }

    // Control peer whose data listener accepts the upload and never reads it.
    fn stalled_upload_peer() -> (u16, thread::JoinHandle<Vec<String>>) {
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let data = TcpListener::bind("127.0.0.1:0").unwrap();
        let control_port = control.local_addr().unwrap().port();
        let data_port = data.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (conn, _) = control.accept().unwrap();
            let mut reader = BufReader::new(conn.try_clone().unwrap());
            let mut writer = conn;
            let mut seen = Vec::new();
            let mut held = None;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                let reply = match line.split(' ').next() {
                    Some("START") => format!("START OK port={data_port}\r\n"),
                    Some("RECEIVE") => {
                        held = Some(data.accept().unwrap().0);
                        "ERROR reason=peer_stalled\r\n".to_string()
                    }
                    _ => "STOP OK ok=true\r\n".to_string(),
                };
                seen.push(line);
                write_line(&mut writer, &reply).unwrap();
            }
            drop(held);
            seen
        });
        (control_port, handle)
    }

    #[test]
    fn write_deadline_ends_test_with_partial_total() {
        let (port, peer) = stalled_upload_peer();
        let goal = 64 << 20;
        let (stats_tx, stats_rx) = bounded(64);
        let summary = dispatch(&stats_tx, &config(port, goal), Role::Sender).unwrap();

        assert!(summary.bytes > 0 && summary.bytes < goal);
        assert!(summary.average.bps() > 0);
        assert_eq!(summary.server_bytes, None);

        let events: Vec<StatEvent> = stats_rx.try_iter().collect();
        let last = events.last().unwrap();
        assert_eq!(last.status, StatStatus::Running);
        assert_eq!(last.test_name, "Upload");

        let seen = peer.join().unwrap();
        assert_eq!(seen[0], "START");
        assert_eq!(seen[1], format!("RECEIVE bytes={goal}"));
        // session is released even though the transfer failed
        assert_eq!(seen[2], "STOP");
    }
}
