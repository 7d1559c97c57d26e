//! End-to-end tests over real sockets: controller, publisher, detector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ringmaster::client::{Commander, ControlClient};
use ringmaster::controller::{Controller, RouterEndpoint};
use ringmaster::target::{HandlerResult, Registry, Reply, Target};

/// Supervisor whose `quit` blocks until the test releases it.
struct Gate {
    release: Receiver<()>,
    progress: Sender<&'static str>,
    stop: Arc<AtomicBool>,
}

impl Target for Gate {
    fn has_operation(&self, verb: &str) -> bool {
        matches!(verb, "quit" | "ping")
    }

    fn invoke(&mut self, verb: &str, _args: &[String]) -> HandlerResult {
        if verb == "ping" {
            return Ok(Reply::text("pong"));
        }
        let _ = self.progress.send("quit started");
        let _ = self.release.recv_timeout(Duration::from_secs(10));
        self.stop.store(true, Ordering::Release);
        let _ = self.progress.send("quit finished");
        Ok(Reply::ok())
    }
}

impl Registry for Gate {
    fn contains(&self, _name: &str) -> bool {
        false
    }

    fn resolve(&mut self, _name: &str) -> Option<&mut dyn Target> {
        None
    }
}

fn client_for(addr: std::net::SocketAddr) -> ControlClient {
    ControlClient::new(addr.to_string()).with_timeout(Duration::from_secs(5))
}

#[test]
fn shutdown_is_acknowledged_before_the_handler_runs() {
    let (release_tx, release_rx) = mpsc::channel();
    let (progress_tx, progress_rx) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let gate = Gate {
        release: release_rx,
        progress: progress_tx,
        stop: Arc::clone(&stop),
    };

    let endpoint = RouterEndpoint::bind("127.0.0.1:0").unwrap();
    let mut controller = Controller::new(endpoint, gate, Duration::from_millis(50), Arc::clone(&stop));
    let client = client_for(controller.local_addr());
    let runner = thread::spawn(move || controller.run());

    assert_eq!(client.call("ping").unwrap(), "pong");

    // The ack arrives while the handler is still blocked.
    assert_eq!(client.call("QUIT").unwrap(), "ok");
    assert_eq!(
        progress_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "quit started"
    );
    assert!(!stop.load(Ordering::Acquire));

    release_tx.send(()).unwrap();
    assert_eq!(
        progress_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "quit finished"
    );
    runner.join().unwrap().unwrap();

    // Exactly one reply: nothing else is waiting on the connection.
    assert!(client.call("ping").is_err());
}

#[cfg(unix)]
mod supervisor {
    use super::*;
    use ringmaster::config::{ProjectConfig, ShowConfig};
    use ringmaster::daemon::Daemon;
    use ringmaster::show::ShowOptions;

    fn local_config() -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.controller.endpoint = "127.0.0.1:0".to_string();
        config.controller.timeout_millis = 50;
        config.pubsub.endpoint = "127.0.0.1:0".to_string();
        config.flapping.check_delay_secs = 0.0;
        config
    }

    fn start(config: &ProjectConfig) -> (ControlClient, Arc<AtomicBool>, thread::JoinHandle<anyhow::Result<()>>) {
        let stop = Arc::new(AtomicBool::new(false));
        let daemon = Daemon::bind(config, Arc::clone(&stop)).unwrap();
        let client = client_for(daemon.control_addr());
        let runner = thread::spawn(move || daemon.run());
        (client, stop, runner)
    }

    #[test]
    fn loop_survives_bad_commands() {
        let mut config = local_config();
        config.shows.push(ShowConfig {
            name: "web".to_string(),
            options: ShowOptions::new("sleep 30"),
        });
        let (client, _stop, runner) = start(&config);

        assert_eq!(client.call("").unwrap(), "error: empty command");
        assert_eq!(client.call("frobnicate").unwrap(), "error: message 'frobnicate'");
        assert_eq!(
            client.call("status nosuch").unwrap(),
            "error: program nosuch not found"
        );
        assert_eq!(
            client.call("set web nosuch 1").unwrap(),
            "error: 'nosuch' option not found"
        );
        assert_eq!(
            client.call("add_show api").unwrap(),
            "error: invalid number of parameters"
        );
        assert!(client.call("signal web NOPE").unwrap().starts_with("error:"));

        assert_eq!(client.call("list").unwrap(), "web");
        assert_eq!(client.call("get web times").unwrap(), "2");
        assert_eq!(client.call("set web times 4").unwrap(), "ok");
        assert_eq!(client.call("get web times").unwrap(), "4");

        assert_eq!(client.call("terminate").unwrap(), "ok");
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn one_way_commands_take_effect() {
        let mut config = local_config();
        config.flapping.enabled = false;
        config.shows.push(ShowConfig {
            name: "web".to_string(),
            options: ShowOptions::new("sleep 30"),
        });
        let (client, _stop, runner) = start(&config);

        client.send_one_way("stop_show web").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.call("status").unwrap() != "web: stopped" {
            assert!(Instant::now() < deadline, "one-way stop never applied");
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(client.call("quit").unwrap(), "ok");
        runner.join().unwrap().unwrap();
    }

    fn audit_events(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|value| value["event"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn crash_loop_is_retried_then_terminated() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = tmp.path().join("flapping.jsonl");

        let mut config = local_config();
        config.flapping.audit_log = Some(audit.clone());
        let mut options = ShowOptions::new("true");
        options.times = 3;
        options.within = 5.0;
        options.retry_in = 0.3;
        options.max_retry = 1;
        config.shows.push(ShowConfig {
            name: "flaky".to_string(),
            options,
        });
        let (client, _stop, runner) = start(&config);

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            if audit_events(&audit).iter().any(|e| e == "terminated") {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "never terminated: {:?}",
                audit_events(&audit)
            );
            thread::sleep(Duration::from_millis(50));
        }

        let events = audit_events(&audit);
        let position = |name: &str| events.iter().position(|e| e == name);
        assert_eq!(position("config_refreshed"), Some(0), "{events:?}");
        let scheduled = position("retry_scheduled").expect("retry scheduled");
        let terminated = position("terminated").unwrap();
        assert!(position("flapping_detected").unwrap() < scheduled, "{events:?}");
        assert!(scheduled < terminated, "{events:?}");

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.call("status").unwrap() != "flaky: stopped" {
            assert!(Instant::now() < deadline, "show still active after terminate");
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(client.call("quit").unwrap(), "ok");
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn reset_flapping_is_routed_to_the_detector() {
        let tmp = tempfile::tempdir().unwrap();
        let audit = tmp.path().join("flapping.jsonl");

        let mut config = local_config();
        config.flapping.audit_log = Some(audit.clone());
        let mut options = ShowOptions::new("true");
        options.times = 2;
        options.within = 5.0;
        options.retry_in = 30.0;
        config.shows.push(ShowConfig {
            name: "flaky".to_string(),
            options,
        });
        let (client, _stop, runner) = start(&config);

        let deadline = Instant::now() + Duration::from_secs(20);
        while !audit_events(&audit).iter().any(|e| e == "retry_scheduled") {
            assert!(Instant::now() < deadline, "no retry scheduled");
            thread::sleep(Duration::from_millis(50));
        }

        assert_eq!(client.call("reset_flapping flaky").unwrap(), "ok");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !audit_events(&audit).iter().any(|e| e == "reset") {
            assert!(Instant::now() < deadline, "reset never reached the detector");
            thread::sleep(Duration::from_millis(20));
        }

        let lines = std::fs::read_to_string(&audit).unwrap();
        let reset: serde_json::Value = lines
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
            .find(|value| value["event"] == "reset")
            .unwrap();
        assert_eq!(reset["data"]["show"], "flaky");
        assert_eq!(reset["data"]["cancelled_retry"], true);

        assert_eq!(client.call("quit").unwrap(), "ok");
        runner.join().unwrap().unwrap();
    }
}
