//! Coordinator failover and failback against scripted backends.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use phoenix_miner::backend::{Backend, BackendEvent, BackendFactory, BackendKind, BackendUrl, EventSink};
use phoenix_miner::config::{Config, KernelConfig};
use phoenix_miner::hashing::SubmissionPayload;
use phoenix_miner::kernel::{Kernel, KernelRegistry};
use phoenix_miner::Coordinator;

/// Per-host count of connection attempts before the host starts accepting.
#[derive(Clone, Default)]
struct Scenario {
    fail_first: Arc<Mutex<HashMap<String, usize>>>,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    reachable: Arc<Mutex<HashMap<String, bool>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Scenario {
    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|e| *e == entry).count()
    }
}

struct ScriptedBackend {
    host: String,
    events: EventSink,
    scenario: Scenario,
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Rpc
    }

    fn connect(&mut self) {
        self.scenario.record(format!("connect {}", self.host));
        let attempt = {
            let mut attempts = self.scenario.attempts.lock();
            let n = attempts.entry(self.host.clone()).or_default();
            *n += 1;
            *n
        };
        let failures = self.scenario.fail_first.lock().get(&self.host).copied().unwrap_or(0);
        if attempt > failures {
            self.events.emit(BackendEvent::Connect);
        } else {
            self.events.emit(BackendEvent::Failure);
        }
    }

    fn disconnect(&mut self) {}

    fn request_work(&self) {}

    fn send_result(&self, _payload: SubmissionPayload) -> BoxFuture<'static, bool> {
        async { false }.boxed()
    }

    fn accepts_old_work(&self) -> bool {
        false
    }
}

struct ScriptedFactory(Scenario);

fn host(url: &BackendUrl) -> String {
    url.endpoint().host_str().unwrap_or_default().to_string()
}

impl BackendFactory for ScriptedFactory {
    fn create(&self, url: &BackendUrl, events: EventSink) -> Box<dyn Backend> {
        self.0.record(format!("create {}", host(url)));
        Box::new(ScriptedBackend {
            host: host(url),
            events,
            scenario: self.0.clone(),
        })
    }

    fn probe(&self, url: &BackendUrl) -> BoxFuture<'static, bool> {
        self.0.record(format!("probe {}", host(url)));
        let up = self.0.reachable.lock().get(&host(url)).copied().unwrap_or(false);
        async move { up }.boxed()
    }
}

struct IdleKernel;

impl Kernel for IdleKernel {
    fn name(&self) -> &str {
        "idle"
    }

    fn start(&mut self) -> phoenix_miner::Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}
}

fn coordinator(scenario: &Scenario) -> Coordinator {
    let mut config = Config::default();
    config.backends.url = "http://worker:x@primary.example:8332/".to_string();
    config.backends.backups = vec!["mmp://worker:x@backup.example:3333".to_string()];
    config.backends.failback_interval_secs = 60;
    config.stats.report_interval_secs = 3600;
    config.kernels = vec![KernelConfig {
        name: "idle".to_string(),
        threads: 1,
        batch: 1,
    }];

    let mut registry = KernelRegistry::empty();
    registry.register("idle", |_, _| Ok(Box::new(IdleKernel) as Box<dyn Kernel>));

    Coordinator::new(config)
        .with_factory(Arc::new(ScriptedFactory(scenario.clone())))
        .with_registry(registry)
}

#[tokio::test(start_paused = true)]
async fn test_switches_to_backup_after_first_failure() {
    let scenario = Scenario::default();
    scenario.fail_first.lock().insert("primary.example".to_string(), 3);

    let coordinator = coordinator(&scenario);
    let shutdown = coordinator.shutdown_token();
    let task = tokio::spawn(coordinator.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        scenario.log(),
        vec![
            "create primary.example",
            "connect primary.example",
            "create backup.example",
            "connect backup.example",
        ]
    );

    // Failback probe at the configured interval, not before
    assert_eq!(scenario.count("probe primary.example"), 0);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(scenario.count("probe primary.example"), 1);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(scenario.count("probe primary.example"), 2);
    assert_eq!(scenario.count("create primary.example"), 1);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fails_back_when_primary_recovers() {
    let scenario = Scenario::default();
    scenario.fail_first.lock().insert("primary.example".to_string(), 1);

    let coordinator = coordinator(&scenario);
    let stats = coordinator.stats();
    let shutdown = coordinator.shutdown_token();
    let task = tokio::spawn(coordinator.run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    scenario.reachable.lock().insert("primary.example".to_string(), true);
    tokio::time::sleep(Duration::from_secs(60)).await;

    let log = scenario.log();
    assert_eq!(
        &log[log.len() - 3..],
        ["probe primary.example", "create primary.example", "connect primary.example"]
    );
    assert!(stats.lock().status_line().contains("primary.example"));

    shutdown.cancel();
    task.await.unwrap().unwrap();
}
