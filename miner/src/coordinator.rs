//! Core coordinator.
//!
//! One tokio task owns the work queue, the active backend client and the
//! kernels. Kernel threads, backend clients and queue timers all talk to
//! it over channels; nothing else touches its state.

use colored::*;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    Backend, BackendEvent, BackendFactory, BackendUrl, Backoff, DefaultFactory, EventSink, TaggedEvent,
};
use crate::config::Config;
use crate::error::Result;
use crate::hashing::{HashOracle, Sha256d};
use crate::kernel::{judge, CoreCommand, Kernel, KernelInterface, KernelRegistry, KernelSettings, Verdict};
use crate::stats::MinerStats;
use crate::work::{QueueEvent, WorkQueue, WorkUnit};

/// Builder and entry point for the miner core.
pub struct Coordinator {
    config: Config,
    factory: Option<Arc<dyn BackendFactory>>,
    registry: KernelRegistry,
    oracle: Arc<dyn HashOracle>,
    stats: Arc<Mutex<MinerStats>>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let stats = MinerStats::new(config.stats.sample_window);
        Self {
            config,
            factory: None,
            registry: KernelRegistry::default(),
            oracle: Arc::new(Sha256d),
            stats: Arc::new(Mutex::new(stats)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the default HTTP/socket client factory.
    pub fn with_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_registry(mut self, registry: KernelRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn HashOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Cancel to stop the miner.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Arc<Mutex<MinerStats>> {
        Arc::clone(&self.stats)
    }

    /// Validate the configuration, start kernels and run until shutdown.
    ///
    /// Only configuration and kernel start-up errors are returned; once
    /// running, backend trouble is handled by failover.
    pub async fn run(self) -> Result<()> {
        self.config.validate(&self.registry)?;
        let backends = self.config.backends.urls()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(DefaultFactory::new(self.config.backends.settings())),
        };

        let mut core = Core::new(&self.config, backends, factory, self.oracle, self.stats);
        if let Err(e) = core.start_kernels(&self.registry, self.config.kernel_settings()) {
            core.stop_kernels().await;
            return Err(e);
        }
        core.run(self.shutdown).await;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// EVENT LOOP STATE
// ═══════════════════════════════════════════════════════════════════════

struct Core {
    backends: Vec<BackendUrl>,
    factory: Arc<dyn BackendFactory>,
    active_index: usize,
    active: Option<Box<dyn Backend>>,
    /// Bumped for every client instance; older events are ignored
    generation: u64,
    connected: bool,
    backoff: Backoff,
    connect_at: Option<Instant>,
    failback_period: Duration,
    failback: Option<Interval>,
    probe: FuturesUnordered<BoxFuture<'static, bool>>,
    submissions: FuturesUnordered<BoxFuture<'static, bool>>,
    report_interval: Duration,

    queue: WorkQueue,
    kernels: Vec<(usize, Box<dyn Kernel>)>,
    oracle: Arc<dyn HashOracle>,
    stats: Arc<Mutex<MinerStats>>,
    accepts_old_work: Arc<AtomicBool>,

    commands_tx: mpsc::UnboundedSender<CoreCommand>,
    commands: mpsc::UnboundedReceiver<CoreCommand>,
    backend_tx: mpsc::UnboundedSender<TaggedEvent>,
    backend_events: mpsc::UnboundedReceiver<TaggedEvent>,
    queue_events: mpsc::UnboundedReceiver<QueueEvent>,
}

impl Core {
    fn new(
        config: &Config,
        backends: Vec<BackendUrl>,
        factory: Arc<dyn BackendFactory>,
        oracle: Arc<dyn HashOracle>,
        stats: Arc<Mutex<MinerStats>>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (backend_tx, backend_events) = mpsc::unbounded_channel();
        let (queue_tx, queue_events) = mpsc::unbounded_channel();
        let queue = WorkQueue::new(
            config.queue.size,
            Duration::from_secs(config.queue.delay_secs),
            config.queue.range_size,
            queue_tx,
        );

        Self {
            backends,
            factory,
            active_index: 0,
            active: None,
            generation: 0,
            connected: false,
            backoff: Backoff::default(),
            connect_at: None,
            failback_period: config.backends.failback_interval(),
            failback: None,
            probe: FuturesUnordered::new(),
            submissions: FuturesUnordered::new(),
            report_interval: Duration::from_secs(config.stats.report_interval_secs),
            queue,
            kernels: Vec::new(),
            oracle,
            stats,
            accepts_old_work: Arc::new(AtomicBool::new(false)),
            commands_tx,
            commands,
            backend_tx,
            backend_events,
            queue_events,
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        self.activate(0, Duration::ZERO);

        let mut status = time::interval_at(Instant::now() + self.report_interval, self.report_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(cmd) = self.commands.recv() => self.on_command(cmd),
                Some(tagged) = self.backend_events.recv() => self.on_backend_event(tagged),
                Some(event) = self.queue_events.recv() => self.on_queue_event(event),
                Some(accepted) = self.submissions.next(), if !self.submissions.is_empty() => {
                    self.on_submission(accepted)
                }
                Some(reachable) = self.probe.next(), if !self.probe.is_empty() => self.on_probe(reachable),
                _ = wait_until(self.connect_at) => self.connect_active(),
                _ = tick(&mut self.failback) => self.start_probe(),
                _ = status.tick() => self.report_status(),
            }
        }

        self.shutdown().await;
    }

    fn active_url(&self) -> &BackendUrl {
        &self.backends[self.active_index]
    }

    // ──── Kernels ────

    fn start_kernels(&mut self, registry: &KernelRegistry, settings: Vec<KernelSettings>) -> Result<()> {
        for (id, settings) in settings.into_iter().enumerate() {
            let iface = KernelInterface::new(
                &settings.name,
                id,
                self.commands_tx.clone(),
                Handle::current(),
                Arc::clone(&self.oracle),
                Arc::clone(&self.accepts_old_work),
                Arc::clone(&self.stats),
            );
            let mut kernel = registry.create(&settings, iface)?;
            kernel.start()?;
            info!("kernel {} #{} started", kernel.name().bright_cyan(), id);
            self.kernels.push((id, kernel));
        }
        Ok(())
    }

    fn stop_kernel(&mut self, id: usize, reason: &str) {
        let Some(pos) = self.kernels.iter().position(|(k, _)| *k == id) else {
            return;
        };
        let (_, mut kernel) = self.kernels.remove(pos);
        error!("kernel {} #{} stopped: {}", kernel.name(), id, reason);
        self.stats.lock().remove_kernel(id);
        tokio::task::spawn_blocking(move || kernel.stop());
        if self.kernels.is_empty() {
            warn!("no kernels left running");
        }
    }

    async fn stop_kernels(&mut self) {
        let stopping: Vec<_> = self
            .kernels
            .drain(..)
            .map(|(_, mut kernel)| tokio::task::spawn_blocking(move || kernel.stop()))
            .collect();
        for handle in stopping {
            let _ = handle.await;
        }
    }

    fn on_command(&mut self, cmd: CoreCommand) {
        match cmd {
            CoreCommand::FetchRange { size, reply } => self.queue.submit_range(size, reply),
            CoreCommand::FetchUnit { reply } => self.queue.submit_unit(reply),
            CoreCommand::FoundNonce { unit, nonce, timestamp } => self.found_nonce(unit, nonce, timestamp),
            CoreCommand::KernelFatal { kernel, message } => self.stop_kernel(kernel, &message),
        }
    }

    // ──── Results ────

    fn found_nonce(&mut self, unit: Arc<WorkUnit>, nonce: u32, timestamp: Option<u32>) {
        let accepts_old = self.accepts_old_work.load(Ordering::Relaxed);
        match judge(&*self.oracle, &unit, nonce, timestamp, accepts_old) {
            Verdict::Submit(payload) => {
                let Some(backend) = &self.active else {
                    warn!("result {:08x} found with no backend, dropped", nonce);
                    return;
                };
                debug!("submitting nonce {:08x} for unit {}", nonce, unit.id());
                self.submissions.push(backend.send_result(payload));
            }
            Verdict::Stale => debug!("result {:08x} is for stale unit {}, dropped", nonce, unit.id()),
            Verdict::AboveTarget => warn!("result {:08x} did not meet target on recheck", nonce),
        }
    }

    fn on_submission(&mut self, accepted: bool) {
        let mut stats = self.stats.lock();
        if accepted {
            stats.share_accepted();
            info!(
                "{} ({} accepted, {} rejected)",
                "result accepted".bright_green(),
                stats.shares_accepted(),
                stats.shares_rejected()
            );
        } else {
            stats.share_rejected();
            info!(
                "{} ({} accepted, {} rejected)",
                "result rejected".bright_red(),
                stats.shares_accepted(),
                stats.shares_rejected()
            );
        }
    }

    fn report_status(&mut self) {
        let (line, rate) = {
            let stats = self.stats.lock();
            (stats.status_line(), stats.rate())
        };
        if self.connected {
            if let Some(backend) = &self.active {
                backend.report_rate(rate);
            }
        }
        info!("{}", line);
    }

    // ──── Queue ────

    fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::RequestWork => match &self.active {
                Some(backend) if self.connected => backend.request_work(),
                _ => debug!("work wanted but no backend connected"),
            },
            QueueEvent::Idle(idle) => {
                self.stats.lock().set_idle(idle);
                if idle {
                    warn!("{}", "out of work, kernels idle".bright_yellow());
                } else {
                    info!("work available, resuming");
                }
            }
            QueueEvent::CheckWork => self.queue.check_work(),
            QueueEvent::Expire { lineage } => self.queue.expire(lineage),
        }
    }

    // ──── Backends ────

    /// Replace the active client with a fresh one for `index`, connecting
    /// after `delay`.
    fn activate(&mut self, index: usize, delay: Duration) {
        if let Some(mut old) = self.active.take() {
            old.disconnect();
        }
        self.active_index = index;
        self.generation += 1;
        self.connected = false;

        let url = self.backends[index].clone();
        let sink = EventSink::new(self.generation, self.backend_tx.clone());
        let backend = self.factory.create(&url, sink);
        self.accepts_old_work
            .store(backend.accepts_old_work(), Ordering::Relaxed);
        self.active = Some(backend);
        {
            let mut stats = self.stats.lock();
            stats.set_backend(&url.to_string());
            stats.set_connected(false);
        }

        if delay.is_zero() {
            self.connect_active();
        } else {
            debug!("connecting to {} in {:.1}s", url, delay.as_secs_f64());
            self.connect_at = Some(Instant::now() + delay);
        }
    }

    fn connect_active(&mut self) {
        self.connect_at = None;
        let url = self.active_url().clone();
        if let Some(backend) = self.active.as_mut() {
            debug!("connecting to {}", url);
            backend.connect();
        }
    }

    fn on_backend_event(&mut self, tagged: TaggedEvent) {
        if tagged.generation != self.generation {
            debug!("ignoring {:?} from a retired backend", tagged.event);
            return;
        }
        let url = self.active_url().clone();

        match tagged.event {
            BackendEvent::Connect => {
                self.connected = true;
                self.backoff.reset();
                self.stats.lock().set_connected(true);
                info!("connected to {}", url.to_string().bright_green());
                self.queue.request_if_needed();
            }
            BackendEvent::Disconnect => {
                self.stats.lock().set_connected(false);
                let delay = self.backoff.next_delay();
                warn!("lost connection to {}, reconnecting in {:.1}s", url, delay.as_secs_f64());
                self.activate(self.active_index, delay);
            }
            BackendEvent::Failure => self.fail_over(),
            BackendEvent::Work(desc) => {
                if let Err(e) = self.queue.store_work(&desc) {
                    warn!("discarding work from {}: {}", url, e);
                }
            }
            BackendEvent::Block(height) => {
                debug!("{} reports block {}", url, height);
                self.stats.lock().set_event(format!("block {}", height));
            }
            BackendEvent::Msg(text) => info!("[{}] {}", url, text),
        }
    }

    /// A connection attempt failed: move on to the next backend in line.
    fn fail_over(&mut self) {
        self.stats.lock().set_connected(false);
        let delay = self.backoff.next_delay();
        let next = (self.active_index + 1) % self.backends.len();

        if next == self.active_index {
            warn!(
                "failed to connect to {}, retrying in {:.1}s",
                self.active_url(),
                delay.as_secs_f64()
            );
        } else {
            warn!(
                "failed to connect to {}, {} {}",
                self.active_url(),
                "switching to".bright_yellow(),
                self.backends[next]
            );
        }

        if next == 0 {
            self.failback = None;
        } else if self.failback.is_none() {
            let mut interval = time::interval_at(Instant::now() + self.failback_period, self.failback_period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.failback = Some(interval);
        }
        self.activate(next, delay);
    }

    fn start_probe(&mut self) {
        if self.active_index == 0 {
            self.failback = None;
            return;
        }
        if !self.probe.is_empty() {
            return;
        }
        debug!("probing primary backend {}", self.backends[0]);
        self.probe.push(self.factory.probe(&self.backends[0]));
    }

    fn on_probe(&mut self, reachable: bool) {
        if !reachable || self.active_index == 0 {
            debug!("primary backend still unreachable");
            return;
        }
        debug!("primary backend {} is back, switching", self.backends[0]);
        self.failback = None;
        self.backoff.reset();
        self.activate(0, Duration::ZERO);
    }

    async fn shutdown(mut self) {
        info!("shutting down");
        self.queue.shutdown();
        if let Some(mut backend) = self.active.take() {
            backend.disconnect();
        }
        self.stop_kernels().await;
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
