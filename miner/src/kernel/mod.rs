//! Compute kernels and the interface they use to reach the coordinator.
//!
//! Kernels run on their own OS threads. Everything they need from the
//! event loop goes through [`KernelInterface`], which marshals requests
//! onto the coordinator's command channel and hands answers back.

pub mod cpu;

use log::{debug, error, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::{MinerError, Result};
use crate::hashing::{self, HashOracle, SubmissionPayload};
use crate::stats::MinerStats;
use crate::work::{NonceRange, RangeDelivery, RangeSource, WorkUnit};

pub use cpu::CpuKernel;

/// Requests from kernel threads to the coordinator loop.
pub(crate) enum CoreCommand {
    FetchRange {
        size: u64,
        reply: oneshot::Sender<NonceRange>,
    },
    FetchUnit {
        reply: oneshot::Sender<Arc<WorkUnit>>,
    },
    FoundNonce {
        unit: Arc<WorkUnit>,
        nonce: u32,
        timestamp: Option<u32>,
    },
    KernelFatal {
        kernel: usize,
        message: String,
    },
}

/// Outcome of checking a candidate against its unit.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Submit(SubmissionPayload),
    Stale,
    AboveTarget,
}

/// Recompute the hash for `nonce` and decide whether it is worth sending.
pub(crate) fn judge(
    oracle: &dyn HashOracle,
    unit: &WorkUnit,
    nonce: u32,
    timestamp: Option<u32>,
    accepts_old_work: bool,
) -> Verdict {
    if unit.is_stale() && !accepts_old_work {
        return Verdict::Stale;
    }
    let timestamp = timestamp.unwrap_or_else(|| unit.timestamp());
    let header = hashing::assemble_header(unit.data(), timestamp, nonce);
    if !hashing::check_target(&oracle.digest(&header), unit.target()) {
        return Verdict::AboveTarget;
    }
    Verdict::Submit(SubmissionPayload::new(unit.data(), timestamp, nonce))
}

// ═══════════════════════════════════════════════════════════════════════
// KERNEL TRAIT + REGISTRY
// ═══════════════════════════════════════════════════════════════════════

/// A compute backend. `start` spawns its threads and returns; `stop`
/// returns once they have all exited.
pub trait Kernel: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self);
}

/// Per-kernel settings taken from the `[[kernels]]` config entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSettings {
    pub name: String,
    /// Worker threads; 0 means one per logical CPU
    pub threads: usize,
    /// Nonces hashed between stop-flag checks
    pub batch: u64,
    /// Initial range size requested by each worker
    pub range_size: u64,
}

pub type KernelFactory =
    Box<dyn Fn(&KernelSettings, KernelInterface) -> Result<Box<dyn Kernel>> + Send + Sync>;

/// Named kernel constructors, populated before the coordinator starts.
pub struct KernelRegistry {
    factories: BTreeMap<String, KernelFactory>,
}

impl KernelRegistry {
    /// A registry with nothing in it.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&KernelSettings, KernelInterface) -> Result<Box<dyn Kernel>> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_ascii_lowercase(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, settings: &KernelSettings, iface: KernelInterface) -> Result<Box<dyn Kernel>> {
        let factory = self
            .factories
            .get(&settings.name.to_ascii_lowercase())
            .ok_or_else(|| MinerError::UnknownKernel(settings.name.clone()))?;
        factory(settings, iface)
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("cpu", |settings, iface| {
            Ok(Box::new(CpuKernel::new(settings, iface)) as Box<dyn Kernel>)
        });
        registry
    }
}

// ═══════════════════════════════════════════════════════════════════════
// KERNEL INTERFACE
// ═══════════════════════════════════════════════════════════════════════

/// Everything a kernel may ask of the coordinator. Cheap to clone; safe
/// to use from any thread.
#[derive(Clone)]
pub struct KernelInterface {
    name: Arc<str>,
    kernel: usize,
    index: Option<usize>,
    commands: mpsc::UnboundedSender<CoreCommand>,
    runtime: Handle,
    oracle: Arc<dyn HashOracle>,
    accepts_old_work: Arc<AtomicBool>,
    stats: Arc<Mutex<MinerStats>>,
}

impl KernelInterface {
    pub(crate) fn new(
        name: &str,
        kernel: usize,
        commands: mpsc::UnboundedSender<CoreCommand>,
        runtime: Handle,
        oracle: Arc<dyn HashOracle>,
        accepts_old_work: Arc<AtomicBool>,
        stats: Arc<Mutex<MinerStats>>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            kernel,
            index: None,
            commands,
            runtime,
            oracle,
            accepts_old_work,
            stats,
        }
    }

    /// Copy of this interface that tags rate samples with a thread index.
    pub fn with_index(&self, index: usize) -> Self {
        let mut iface = self.clone();
        iface.index = Some(index);
        iface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    // ──── Work ────

    /// Resolves to `None` once the coordinator has shut down.
    pub async fn fetch_range(&self, size: u64) -> Option<NonceRange> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(CoreCommand::FetchRange { size, reply }).ok()?;
        rx.await.ok()
    }

    pub async fn fetch_unit(&self) -> Option<Arc<WorkUnit>> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(CoreCommand::FetchUnit { reply }).ok()?;
        rx.await.ok()
    }

    // ──── Results ────

    pub fn calculate_hash(&self, unit: &WorkUnit, nonce: u32, timestamp: Option<u32>) -> [u8; 32] {
        let timestamp = timestamp.unwrap_or_else(|| unit.timestamp());
        self.oracle
            .digest(&hashing::assemble_header(unit.data(), timestamp, nonce))
    }

    pub fn check_target(&self, hash: &[u8; 32], target: &[u8; hashing::TARGET_LEN]) -> bool {
        hashing::check_target(hash, target)
    }

    /// Returns whether the nonce met target and was forwarded for submission.
    pub fn found_nonce(&self, unit: &Arc<WorkUnit>, nonce: u32, timestamp: Option<u32>) -> bool {
        let accepts_old = self.accepts_old_work.load(Ordering::Relaxed);
        match judge(&*self.oracle, unit, nonce, timestamp, accepts_old) {
            Verdict::Submit(_) => self
                .commands
                .send(CoreCommand::FoundNonce {
                    unit: Arc::clone(unit),
                    nonce,
                    timestamp,
                })
                .is_ok(),
            Verdict::Stale => {
                debug!(target: self.name(), "nonce {:08x} is for stale work, dropped", nonce);
                false
            }
            Verdict::AboveTarget => {
                debug!(target: self.name(), "nonce {:08x} does not meet target", nonce);
                false
            }
        }
    }

    /// Throughput sample in kH/s, tagged with this interface's thread index
    /// unless `index` overrides it.
    pub fn update_rate(&self, khash: f64, index: Option<usize>) {
        self.stats
            .lock()
            .update_rate(khash, self.kernel, index.or(self.index));
    }

    // ──── Logging ────

    pub fn debug(&self, msg: &str) {
        debug!(target: self.name(), "{}", msg);
    }

    pub fn log(&self, msg: &str) {
        info!(target: self.name(), "{}", msg);
    }

    pub fn error(&self, msg: &str) {
        error!(target: self.name(), "{}", msg);
    }

    /// Report an unrecoverable error; the coordinator stops this kernel only.
    pub fn fatal(&self, msg: &str) {
        error!(target: self.name(), "fatal: {}", msg);
        let _ = self.commands.send(CoreCommand::KernelFatal {
            kernel: self.kernel,
            message: msg.to_string(),
        });
    }
}

impl RangeSource for KernelInterface {
    fn request_range(&self, size: u64, deliver: RangeDelivery) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(CoreCommand::FetchRange { size, reply }).is_err() {
            deliver(None);
            return;
        }
        self.runtime.spawn(async move {
            deliver(rx.await.ok());
        });
    }

    fn report_iteration(&self, size: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.update_rate(size as f64 / secs / 1000.0, None);
        }
    }
}
