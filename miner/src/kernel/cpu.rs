use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Kernel, KernelInterface, KernelSettings};
use crate::error::Result;
use crate::hashing;
use crate::work::{latency_sizer, QueueReader, StopHandle};

/// Default nonces hashed between stop-flag checks.
pub const DEFAULT_BATCH: u64 = 0x1000;

/// Wall-clock time each worker aims to spend on one range.
const TARGET_ITERATION: Duration = Duration::from_secs(1);

/// Reference kernel: plain double-SHA-256 on OS threads, one reader each.
pub struct CpuKernel {
    iface: KernelInterface,
    threads: usize,
    batch: u64,
    range_size: u64,
    stop: Arc<AtomicBool>,
    readers: Vec<StopHandle>,
    workers: Vec<JoinHandle<()>>,
}

impl CpuKernel {
    pub fn new(settings: &KernelSettings, iface: KernelInterface) -> Self {
        let threads = if settings.threads == 0 {
            num_cpus::get()
        } else {
            settings.threads
        };
        let batch = if settings.batch == 0 {
            DEFAULT_BATCH
        } else {
            settings.batch
        };
        Self {
            iface,
            threads,
            batch,
            range_size: settings.range_size.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn mining_loop(mut reader: QueueReader, iface: KernelInterface, stop: Arc<AtomicBool>, batch: u64) {
        reader.start();
        let mut found = 0u64;

        while let Some(range) = reader.next() {
            let unit = Arc::clone(range.unit());
            let mut nonces = range.nonces();

            loop {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                // Stale work is not worth finishing
                if unit.is_stale() {
                    break;
                }
                let mut hashed = 0u64;
                for nonce in nonces.by_ref().take(batch as usize) {
                    hashed += 1;
                    let hash = iface.calculate_hash(&unit, nonce, None);
                    if hashing::check_target(&hash, unit.target()) && iface.found_nonce(&unit, nonce, None) {
                        found += 1;
                    }
                }
                if hashed < batch {
                    break;
                }
            }

            if stop.load(Ordering::Relaxed) {
                break;
            }
        }

        reader.stop();
        iface.debug(&format!("worker {:?} exiting, {} results", iface.index(), found));
    }
}

impl Kernel for CpuKernel {
    fn name(&self) -> &str {
        self.iface.name()
    }

    fn start(&mut self) -> Result<()> {
        self.stop.store(false, Ordering::Relaxed);
        self.iface.log(&format!("starting {} worker threads", self.threads));

        for index in 0..self.threads {
            let iface = self.iface.with_index(index);
            let reader = QueueReader::new(Arc::new(iface.clone()), self.range_size)
                .with_sizer(latency_sizer(TARGET_ITERATION));
            self.readers.push(reader.stop_handle());

            let stop = Arc::clone(&self.stop);
            let batch = self.batch;
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", self.iface.name(), index))
                .spawn(move || Self::mining_loop(reader, iface, stop, batch))?;
            self.workers.push(handle);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for reader in self.readers.drain(..) {
            reader.stop();
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                self.iface.error("worker thread panicked");
            }
        }
    }
}

impl Drop for CpuKernel {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
        }
    }
}
