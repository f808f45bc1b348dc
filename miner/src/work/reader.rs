//! Per-thread prefetching adapter over the work queue.
//!
//! A compute thread owns one [`QueueReader`]. While it hashes the current
//! range, exactly one request for the next range is in flight toward the
//! coordinator; the answer lands in a single-slot handoff guarded by a
//! mutex and condvar.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::range::NonceRange;
use super::unit::{CallbackId, MAX_NONCES};

/// Called exactly once with the fetched range, or `None` if the source is gone.
pub type RangeDelivery = Box<dyn FnOnce(Option<NonceRange>) + Send>;

/// Maps the rolling average range size and iteration time to a preferred
/// range size.
pub type RangeSizer = Box<dyn Fn(u64, Duration) -> u64 + Send + Sync>;

/// Iterations averaged before consulting the sizer.
const LATENCY_WINDOW: usize = 10;

/// Where a reader gets its ranges from.
pub trait RangeSource: Send + Sync {
    /// Ask for a range of `size` nonces. May deliver synchronously.
    fn request_range(&self, size: u64, deliver: RangeDelivery);

    /// Wall-clock time the worker spent on its previous range.
    fn report_iteration(&self, _size: u64, _elapsed: Duration) {}
}

struct Slot {
    ready: Option<(NonceRange, Option<CallbackId>)>,
    outstanding: bool,
    stopped: bool,
    size: u64,
}

struct Shared {
    source: Arc<dyn RangeSource>,
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Shared {
    fn prefetch(shared: &Arc<Shared>) {
        let size = {
            let mut slot = shared.slot.lock();
            if slot.stopped || slot.outstanding || slot.ready.is_some() {
                return;
            }
            slot.outstanding = true;
            slot.size
        };

        let weak = Arc::downgrade(shared);
        shared.source.request_range(
            size,
            Box::new(move |range| {
                if let Some(shared) = weak.upgrade() {
                    Shared::deliver(&shared, range);
                }
            }),
        );
    }

    fn deliver(shared: &Arc<Shared>, range: Option<NonceRange>) {
        let Some(range) = range else {
            let mut slot = shared.slot.lock();
            slot.outstanding = false;
            slot.stopped = true;
            shared.cond.notify_all();
            return;
        };

        let weak = Arc::downgrade(shared);
        let callback = if range.unit().is_stale() {
            None
        } else {
            range.unit().add_stale_callback(Box::new(move |unit| {
                if let Some(shared) = weak.upgrade() {
                    Shared::purge(&shared, unit.id());
                }
            }))
        };

        let mut slot = shared.slot.lock();
        slot.outstanding = false;
        if slot.stopped {
            drop(slot);
            if let Some(id) = callback {
                range.unit().remove_stale_callback(id);
            }
            return;
        }
        if callback.is_none() || range.unit().is_stale() {
            drop(slot);
            debug!("discarding stale prefetched range {:?}", range);
            Shared::prefetch(shared);
            return;
        }
        slot.ready = Some((range, callback));
        shared.cond.notify_one();
    }

    fn purge(shared: &Arc<Shared>, unit_id: u64) {
        let purged = {
            let mut slot = shared.slot.lock();
            match &slot.ready {
                Some((range, _)) if range.unit().id() == unit_id => slot.ready.take(),
                _ => None,
            }
        };
        if let Some((range, _)) = purged {
            debug!("prefetched range {:?} went stale, refetching", range);
            Shared::prefetch(shared);
        }
    }

    fn stop(&self) {
        let dropped = {
            let mut slot = self.slot.lock();
            slot.stopped = true;
            self.cond.notify_all();
            slot.ready.take()
        };
        if let Some((range, Some(id))) = dropped {
            range.unit().remove_stale_callback(id);
        }
    }
}

/// Stops a reader from another thread.
#[derive(Clone)]
pub struct StopHandle(Arc<Shared>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.stop();
    }
}

pub struct QueueReader {
    shared: Arc<Shared>,
    sizer: Option<RangeSizer>,
    latencies: VecDeque<(u64, Duration)>,
    last: Option<(Instant, u64)>,
}

impl QueueReader {
    pub fn new(source: Arc<dyn RangeSource>, size: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                slot: Mutex::new(Slot {
                    ready: None,
                    outstanding: false,
                    stopped: false,
                    size: size.clamp(1, MAX_NONCES),
                }),
                cond: Condvar::new(),
            }),
            sizer: None,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last: None,
        }
    }

    pub fn with_sizer(mut self, sizer: RangeSizer) -> Self {
        self.sizer = Some(sizer);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.shared.clone())
    }

    /// Prime the first prefetch.
    pub fn start(&self) {
        Shared::prefetch(&self.shared);
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Size the next prefetch will request.
    pub fn range_size(&self) -> u64 {
        self.shared.slot.lock().size
    }

    /// Block until the next range is ready. `None` once stopped.
    pub fn next(&mut self) -> Option<NonceRange> {
        if let Some((started, size)) = self.last.take() {
            let elapsed = started.elapsed();
            self.shared.source.report_iteration(size, elapsed);
            self.record(size, elapsed);
        }

        let (range, callback) = {
            let mut slot = self.shared.slot.lock();
            loop {
                if slot.stopped {
                    return None;
                }
                if let Some(ready) = slot.ready.take() {
                    break ready;
                }
                self.shared.cond.wait(&mut slot);
            }
        };

        if let Some(id) = callback {
            range.unit().remove_stale_callback(id);
        }
        Shared::prefetch(&self.shared);
        self.last = Some((Instant::now(), range.size()));
        Some(range)
    }

    fn record(&mut self, size: u64, elapsed: Duration) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back((size, elapsed));

        if let Some(sizer) = &self.sizer {
            let count = self.latencies.len() as u32;
            let sizes: u64 = self.latencies.iter().map(|(size, _)| size).sum();
            let total: Duration = self.latencies.iter().map(|(_, elapsed)| *elapsed).sum();
            let size = sizer(sizes / count as u64, total / count).clamp(1, MAX_NONCES);
            self.shared.slot.lock().size = size;
        }
    }
}

impl Drop for QueueReader {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// Sizer aiming every iteration at `target` wall time: the current size
/// scaled by how far the measured latency is from the target.
pub fn latency_sizer(target: Duration) -> RangeSizer {
    Box::new(move |current: u64, average: Duration| {
        let average = average.as_micros().max(1);
        let scaled = current as u128 * target.as_micros() / average;
        scaled.clamp(1, MAX_NONCES as u128) as u64
    })
}
