//! Work queue: the broker between backend-fetched work and kernels.
//!
//! The queue is owned by the coordinator's event loop and never shared.
//! Kernels reach it only through fetch requests that resolve via oneshot
//! channels, so a request that arrives while no work is available simply
//! waits in the pending list until the next `store_work`.

use log::{debug, info, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::range::NonceRange;
use super::unit::{WorkDescriptor, WorkUnit, MAX_NONCES};
use crate::error::Result;

pub const DEFAULT_RANGE_SIZE: u64 = 0x10000;

/// Units never expire sooner than this after download.
const MIN_LIFETIME_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// No current unit, nothing buffered
    Empty,
    /// Ranges can be served immediately
    Ready,
    /// Current unit exhausted, rolling or promoting the next one
    Depleting,
    /// No work; fetch requests are waiting for `store_work`
    Blocked,
}

/// Signals the queue raises toward the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// Ask the active backend for more work
    RequestWork,
    /// Idle state changed
    Idle(bool),
    /// Pre-expiry refill check
    CheckWork,
    /// Hard expiry of a unit and everything rolled from it
    Expire { lineage: u64 },
}

enum Pending {
    Range {
        size: u64,
        reply: oneshot::Sender<NonceRange>,
    },
    Unit {
        reply: oneshot::Sender<Arc<WorkUnit>>,
    },
}

impl Pending {
    fn is_range(&self) -> bool {
        matches!(self, Pending::Range { .. })
    }

    fn is_closed(&self) -> bool {
        match self {
            Pending::Range { reply, .. } => reply.is_closed(),
            Pending::Unit { reply } => reply.is_closed(),
        }
    }
}

pub struct WorkQueue {
    queue_size: usize,
    queue_delay: Duration,
    default_range: u64,
    state: QueueState,
    buffer: VecDeque<Arc<WorkUnit>>,
    current: Option<Arc<WorkUnit>>,
    pending: VecDeque<Pending>,
    block: Option<Vec<u8>>,
    last_block: Option<Vec<u8>>,
    /// Every unit handed out for the current block, rolled ones included
    stale_group: Vec<Weak<WorkUnit>>,
    /// Expiry timers keyed by lineage
    timers: HashMap<u64, CancellationToken>,
    events: mpsc::UnboundedSender<QueueEvent>,
    idle: bool,
    work_requested: bool,
}

impl WorkQueue {
    pub fn new(
        queue_size: usize,
        queue_delay: Duration,
        default_range: u64,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Self {
        Self {
            queue_size: queue_size.max(1),
            queue_delay,
            default_range: default_range.clamp(1, MAX_NONCES),
            state: QueueState::Empty,
            buffer: VecDeque::with_capacity(queue_size.max(1)),
            current: None,
            pending: VecDeque::new(),
            block: None,
            last_block: None,
            stale_group: Vec::new(),
            timers: HashMap::new(),
            events,
            idle: false,
            work_requested: false,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn current(&self) -> Option<&Arc<WorkUnit>> {
        self.current.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn block(&self) -> Option<&[u8]> {
        self.block.as_deref()
    }

    pub fn last_block(&self) -> Option<&[u8]> {
        self.last_block.as_deref()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Storing work
    // ═══════════════════════════════════════════════════════════════════

    /// Normalize a descriptor into a unit and make it available.
    ///
    /// Fails only on a malformed descriptor; the queue is left untouched.
    pub fn store_work(&mut self, desc: &WorkDescriptor) -> Result<()> {
        let is_current_block = self.block.as_deref() == Some(desc.identifier.as_slice());
        if !is_current_block && self.last_block.as_deref() == Some(desc.identifier.as_slice()) {
            debug!("server gave work from the previous block, ignoring");
            self.work_requested = false;
            if self.needs_work() {
                self.request_work();
            }
            return Ok(());
        }

        let unit = Arc::new(WorkUnit::new(desc)?);
        self.work_requested = false;

        if !is_current_block {
            self.start_block(desc.identifier.clone());
        }

        if self.buffer.len() >= self.queue_size {
            debug!("queue full ({} units), discarding unit {}", self.buffer.len(), unit.id());
        } else {
            self.arm_timers(&unit);
            self.track_stale(&unit);
            self.buffer.push_back(unit);
            self.transition(QueueState::Ready);
        }

        if self.needs_work() {
            self.request_work();
        }

        self.set_idle(false);
        self.drain_pending();
        Ok(())
    }

    /// Remember `unit` for the next new-block broadcast.
    fn track_stale(&mut self, unit: &Arc<WorkUnit>) {
        self.stale_group.retain(|w| w.strong_count() > 0);
        self.stale_group.push(Arc::downgrade(unit));
    }

    /// Drop everything held for the previous block and stale it.
    fn start_block(&mut self, identifier: Vec<u8>) {
        let dropped = self.buffer.len() + usize::from(self.current.is_some());
        self.buffer.clear();
        self.current = None;
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
        let stale: Vec<_> = self.stale_group.drain(..).filter_map(|w| w.upgrade()).collect();
        for unit in &stale {
            unit.mark_stale();
        }

        self.last_block = self.block.replace(identifier);
        self.transition(QueueState::Empty);
        info!(
            "new block {} ({} unit(s) dropped, {} marked stale)",
            self.block.as_deref().map(short_hex).unwrap_or_default(),
            dropped,
            stale.len()
        );
    }

    // ═══════════════════════════════════════════════════════════════════
    // Fetching
    // ═══════════════════════════════════════════════════════════════════

    /// Request a range of `size` nonces; 0 selects the default size.
    pub fn fetch_range(&mut self, size: u64) -> oneshot::Receiver<NonceRange> {
        let (tx, rx) = oneshot::channel();
        self.submit_range(size, tx);
        rx
    }

    pub fn submit_range(&mut self, size: u64, reply: oneshot::Sender<NonceRange>) {
        let size = if size == 0 { self.default_range } else { size.min(MAX_NONCES) };
        let request = Pending::Range { size, reply };
        if self.pending.iter().any(Pending::is_range) {
            self.enqueue(request);
            return;
        }
        self.serve(request);
    }

    /// Request an entire buffered unit.
    pub fn fetch_unit(&mut self) -> oneshot::Receiver<Arc<WorkUnit>> {
        let (tx, rx) = oneshot::channel();
        self.submit_unit(tx);
        rx
    }

    pub fn submit_unit(&mut self, reply: oneshot::Sender<Arc<WorkUnit>>) {
        let request = Pending::Unit { reply };
        if self.pending.iter().any(|p| !p.is_range()) {
            self.enqueue(request);
            return;
        }
        self.serve(request);
    }

    /// Answer `request` now or park it.
    fn serve(&mut self, request: Pending) {
        if let Err(request) = self.try_serve(request) {
            self.enqueue(request);
        }
    }

    /// Answer `request` if work is available, otherwise hand it back.
    fn try_serve(&mut self, request: Pending) -> std::result::Result<(), Pending> {
        match request {
            Pending::Range { size, reply } => match self.take_range(size) {
                Some(range) => {
                    let _ = reply.send(range);
                    Ok(())
                }
                None => Err(Pending::Range { size, reply }),
            },
            Pending::Unit { reply } => match self.take_unit() {
                Some(unit) => {
                    let _ = reply.send(unit);
                    Ok(())
                }
                None => Err(Pending::Unit { reply }),
            },
        }
    }

    fn enqueue(&mut self, request: Pending) {
        self.pending.push_back(request);
        self.request_work();
        self.update_blocked();
    }

    /// Blocked and idle only while requests wait and no unit is held at all.
    fn update_blocked(&mut self) {
        let no_work = self.current.is_none() && self.buffer.is_empty();
        if no_work && !self.pending.is_empty() {
            self.transition(QueueState::Blocked);
            self.set_idle(true);
        }
    }

    /// Resolve parked requests, FIFO within each kind. Once a request of one
    /// kind cannot be served, later requests of that kind stay behind it.
    fn drain_pending(&mut self) {
        let waiting = std::mem::take(&mut self.pending);
        let (mut ranges_blocked, mut units_blocked) = (false, false);
        for request in waiting {
            if request.is_closed() {
                continue;
            }
            let blocked = if request.is_range() { ranges_blocked } else { units_blocked };
            if blocked {
                self.pending.push_back(request);
                continue;
            }
            if let Err(request) = self.try_serve(request) {
                if request.is_range() {
                    ranges_blocked = true;
                } else {
                    units_blocked = true;
                }
                self.pending.push_back(request);
            }
        }
        if !self.pending.is_empty() {
            self.request_work();
        }
        self.update_blocked();
    }

    fn take_range(&mut self, size: u64) -> Option<NonceRange> {
        if self.current.is_none() {
            self.current = self.buffer.pop_front();
        }
        let unit = self.current.clone()?;

        let (base, depleted) = unit.advance(size);
        let range = NonceRange::new(unit.clone(), base, size.min(unit.nonces() - base));
        trace!("range {:?}", range);

        if depleted {
            self.on_depleted(&unit);
        }
        if self.needs_work() {
            self.request_work();
        }
        Some(range)
    }

    fn take_unit(&mut self) -> Option<Arc<WorkUnit>> {
        let unit = self.buffer.pop_front()?;
        self.cancel_timers(unit.lineage());
        if self.current.is_none() && self.buffer.is_empty() {
            self.transition(QueueState::Empty);
        }
        if self.needs_work() {
            self.request_work();
        }
        Some(unit)
    }

    fn on_depleted(&mut self, unit: &Arc<WorkUnit>) {
        self.transition(QueueState::Depleting);
        match unit.roll(Instant::now()) {
            Some(rolled) => {
                let rolled = Arc::new(rolled);
                debug!("rolled unit {} to timestamp {}", unit.id(), rolled.timestamp());
                self.track_stale(&rolled);
                self.current = Some(rolled);
                self.transition(QueueState::Ready);
            }
            None => {
                debug!("unit {} depleted", unit.id());
                self.cancel_timers(unit.lineage());
                self.current = self.buffer.pop_front();
                if self.current.is_some() {
                    self.transition(QueueState::Ready);
                } else {
                    self.transition(QueueState::Empty);
                }
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Refill and expiry
    // ═══════════════════════════════════════════════════════════════════

    /// Whether the queue sits below its target depth. A current unit counts
    /// while it can still roll or has more than half its space left.
    fn needs_work(&self) -> bool {
        let mut depth = self.buffer.len();
        if let Some(current) = &self.current {
            if current.can_roll(Instant::now()) || current.remaining() > current.nonces() / 2 {
                depth += 1;
            }
        }
        depth < self.queue_size
    }

    fn request_work(&mut self) {
        if self.work_requested {
            return;
        }
        self.work_requested = true;
        let _ = self.events.send(QueueEvent::RequestWork);
    }

    /// Request work if under-filled, even when a request is already out.
    pub fn request_if_needed(&mut self) {
        if self.needs_work() || !self.pending.is_empty() {
            self.work_requested = false;
            self.request_work();
        }
    }

    /// Pre-expiry timer fired.
    pub fn check_work(&mut self) {
        self.request_if_needed();
    }

    /// Hard-expiry timer fired for `lineage`.
    pub fn expire(&mut self, lineage: u64) {
        let Some(token) = self.timers.get(&lineage).cloned() else {
            return;
        };

        // Keep the last work held until a replacement arrives
        let held = self.buffer.iter().chain(self.current.iter());
        let (mine, others) = held.fold((0, 0), |(mine, others), u| {
            if u.lineage() == lineage {
                (mine + 1, others)
            } else {
                (mine, others + 1)
            }
        });
        if mine > 0 && others == 0 {
            debug!("deferring expiry of lineage {}, no replacement yet", lineage);
            self.spawn_timer(
                self.queue_delay.max(Duration::from_secs(1)),
                token,
                QueueEvent::Expire { lineage },
            );
            self.work_requested = false;
            self.request_work();
            return;
        }

        self.cancel_timers(lineage);
        let before = self.buffer.len();
        self.buffer.retain(|u| u.lineage() != lineage);
        let mut removed = before - self.buffer.len();
        if self.current.as_ref().map(|u| u.lineage()) == Some(lineage) {
            self.current = None;
            removed += 1;
        }
        if removed > 0 {
            debug!("{} unit(s) removed from queue due to expiration", removed);
        }

        if self.current.is_none() && self.buffer.is_empty() && self.pending.is_empty() {
            self.transition(QueueState::Empty);
        }
        self.update_blocked();
        self.request_if_needed();
    }

    fn lifetime(unit: &WorkUnit) -> Duration {
        Duration::from_secs(unit.time().as_secs().saturating_sub(1).max(MIN_LIFETIME_SECS))
    }

    fn arm_timers(&mut self, unit: &WorkUnit) {
        let lifetime = Self::lifetime(unit);
        let token = CancellationToken::new();
        self.spawn_timer(lifetime.saturating_sub(self.queue_delay), token.clone(), QueueEvent::CheckWork);
        self.spawn_timer(lifetime, token.clone(), QueueEvent::Expire { lineage: unit.lineage() });
        if let Some(old) = self.timers.insert(unit.lineage(), token) {
            old.cancel();
        }
    }

    fn spawn_timer(&self, delay: Duration, token: CancellationToken, event: QueueEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
            }
        });
    }

    fn cancel_timers(&mut self, lineage: u64) {
        if let Some(token) = self.timers.remove(&lineage) {
            token.cancel();
        }
    }

    /// Cancel every timer and fail every parked request.
    pub fn shutdown(&mut self) {
        for (_, token) in self.timers.drain() {
            token.cancel();
        }
        self.pending.clear();
    }

    fn set_idle(&mut self, idle: bool) {
        if self.idle != idle {
            self.idle = idle;
            let _ = self.events.send(QueueEvent::Idle(idle));
        }
    }

    fn transition(&mut self, to: QueueState) {
        if self.state != to {
            trace!("queue {:?} -> {:?}", self.state, to);
            self.state = to;
        }
    }
}

fn short_hex(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    if encoded.len() > 16 {
        format!("{}…", &encoded[..16])
    } else {
        encoded
    }
}
