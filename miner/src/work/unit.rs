//! Work units: one server-supplied header template and its consumption state.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{MinerError, Result};
use crate::hashing::{self, HEADER_LEN, TARGET_LEN};

/// Largest candidate space a single unit may cover.
pub const MAX_NONCES: u64 = 1 << 32;

/// Seconds of freshness a unit must have left to be rolled.
const ROLL_HEADROOM: Duration = Duration::from_secs(1);

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

fn next_unit_id() -> u64 {
    NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Normalized work as produced by a backend client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDescriptor {
    /// 80-byte header, getwork word order
    pub data: Vec<u8>,
    /// 256-bit little-endian threshold
    pub target: Vec<u8>,
    pub nonces: u64,
    /// Latest value the embedded timestamp may be rolled to
    pub maxtime: u32,
    /// Block identity used for staleness comparisons
    pub identifier: Vec<u8>,
    /// Freshness window in seconds
    pub time: u64,
}

impl WorkDescriptor {
    pub fn nonces_from_mask(mask: u32) -> Result<u64> {
        if mask == 0 || mask > 32 {
            return Err(MinerError::Protocol(format!("invalid nonce mask {}", mask)));
        }
        Ok(1u64 << mask)
    }

    pub fn timestamp(&self) -> Option<u32> {
        let bytes = self.data.get(hashing::TIMESTAMP_OFFSET..hashing::TIMESTAMP_OFFSET + 4)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

pub type StaleCallback = Box<dyn FnOnce(&WorkUnit) + Send>;

/// Handle returned by [`WorkUnit::add_stale_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Default)]
struct StaleCallbacks {
    next_id: u64,
    entries: Vec<(CallbackId, StaleCallback)>,
}

pub struct WorkUnit {
    id: u64,
    lineage: u64,
    data: [u8; HEADER_LEN],
    target: [u8; TARGET_LEN],
    identifier: Vec<u8>,
    maxtime: u32,
    midstate: [u8; 32],
    nonces: u64,
    base: AtomicU64,
    downloaded: Instant,
    time: Duration,
    stale: AtomicBool,
    callbacks: Mutex<StaleCallbacks>,
}

impl WorkUnit {
    pub fn new(desc: &WorkDescriptor) -> Result<Self> {
        Self::with_downloaded(desc, Instant::now())
    }

    pub fn with_downloaded(desc: &WorkDescriptor, downloaded: Instant) -> Result<Self> {
        if desc.data.len() != HEADER_LEN {
            return Err(MinerError::InvalidHeader {
                expected: HEADER_LEN,
                actual: desc.data.len(),
            });
        }
        if desc.target.len() != TARGET_LEN {
            return Err(MinerError::InvalidTarget(desc.target.len()));
        }
        if desc.nonces == 0 || desc.nonces > MAX_NONCES {
            return Err(MinerError::InvalidNonceCount(desc.nonces));
        }

        let mut data = [0u8; HEADER_LEN];
        data.copy_from_slice(&desc.data);
        let mut target = [0u8; TARGET_LEN];
        target.copy_from_slice(&desc.target);

        let id = next_unit_id();
        Ok(Self {
            id,
            lineage: id,
            midstate: hashing::midstate(&data),
            data,
            target,
            identifier: desc.identifier.clone(),
            maxtime: desc.maxtime,
            nonces: desc.nonces,
            base: AtomicU64::new(0),
            downloaded,
            time: Duration::from_secs(desc.time),
            stale: AtomicBool::new(false),
            callbacks: Mutex::new(StaleCallbacks::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Id of the server-fetched unit this one was rolled from (its own id if
    /// it was never rolled).
    pub fn lineage(&self) -> u64 {
        self.lineage
    }

    pub fn data(&self) -> &[u8; HEADER_LEN] {
        &self.data
    }

    pub fn target(&self) -> &[u8; TARGET_LEN] {
        &self.target
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn midstate(&self) -> &[u8; 32] {
        &self.midstate
    }

    pub fn timestamp(&self) -> u32 {
        hashing::read_timestamp(&self.data)
    }

    pub fn maxtime(&self) -> u32 {
        self.maxtime
    }

    pub fn nonces(&self) -> u64 {
        self.nonces
    }

    pub fn base(&self) -> u64 {
        self.base.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.nonces - self.base()
    }

    pub fn is_exhausted(&self) -> bool {
        self.base() >= self.nonces
    }

    pub fn downloaded(&self) -> Instant {
        self.downloaded
    }

    pub fn time(&self) -> Duration {
        self.time
    }

    /// Reserve up to `size` candidates. Returns the start of the reservation
    /// and whether it consumed the rest of the unit; the caller derives the
    /// actual reserved length from `min(size, nonces - base)`.
    ///
    /// Only the queue's owning thread calls this.
    pub fn advance(&self, size: u64) -> (u64, bool) {
        let base = self.base();
        let left = self.nonces - base;
        if left <= size {
            self.base.store(self.nonces, Ordering::Release);
            (base, true)
        } else {
            self.base.store(base + size, Ordering::Release);
            (base, false)
        }
    }

    /// Whether [`roll`](Self::roll) would succeed at `now`.
    pub fn can_roll(&self, now: Instant) -> bool {
        if self.timestamp() >= self.maxtime || self.is_stale() {
            return false;
        }
        let age = now.saturating_duration_since(self.downloaded);
        age + ROLL_HEADROOM < self.time
    }

    /// Derive a fresh unit with the embedded timestamp bumped by one.
    ///
    /// The derived unit keeps `downloaded` so the original expiry schedule
    /// bounds the whole lineage.
    pub fn roll(&self, now: Instant) -> Option<WorkUnit> {
        if !self.can_roll(now) {
            return None;
        }

        let mut data = self.data;
        let timestamp = self.timestamp() + 1;
        data[hashing::TIMESTAMP_OFFSET..hashing::TIMESTAMP_OFFSET + 4]
            .copy_from_slice(&timestamp.to_be_bytes());

        Some(Self {
            id: next_unit_id(),
            lineage: self.lineage,
            midstate: self.midstate,
            data,
            target: self.target,
            identifier: self.identifier.clone(),
            maxtime: self.maxtime,
            nonces: self.nonces,
            base: AtomicU64::new(0),
            downloaded: self.downloaded,
            time: self.time,
            stale: AtomicBool::new(false),
            callbacks: Mutex::new(StaleCallbacks::default()),
        })
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Flag the unit stale and fire every registered callback once.
    pub fn mark_stale(&self) {
        if self.stale.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries = std::mem::take(&mut self.callbacks.lock().entries);
        for (_, callback) in entries {
            callback(self);
        }
    }

    /// Register `callback` for staleness. An already-stale unit invokes it
    /// immediately and returns `None`.
    pub fn add_stale_callback(&self, callback: StaleCallback) -> Option<CallbackId> {
        {
            let mut guard = self.callbacks.lock();
            if !self.is_stale() {
                let id = CallbackId(guard.next_id);
                guard.next_id += 1;
                guard.entries.push((id, callback));
                return Some(id);
            }
        }
        callback(self);
        None
    }

    pub fn remove_stale_callback(&self, id: CallbackId) -> bool {
        let mut guard = self.callbacks.lock();
        let before = guard.entries.len();
        guard.entries.retain(|(entry, _)| *entry != id);
        guard.entries.len() != before
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.id)
            .field("lineage", &self.lineage)
            .field("identifier", &hex::encode(&self.identifier))
            .field("timestamp", &self.timestamp())
            .field("maxtime", &self.maxtime)
            .field("base", &self.base())
            .field("nonces", &self.nonces)
            .field("stale", &self.is_stale())
            .finish()
    }
}
