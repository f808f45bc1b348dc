//! Work unit and queue properties, exercised through the public API only.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use phoenix_miner::hashing::{self, SubmissionPayload};
use phoenix_miner::work::{NonceRange, QueueState, WorkDescriptor, WorkQueue, WorkUnit};
use tokio::sync::{mpsc, oneshot};

const TIMESTAMP: u32 = 1_700_000_000;

fn descriptor(identifier: &[u8], nonces: u64, roll_secs: u32) -> WorkDescriptor {
    let mut data = vec![0x5a; hashing::HEADER_LEN];
    data[hashing::TIMESTAMP_OFFSET..hashing::TIMESTAMP_OFFSET + 4].copy_from_slice(&TIMESTAMP.to_be_bytes());
    WorkDescriptor {
        data,
        target: vec![0xff; hashing::TARGET_LEN],
        nonces,
        maxtime: TIMESTAMP + roll_secs,
        identifier: identifier.to_vec(),
        time: 120,
    }
}

fn queue(size: usize) -> (WorkQueue, mpsc::UnboundedReceiver<phoenix_miner::work::QueueEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue::new(size, Duration::from_secs(5), 0x100, tx), rx)
}

fn resolved(rx: &mut oneshot::Receiver<NonceRange>) -> Option<NonceRange> {
    rx.try_recv().ok()
}

// ═══════════════════════════════════════════════════════════════════════════
// 1. Range bounds
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_ranges_stay_inside_their_unit() {
    let (mut queue, _events) = queue(1);
    queue.store_work(&descriptor(b"A", 1000, 0)).unwrap();

    let mut per_unit: Vec<(u64, u64)> = Vec::new();
    let mut waiting = Vec::new();
    for size in [300, 300, 300, 300, 77] {
        let mut rx = queue.fetch_range(size);
        match resolved(&mut rx) {
            Some(range) => {
                assert!(range.end() <= range.unit().nonces());
                assert!(range.size() <= size);
                per_unit.push((range.unit().id(), range.size()));
            }
            None => waiting.push(rx),
        }
    }

    let total: u64 = per_unit.iter().map(|(_, size)| size).sum();
    assert_eq!(total, 1000);
    assert_eq!(waiting.len(), 1);
    assert_eq!(queue.state(), QueueState::Blocked);
}

// ═══════════════════════════════════════════════════════════════════════════
// 2. Staleness monotonicity
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_stale_is_sticky_and_callbacks_fire_once() {
    let unit = WorkUnit::new(&descriptor(b"A", 1 << 32, 0)).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let fired = Arc::clone(&fired);
        assert!(unit
            .add_stale_callback(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
            .is_some());
    }

    unit.mark_stale();
    unit.mark_stale();
    assert!(unit.is_stale());
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    let late = Arc::clone(&fired);
    let id = unit.add_stale_callback(Box::new(move |_| {
        late.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(id.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 4);
    assert!(unit.is_stale());
}

// ═══════════════════════════════════════════════════════════════════════════
// 3. Rolling
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_roll_at_maxtime_never_succeeds() {
    let unit = WorkUnit::new(&descriptor(b"A", 1 << 32, 0)).unwrap();
    assert!(unit.roll(Instant::now()).is_none());
    assert!(unit.roll(Instant::now()).is_none());
}

#[test]
fn test_fresh_roll_bumps_timestamp_and_resets_base() {
    let downloaded = Instant::now();
    let unit = WorkUnit::with_downloaded(&descriptor(b"A", 1 << 16, 30), downloaded).unwrap();
    unit.advance(1 << 16);

    let rolled = unit.roll(downloaded).expect("rollable");
    assert_eq!(rolled.timestamp(), unit.timestamp() + 1);
    assert_eq!(rolled.base(), 0);
    assert_eq!(rolled.downloaded(), downloaded);
    assert_eq!(rolled.target(), unit.target());
    assert_eq!(rolled.identifier(), unit.identifier());
    assert_eq!(rolled.maxtime(), unit.maxtime());
    assert_eq!(rolled.midstate(), unit.midstate());
}

// ═══════════════════════════════════════════════════════════════════════════
// 4. Submission payload
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_payload_reproduces_hashed_header() {
    let unit = WorkUnit::new(&descriptor(b"A", 1 << 32, 10)).unwrap();
    let timestamp = unit.timestamp() + 3;
    let nonce = 0xdead_beef;

    let payload = SubmissionPayload::new(unit.data(), timestamp, nonce);
    let parsed = SubmissionPayload::from_hex(&payload.to_hex()).unwrap();
    let header = hashing::assemble_header(unit.data(), timestamp, nonce);

    assert_eq!(parsed, payload);
    assert_eq!(parsed.header()[..76], header[..76]);
    assert_eq!(parsed.nonce(), nonce);
    assert_eq!(parsed.timestamp(), timestamp);
    assert!(parsed.as_bytes()[hashing::HEADER_LEN..].iter().all(|b| *b == 0));
}

// ═══════════════════════════════════════════════════════════════════════════
// 5. FIFO fairness
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_waiting_fetches_are_served_in_order() {
    let (mut queue, _events) = queue(1);
    let mut first = queue.fetch_range(500);
    let mut second = queue.fetch_range(500);
    let mut third = queue.fetch_range(500);
    assert_eq!(queue.pending(), 3);

    queue.store_work(&descriptor(b"A", 1000, 0)).unwrap();

    assert_eq!(resolved(&mut first).unwrap().base(), 0);
    assert_eq!(resolved(&mut second).unwrap().base(), 500);
    assert!(resolved(&mut third).is_none());

    queue.store_work(&descriptor(b"A", 1000, 0)).unwrap();
    assert_eq!(resolved(&mut third).unwrap().base(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════
// 6-7. Block changes
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_new_block_clears_buffer_and_stales_old_units() {
    let (mut queue, _events) = queue(3);
    for _ in 0..3 {
        queue.store_work(&descriptor(b"A", 1000, 0)).unwrap();
    }
    let old = queue.fetch_range(10).try_recv().unwrap();
    assert_eq!(queue.buffered(), 2);

    queue.store_work(&descriptor(b"B", 1000, 0)).unwrap();
    assert!(old.unit().is_stale());
    assert!(queue.current().is_none());
    assert_eq!(queue.buffered(), 1);
    assert_eq!(queue.state(), QueueState::Ready);

    let fresh = queue.fetch_range(10).try_recv().unwrap();
    assert_eq!(fresh.unit().identifier(), b"B");
    assert!(!fresh.unit().is_stale());
}

#[tokio::test]
async fn test_previous_block_descriptor_is_dropped() {
    let (mut queue, _events) = queue(2);
    queue.store_work(&descriptor(b"Z", 1000, 0)).unwrap();
    queue.store_work(&descriptor(b"A", 1000, 0)).unwrap();
    let range = queue.fetch_range(10).try_recv().unwrap();
    let current = queue.current().map(|u| u.id());
    let buffered = queue.buffered();

    queue.store_work(&descriptor(b"Z", 1000, 0)).unwrap();
    assert_eq!(queue.current().map(|u| u.id()), current);
    assert_eq!(queue.buffered(), buffered);
    assert_eq!(queue.block(), Some(&b"A"[..]));
    assert!(!range.unit().is_stale());
}

#[tokio::test]
async fn test_unit_ids_are_unique() {
    let (mut queue, _events) = queue(4);
    let mut seen = HashSet::new();
    for _ in 0..4 {
        queue.store_work(&descriptor(b"A", 10, 0)).unwrap();
    }
    for _ in 0..4 {
        let unit = queue.fetch_unit().try_recv().unwrap();
        assert!(seen.insert(unit.id()));
    }
}
