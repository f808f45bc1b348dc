//! QueueReader driven by a real WorkQueue on the runtime, the way a
//! kernel thread sees it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use phoenix_miner::hashing;
use phoenix_miner::work::{NonceRange, QueueReader, RangeDelivery, RangeSource, WorkDescriptor, WorkQueue};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

type Request = (u64, oneshot::Sender<NonceRange>);

/// Marshals fetches onto the task that owns the queue and counts how many
/// are in flight at once.
struct CountingSource {
    requests: mpsc::UnboundedSender<Request>,
    runtime: Handle,
    issued: Arc<AtomicUsize>,
    outstanding: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RangeSource for CountingSource {
    fn request_range(&self, size: u64, deliver: RangeDelivery) {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let (reply, rx) = oneshot::channel();
        if self.requests.send((size, reply)).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            deliver(None);
            return;
        }
        let outstanding = Arc::clone(&self.outstanding);
        self.runtime.spawn(async move {
            let range = rx.await.ok();
            outstanding.fetch_sub(1, Ordering::SeqCst);
            deliver(range);
        });
    }
}

fn descriptor(identifier: &[u8], nonces: u64) -> WorkDescriptor {
    let mut data = vec![0x33; hashing::HEADER_LEN];
    data[hashing::TIMESTAMP_OFFSET..hashing::TIMESTAMP_OFFSET + 4].copy_from_slice(&1_700_000_000u32.to_be_bytes());
    WorkDescriptor {
        data,
        target: vec![0xff; hashing::TARGET_LEN],
        nonces,
        maxtime: 1_700_000_000,
        identifier: identifier.to_vec(),
        time: 120,
    }
}

fn spawn_queue(first: WorkDescriptor) -> (mpsc::UnboundedSender<Request>, mpsc::UnboundedSender<WorkDescriptor>) {
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Request>();
    let (work_tx, mut work_rx) = mpsc::unbounded_channel::<WorkDescriptor>();
    tokio::spawn(async move {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let mut queue = WorkQueue::new(2, Duration::from_secs(5), 0x100, events);
        queue.store_work(&first).unwrap();
        loop {
            tokio::select! {
                Some((size, reply)) = req_rx.recv() => queue.submit_range(size, reply),
                Some(desc) = work_rx.recv() => queue.store_work(&desc).unwrap(),
                else => break,
            }
        }
    });
    (req_tx, work_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_fetch_in_flight_per_reader() {
    let (requests, _work) = spawn_queue(descriptor(b"A", 1 << 20));
    let issued = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(CountingSource {
        requests,
        runtime: Handle::current(),
        issued: Arc::clone(&issued),
        outstanding: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    });

    let counts = tokio::task::spawn_blocking(move || {
        let mut reader = QueueReader::new(source, 0x100);
        reader.start();
        std::thread::sleep(Duration::from_millis(50));
        let before_next = issued.load(Ordering::SeqCst);

        let first = reader.next().expect("first range");
        std::thread::sleep(Duration::from_millis(50));
        let after_first = issued.load(Ordering::SeqCst);

        let mut bases = vec![first.base()];
        for _ in 0..8 {
            bases.push(reader.next().expect("range").base());
        }
        reader.stop();
        (before_next, after_first, bases)
    })
    .await
    .unwrap();

    let (before_next, after_first, bases) = counts;
    assert_eq!(before_next, 1);
    assert_eq!(after_first, 2);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(bases.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_block_replaces_prefetched_range() {
    let (requests, work) = spawn_queue(descriptor(b"A", 1 << 20));
    let source = Arc::new(CountingSource {
        requests,
        runtime: Handle::current(),
        issued: Arc::default(),
        outstanding: Arc::default(),
        peak: Arc::default(),
    });

    let (tx, rx) = std::sync::mpsc::channel::<()>();
    let worker = tokio::task::spawn_blocking(move || {
        let mut reader = QueueReader::new(source, 0x100);
        reader.start();
        let first = reader.next().expect("first range");
        // Let the prefetch for block A land, then wait for block B
        std::thread::sleep(Duration::from_millis(50));
        tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let second = reader.next().expect("second range");
        reader.stop();
        (first, second)
    });

    tokio::task::spawn_blocking(move || rx.recv()).await.unwrap().unwrap();
    work.send(descriptor(b"B", 1 << 20)).unwrap();

    let (first, second) = worker.await.unwrap();
    assert_eq!(first.unit().identifier(), b"A");
    assert!(first.unit().is_stale());
    assert_eq!(second.unit().identifier(), b"B");
    assert!(!second.unit().is_stale());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_releases_blocked_worker() {
    let (requests, _work) = spawn_queue(descriptor(b"A", 0x100));
    let source = Arc::new(CountingSource {
        requests,
        runtime: Handle::current(),
        issued: Arc::default(),
        outstanding: Arc::default(),
        peak: Arc::default(),
    });

    let mut reader = QueueReader::new(source, 0x100);
    let stop = reader.stop_handle();
    let worker = tokio::task::spawn_blocking(move || {
        reader.start();
        let first = reader.next();
        // Unit exhausted and cannot roll: this one waits until stopped
        let second = reader.next();
        (first.is_some(), second.is_none())
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.stop();
    assert_eq!(worker.await.unwrap(), (true, true));
}
