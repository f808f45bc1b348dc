mod messages;

pub use messages::{ClientMessage, ServerMessage};

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::dump::DumpStream;
use super::{Backend, BackendEvent, BackendKind, BackendSettings, BackendUrl, EventSink};
use crate::error::{MinerError, Result};
use crate::hashing::{SubmissionPayload, HEADER_LEN};
use crate::work::WorkDescriptor;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LINE: usize = 4096;

/// Seconds past the server clock a pushed unit may be rolled.
const ROLL_WINDOW: u64 = 120;

type Transport = DumpStream<TcpStream>;
type LineWriter = FramedWrite<WriteHalf<Transport>, LinesCodec>;
type LineReader = FramedRead<ReadHalf<Transport>, LinesCodec>;

fn codec_error(e: LinesCodecError) -> MinerError {
    match e {
        LinesCodecError::Io(e) => MinerError::Io(e),
        other => MinerError::Protocol(other.to_string()),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Per-connection server state.
#[derive(Default)]
struct Session {
    target: Option<Vec<u8>>,
    /// Server clock minus local clock
    clock_offset: Option<i64>,
}

impl Session {
    fn server_now(&self) -> Option<u64> {
        self.clock_offset
            .map(|offset| (unix_now() as i64).saturating_add(offset).max(0) as u64)
    }

    fn descriptor(&self, data: Vec<u8>, mask: u32) -> Result<WorkDescriptor> {
        let target = self
            .target
            .clone()
            .ok_or_else(|| MinerError::Protocol("WORK before TARGET".to_string()))?;
        if data.len() < HEADER_LEN {
            return Err(MinerError::InvalidHeader {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let data = data[..HEADER_LEN].to_vec();
        let mut desc = WorkDescriptor {
            identifier: data[4..36].to_vec(),
            data,
            target,
            nonces: WorkDescriptor::nonces_from_mask(mask)?,
            maxtime: 0,
            time: ROLL_WINDOW,
        };
        let timestamp = desc.timestamp().unwrap_or_default();
        desc.maxtime = match self.server_now() {
            Some(now) => timestamp.max(now.saturating_add(ROLL_WINDOW).min(u32::MAX as u64) as u32),
            None => timestamp,
        };
        Ok(desc)
    }
}

struct Inner {
    url: BackendUrl,
    settings: BackendSettings,
    events: EventSink,
    writer: Mutex<Option<LineWriter>>,
    /// Outstanding submissions keyed by payload hex
    pending: parking_lot::Mutex<HashMap<String, oneshot::Sender<bool>>>,
    connected: AtomicBool,
    last_rate: parking_lot::Mutex<Option<u64>>,
}

impl Inner {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(MinerError::NotConnected)?;
        debug!("→ {}", message);
        sink.send(message.to_string()).await.map_err(codec_error)
    }

    fn resolve(&self, hex: &str, accepted: bool) {
        let mut pending = self.pending.lock();
        let key = if pending.contains_key(hex) {
            Some(hex.to_string())
        } else {
            // some servers echo only the header part of the payload
            pending.keys().find(|k| k.starts_with(hex)).cloned()
        };
        match key.and_then(|k| pending.remove(&k)) {
            Some(tx) => {
                let _ = tx.send(accepted);
            }
            None => debug!("verdict for unknown result {}", hex),
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let address = self.url.address();
        let connect = tokio::select! {
            _ = token.cancelled() => return,
            r = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)) => r,
        };
        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("failed to connect to {}: {}", self.url, e);
                self.events.emit(BackendEvent::Failure);
                return;
            }
            Err(_) => {
                warn!("failed to connect to {}: timed out", self.url);
                self.events.emit(BackendEvent::Failure);
                return;
            }
        };

        let stream = DumpStream::new(stream, address, self.settings.dump);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE));
        *self.writer.lock().await =
            Some(FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE)));

        let login = ClientMessage::login(self.url.username(), self.url.password());
        if let Err(e) = self.send(login).await {
            warn!("login to {} failed: {}", self.url, e);
            self.teardown().await;
            self.events.emit(BackendEvent::Failure);
            return;
        }

        self.connected.store(true, Ordering::Release);
        info!("connected to {}", self.url);
        self.events.emit(BackendEvent::Connect);

        let lost = self.read_loop(&mut lines, &token).await;
        self.teardown().await;
        if lost {
            warn!("connection to {} lost", self.url);
            self.events.emit(BackendEvent::Disconnect);
        }
    }

    /// Returns `true` if the connection dropped, `false` if cancelled.
    async fn read_loop(&self, lines: &mut LineReader, token: &CancellationToken) -> bool {
        let mut session = Session::default();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => return false,
                line = lines.next() => line,
            };
            let line = match line {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    debug!("read from {} failed: {}", self.url, codec_error(e));
                    return true;
                }
                None => return true,
            };
            if line.trim().is_empty() {
                continue;
            }
            debug!("← {}", line);

            match ServerMessage::parse(&line) {
                Ok(message) => self.handle(&mut session, message),
                Err(e) => warn!("protocol error from {}: {}", self.url, e),
            }
        }
    }

    fn handle(&self, session: &mut Session, message: ServerMessage) {
        match message {
            ServerMessage::Msg(text) => self.events.emit(BackendEvent::Msg(text)),
            ServerMessage::Target(target) => session.target = Some(target),
            ServerMessage::Time(server) => {
                session.clock_offset = Some(server as i64 - unix_now() as i64);
            }
            ServerMessage::Block(height) => self.events.emit(BackendEvent::Block(height)),
            ServerMessage::Work { data, mask } => match session.descriptor(data, mask) {
                Ok(desc) => self.events.emit(BackendEvent::Work(desc)),
                Err(e) => warn!("bad work from {}: {}", self.url, e),
            },
            ServerMessage::Accepted(hex) => self.resolve(&hex, true),
            ServerMessage::Rejected(hex) => self.resolve(&hex, false),
        }
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::Release);
        *self.writer.lock().await = None;
        // dropping the senders resolves every outstanding submission as rejected
        self.pending.lock().clear();
        *self.last_rate.lock() = None;
    }
}

pub struct SocketClient {
    inner: Arc<Inner>,
    running: Option<CancellationToken>,
}

impl SocketClient {
    pub fn new(url: BackendUrl, settings: BackendSettings, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                settings,
                events,
                writer: Mutex::new(None),
                pending: parking_lot::Mutex::new(HashMap::new()),
                connected: AtomicBool::new(false),
                last_rate: parking_lot::Mutex::new(None),
            }),
            running: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn send_detached(&self, message: ClientMessage) {
        if !self.is_connected() {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send(message).await {
                debug!("send to {} failed: {}", inner.url, e);
            }
        });
    }
}

impl Backend for SocketClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Socket
    }

    fn connect(&mut self) {
        if self.running.is_some() {
            return;
        }
        debug!("connecting to {}", self.inner.url);
        let token = CancellationToken::new();
        tokio::spawn(self.inner.clone().run(token.clone()));
        self.running = Some(token);
    }

    fn disconnect(&mut self) {
        if let Some(token) = self.running.take() {
            debug!("disconnecting from {}", self.inner.url);
            token.cancel();
        }
        self.inner.connected.store(false, Ordering::Release);
    }

    fn request_work(&self) {
        self.send_detached(ClientMessage::More);
    }

    fn send_result(&self, payload: SubmissionPayload) -> BoxFuture<'static, bool> {
        let inner = self.inner.clone();
        async move {
            let hex = payload.to_hex();
            let (tx, rx) = oneshot::channel();
            inner.pending.lock().insert(hex.clone(), tx);

            if let Err(e) = inner.send(ClientMessage::Result(hex.clone())).await {
                inner.pending.lock().remove(&hex);
                warn!("result submission to {} failed: {}", inner.url, e);
                return false;
            }
            match timeout(inner.settings.submit_timeout, rx).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(_)) => false,
                Err(_) => {
                    inner.pending.lock().remove(&hex);
                    warn!("no verdict from {} for submitted result", inner.url);
                    false
                }
            }
        }
        .boxed()
    }

    fn report_rate(&self, khash: f64) {
        let rounded = khash.max(0.0).round() as u64;
        {
            let mut last = self.inner.last_rate.lock();
            if !self.is_connected() || *last == Some(rounded) {
                return;
            }
            *last = Some(rounded);
        }
        self.send_detached(ClientMessage::meta("rate", rounded));
    }

    fn accepts_old_work(&self) -> bool {
        self.inner.settings.submit_old || self.inner.url.submit_old()
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(token) = self.running.take() {
            token.cancel();
        }
    }
}

/// Whether a TCP connection to `url` can be opened.
pub async fn probe(url: &BackendUrl, _settings: &BackendSettings) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(url.address())).await,
        Ok(Ok(_))
    )
}
