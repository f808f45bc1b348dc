//! getwork RPC client with long-poll and time-roll support.

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Backend, BackendEvent, BackendKind, BackendSettings, BackendUrl, Backoff, EventSink};
use crate::error::{MinerError, Result};
use crate::hashing::{SubmissionPayload, HEADER_LEN, TARGET_LEN};
use crate::work::WorkDescriptor;

/// Freshness window when the server does not advertise one.
pub const DEFAULT_TIME: u64 = 120;

/// getwork always hands out the full 32-bit nonce space.
const NONCE_MASK: u32 = 32;

/// Previous-block hash inside the header identifies the block.
const IDENTIFIER: std::ops::Range<usize> = 4..36;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension headers a getwork server may attach to any response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseHints {
    pub long_poll: Option<String>,
    /// Seconds the header timestamp may be rolled forward
    pub roll_ntime: Option<u64>,
    pub block: Option<u64>,
    pub reject_reason: Option<String>,
}

impl ResponseHints {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            long_poll: get("x-long-polling"),
            roll_ntime: get("x-roll-ntime").and_then(|v| parse_roll_ntime(&v)),
            block: get("x-blocknum").and_then(|v| v.parse().ok()),
            reject_reason: get("x-reject-reason"),
        }
    }
}

/// `Y` allows rolling for the default window, `expire=N` for N seconds.
pub fn parse_roll_ntime(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("y") {
        return Some(DEFAULT_TIME);
    }
    value
        .split(';')
        .find_map(|part| part.trim().strip_prefix("expire="))
        .and_then(|n| n.trim().parse().ok())
        .filter(|n| *n > 0)
}

/// Normalize a getwork response body into a descriptor.
pub fn parse_getwork(body: &Value, roll_ntime: Option<u64>) -> Result<WorkDescriptor> {
    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(MinerError::Protocol(format!("getwork error: {}", error)));
    }
    let result = body
        .get("result")
        .filter(|r| r.is_object())
        .ok_or_else(|| MinerError::Protocol("getwork response without result".to_string()))?;
    let field = |name: &str| {
        result
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| MinerError::Protocol(format!("getwork result missing {}", name)))
    };

    let raw = hex::decode(field("data")?)?;
    if raw.len() < HEADER_LEN {
        return Err(MinerError::InvalidHeader {
            expected: HEADER_LEN,
            actual: raw.len(),
        });
    }
    let target = hex::decode(field("target")?)?;
    if target.len() != TARGET_LEN {
        return Err(MinerError::InvalidTarget(target.len()));
    }

    let data = raw[..HEADER_LEN].to_vec();
    let mut desc = WorkDescriptor {
        identifier: data[IDENTIFIER].to_vec(),
        data,
        target,
        nonces: WorkDescriptor::nonces_from_mask(NONCE_MASK)?,
        maxtime: 0,
        time: DEFAULT_TIME,
    };
    let timestamp = desc.timestamp().unwrap_or_default();
    desc.maxtime = timestamp;
    if let Some(expire) = roll_ntime {
        desc.maxtime = timestamp.saturating_add(expire.min(u32::MAX as u64) as u32);
        desc.time = expire;
    }
    Ok(desc)
}

fn is_transport(err: &MinerError) -> bool {
    match err {
        MinerError::Http(e) => !e.is_decode(),
        MinerError::Io(_) => true,
        _ => false,
    }
}

struct Inner {
    http: reqwest::Client,
    url: BackendUrl,
    settings: BackendSettings,
    events: EventSink,
    connected: AtomicBool,
    /// Last advertised block height, 0 when unknown
    block: AtomicU64,
    longpoll: Mutex<Option<(Url, CancellationToken)>>,
}

impl Inner {
    async fn call(&self, url: &Url, params: Value, timeout: Duration) -> Result<(Value, ResponseHints)> {
        let payload = json!({
            "method": "getwork",
            "params": params,
            "id": 1
        });
        if self.settings.dump {
            debug!("{} >> {}", url, payload);
        }

        let response = self
            .http
            .post(url.clone())
            .basic_auth(self.url.username(), Some(self.url.password()))
            .timeout(timeout)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let hints = ResponseHints::from_headers(response.headers());
        let body: Value = response.json().await?;
        if self.settings.dump {
            debug!("{} << {} {:?}", url, body, hints);
        }
        Ok((body, hints))
    }

    fn note_block(&self, hints: &ResponseHints) {
        if let Some(height) = hints.block {
            if self.block.swap(height, Ordering::AcqRel) != height {
                self.events.emit(BackendEvent::Block(height));
            }
        }
    }

    fn handle_hints(self: &Arc<Self>, hints: &ResponseHints, token: &CancellationToken) {
        self.note_block(hints);
        if let Some(path) = &hints.long_poll {
            match self.url.endpoint().join(path) {
                Ok(url) => self.start_longpoll(url, token),
                Err(e) => warn!("ignoring bad long-poll url '{}': {}", path, e),
            }
        }
    }

    fn start_longpoll(self: &Arc<Self>, url: Url, parent: &CancellationToken) {
        let token = {
            let mut guard = self.longpoll.lock();
            if matches!(guard.as_ref(), Some((current, _)) if *current == url) {
                return;
            }
            if let Some((_, old)) = guard.take() {
                old.cancel();
            }
            let token = parent.child_token();
            *guard = Some((url.clone(), token.clone()));
            token
        };
        info!("long-polling enabled at {}", url);
        tokio::spawn(self.clone().longpoll_loop(url, token));
    }

    fn stop_longpoll(&self) {
        if let Some((_, token)) = self.longpoll.lock().take() {
            token.cancel();
        }
    }

    async fn longpoll_loop(self: Arc<Self>, url: Url, token: CancellationToken) {
        let mut backoff = Backoff::default();
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = self.call(&url, json!([]), self.settings.longpoll_timeout) => r,
            };
            match result {
                Ok((body, hints)) => {
                    backoff.reset();
                    self.note_block(&hints);
                    match parse_getwork(&body, hints.roll_ntime) {
                        Ok(desc) => {
                            debug!("long-poll returned new work");
                            self.events.emit(BackendEvent::Work(desc));
                        }
                        Err(e) => warn!("long-poll response from {}: {}", url, e),
                    }
                }
                Err(e) => {
                    // timeouts and aborts just re-arm the request
                    debug!("long-poll request ended: {}", e);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken, wake: Arc<Notify>) {
        let mut failures = 0u32;
        let mut backoff = Backoff::default();

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                r = self.call(self.url.endpoint(), json!([]), self.settings.submit_timeout) => r,
            };

            let mut delay = self.settings.poll_interval;
            match result {
                Ok((body, hints)) => match parse_getwork(&body, hints.roll_ntime) {
                    Ok(desc) => {
                        failures = 0;
                        backoff.reset();
                        if !self.connected.swap(true, Ordering::AcqRel) {
                            info!("connected to {}", self.url);
                            self.events.emit(BackendEvent::Connect);
                        }
                        self.handle_hints(&hints, &token);
                        self.events.emit(BackendEvent::Work(desc));
                    }
                    Err(e) if !self.connected.load(Ordering::Acquire) => {
                        warn!("failed to connect to {}: {}", self.url, e);
                        self.events.emit(BackendEvent::Failure);
                        break;
                    }
                    Err(e) => {
                        self.handle_hints(&hints, &token);
                        warn!("protocol error from {}: {}", self.url, e);
                    }
                },
                // before the first good reply any error is a failed attempt
                Err(e) if is_transport(&e) || !self.connected.load(Ordering::Acquire) => {
                    if !self.connected.load(Ordering::Acquire) {
                        warn!("failed to connect to {}: {}", self.url, e);
                        self.events.emit(BackendEvent::Failure);
                        break;
                    }
                    failures += 1;
                    warn!(
                        "request to {} failed ({}/{}): {}",
                        self.url, failures, self.settings.retries, e
                    );
                    if failures >= self.settings.retries {
                        self.connected.store(false, Ordering::Release);
                        self.events.emit(BackendEvent::Disconnect);
                        break;
                    }
                    delay = backoff.next_delay();
                }
                Err(e) => warn!("protocol error from {}: {}", self.url, e),
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = wake.notified() => {}
            }
        }
        self.stop_longpoll();
    }

    async fn submit(&self, payload: SubmissionPayload) -> bool {
        let params = json!([payload.to_hex()]);
        match self.call(self.url.endpoint(), params, self.settings.submit_timeout).await {
            Ok((body, hints)) => {
                let accepted = body.get("result").and_then(Value::as_bool).unwrap_or(false);
                if !accepted {
                    if let Some(reason) = hints.reject_reason {
                        self.events.emit(BackendEvent::Msg(format!("rejected: {}", reason)));
                    }
                }
                accepted
            }
            Err(e) => {
                warn!("result submission to {} failed: {}", self.url, e);
                false
            }
        }
    }
}

pub struct RpcClient {
    inner: Arc<Inner>,
    running: Option<(CancellationToken, Arc<Notify>)>,
}

impl RpcClient {
    pub fn new(url: BackendUrl, settings: BackendSettings, events: EventSink) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: reqwest::Client::new(),
                url,
                settings,
                events,
                connected: AtomicBool::new(false),
                block: AtomicU64::new(0),
                longpoll: Mutex::new(None),
            }),
            running: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}

impl Backend for RpcClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Rpc
    }

    fn connect(&mut self) {
        if self.running.is_some() {
            return;
        }
        debug!("connecting to {}", self.inner.url);
        let token = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        tokio::spawn(self.inner.clone().poll_loop(token.clone(), wake.clone()));
        self.running = Some((token, wake));
    }

    fn disconnect(&mut self) {
        if let Some((token, _)) = self.running.take() {
            debug!("disconnecting from {}", self.inner.url);
            token.cancel();
        }
        self.inner.stop_longpoll();
        self.inner.connected.store(false, Ordering::Release);
    }

    fn request_work(&self) {
        if let Some((_, wake)) = &self.running {
            if self.is_connected() {
                wake.notify_one();
            }
        }
    }

    fn send_result(&self, payload: SubmissionPayload) -> BoxFuture<'static, bool> {
        let inner = self.inner.clone();
        async move { inner.submit(payload).await }.boxed()
    }

    fn accepts_old_work(&self) -> bool {
        self.inner.settings.submit_old || self.inner.url.submit_old()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some((token, _)) = self.running.take() {
            token.cancel();
        }
    }
}

/// Whether `url` answers getwork at all.
pub async fn probe(url: &BackendUrl, settings: &BackendSettings) -> bool {
    let payload = json!({ "method": "getwork", "params": [], "id": 1 });
    let response = reqwest::Client::new()
        .post(url.endpoint().clone())
        .basic_auth(url.username(), Some(url.password()))
        .timeout(settings.submit_timeout.min(PROBE_TIMEOUT))
        .json(&payload)
        .send()
        .await;
    match response.and_then(|r| r.error_for_status()) {
        Ok(response) => match response.json::<Value>().await {
            Ok(body) => body.get("result").map_or(false, |r| !r.is_null()),
            Err(_) => false,
        },
        Err(_) => false,
    }
}
