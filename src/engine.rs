//! Request/response engine.
//!
//! One request is in flight at a time. Each call tags the request with a fresh
//! correlation id, sends it and polls for the reply carrying that id until the
//! call's window closes. Replies with any other id are dropped. A transport
//! fault tears the connection down and the whole request is resent on a new
//! one, bounded by [`RetryPolicy::max_attempts`].

use crate::error::{Error, Result};
use crate::transport::{deadline_after, Connection, Connector, MAX_WAIT};
use hdriver_proto::{self as proto, field, FrameBuffer, Request, Response};
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_MAX_ATTEMPTS: u32 = 2;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Timing and retry parameters of the engine.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base reply window of every request.
    pub find_timeout: Duration,
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
    /// Longest single wait for incoming bytes.
    pub poll_interval: Duration,
}

impl RetryPolicy {
    pub fn new(find_timeout: Duration) -> Self {
        Self {
            find_timeout,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Reply window for `request`: the base find timeout plus the request's
    /// own `timeout_s` and `time_s` seconds, at most [`MAX_WAIT`].
    pub fn window(&self, request: &Request) -> Duration {
        self.find_timeout
            .saturating_add(extra_seconds(request, field::TIMEOUT_S))
            .saturating_add(extra_seconds(request, field::TIME_S))
            .min(MAX_WAIT)
    }
}

fn extra_seconds(request: &Request, key: &str) -> Duration {
    request
        .get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::ZERO)
}

/// Random 32 hex digit correlation id.
pub fn correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub struct Engine<K> {
    policy: RetryPolicy,
    conn: Option<K>,
    frames: FrameBuffer,
}

impl<K: Connection> Engine<K> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            conn: None,
            frames: FrameBuffer::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Replace the current connection with a fresh one.
    pub fn connect<C: Connector<Conn = K>>(&mut self, connector: &mut C) -> Result<()> {
        self.disconnect();
        self.conn = Some(connector.connect()?);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
        self.frames.clear();
    }

    /// Send `request` and wait for its reply.
    ///
    /// Harness-reported errors become [`Error::ElementNotFound`] or
    /// [`Error::Driver`]; a missing reply becomes [`Error::Timeout`]. Only
    /// transport faults are retried, and only with a new connection.
    pub fn call<C: Connector<Conn = K>>(
        &mut self,
        connector: &mut C,
        mut request: Request,
    ) -> Result<Response> {
        validate(&request)?;
        let started = Instant::now();
        let window = self.policy.window(&request);
        log::info!("#### start {} (window {:?})", request.action(), window);

        let mut attempt = 1;
        let result = loop {
            if self.conn.is_none() {
                if let Err(e) = self.connect(connector) {
                    break Err(e);
                }
            }
            match self.exchange(&mut request, window) {
                Err(e) if e.is_transport() && attempt < self.policy.max_attempts => {
                    log::warn!(
                        "{} attempt {}/{} failed: {}; reconnecting",
                        request.action(),
                        attempt,
                        self.policy.max_attempts,
                        e
                    );
                    self.disconnect();
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transport() {
                        self.disconnect();
                    }
                    break Err(e);
                }
                Ok(response) => break classify(response),
            }
        };

        log::info!(
            "#### end {} after {:?}{}",
            request.action(),
            started.elapsed(),
            if result.is_ok() { "" } else { " (failed)" }
        );
        result
    }

    fn exchange(&mut self, request: &mut Request, window: Duration) -> Result<Response> {
        let Self {
            policy,
            conn,
            frames,
        } = self;
        let conn = conn.as_mut().ok_or_else(|| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no harness connection",
            ))
        })?;

        let id = correlation_id();
        request.set_uuid(id.as_str());
        let frame = proto::encode(request).map_err(|e| Error::InvalidRequest(e.to_string()))?;
        log::debug!("send: {}", String::from_utf8_lossy(&frame));
        conn.send(&frame)?;

        let deadline = deadline_after(window);
        loop {
            while let Some(response) = frames.next_message()? {
                if response.uuid == id {
                    log::debug!("recv: {:?}", response);
                    return Ok(response);
                }
                log::debug!("Discarding reply {:?} while waiting for {}", response.uuid, id);
            }
            let skipped = frames.take_skipped();
            if skipped > 0 {
                log::warn!("Skipped {} bytes that were not a reply", skipped);
            }

            let now = Instant::now();
            if now >= deadline {
                // A partial reply left behind must not prefix the next one.
                frames.clear();
                return Err(Error::Timeout(window));
            }
            let wait = (deadline - now).min(policy.poll_interval);
            if let Some(bytes) = conn.poll_receive(wait)? {
                frames.push(&bytes);
            }
        }
    }
}

fn validate(request: &Request) -> Result<()> {
    if request.action().is_empty() {
        return Err(Error::InvalidRequest("empty action".to_string()));
    }
    if let Some((key, _)) = request
        .params()
        .find(|(k, _)| *k == field::ACTION || *k == field::UUID)
    {
        return Err(Error::InvalidRequest(format!("reserved field '{}'", key)));
    }
    Ok(())
}

fn classify(response: Response) -> Result<Response> {
    if !response.is_error() {
        return Ok(response);
    }
    let description = response.description.unwrap_or_default();
    if description.starts_with(proto::NOT_FOUND_PREFIX) {
        Err(Error::ElementNotFound(description))
    } else {
        Err(Error::Driver(description))
    }
}
