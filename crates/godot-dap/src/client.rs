//! Low-level DAP connection: request correlation, event fan-out, teardown.
//!
//! One background task owns the read half of the socket and is the only
//! reader. Writers serialize through an async mutex on the write half, so any
//! number of tasks can issue requests concurrently; each request registers a
//! oneshot in the pending table keyed by its `seq` before its bytes hit the
//! wire, which closes the race with an adapter that answers faster than the
//! caller can get back to waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::messages::{classify, Event, Incoming, RequestMessage};
use crate::{codec, poison, DapError, Result};

/// Tuning knobs for one connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Deadline for the TCP connect itself.
    pub connect_timeout: Duration,
    /// Default deadline for a request/response round trip.
    pub request_timeout: Duration,
    /// Capacity of the broadcast channel behind [`Client::subscribe_events`].
    /// Slow subscribers that fall more than this far behind observe a lag
    /// notification and skip ahead; they never block the read loop.
    pub event_channel_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            event_channel_size: 100,
        }
    }
}

type ReplySender = oneshot::Sender<Result<Option<Value>>>;

struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    /// Outstanding requests by `seq`. A sync mutex, never held across an
    /// await, so `PendingGuard::drop` can clean up from non-async contexts.
    pending: StdMutex<HashMap<u64, ReplySender>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<Event>,
    shutdown: CancellationToken,
    config: ClientConfig,
}

/// Shared handle to one adapter connection. Cloning is cheap; all clones
/// drive the same socket.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Connects with [`ClientConfig::default`].
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with_config(addr, ClientConfig::default()).await
    }

    /// Connects to the adapter and spawns the background read task.
    pub async fn connect_with_config(
        addr: impl ToSocketAddrs,
        config: ClientConfig,
    ) -> Result<Self> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DapError::Timeout)??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let (events, _) = broadcast::channel(config.event_channel_size);
        let inner = Arc::new(Inner {
            writer: Mutex::new(write_half),
            pending: StdMutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(BufReader::new(read_half), Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// Sends one request and waits for its response body.
    ///
    /// An adapter error response surfaces as [`DapError::Protocol`]; no
    /// response within [`ClientConfig::request_timeout`] is
    /// [`DapError::Timeout`], and the eventual late response is dropped by
    /// the read loop.
    pub async fn send_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Option<Value>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DapError::Disconnected);
        }

        let (seq, mut rx, _guard) = self.register();
        self.write_request(RequestMessage::new(seq, command, arguments))
            .await?;
        self.await_reply(&mut rx).await
    }

    /// Sends two requests back to back and waits for both responses, in
    /// whichever order they arrive.
    ///
    /// Godot holds the `launch` response until `configurationDone` has been
    /// processed, so waiting for the first response before sending the second
    /// request would deadlock; this writes both frames up front.
    pub async fn send_request_pair(
        &self,
        first: (&str, Option<Value>),
        second: (&str, Option<Value>),
    ) -> Result<(Option<Value>, Option<Value>)> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DapError::Disconnected);
        }

        let (first_seq, mut first_rx, _first_guard) = self.register();
        let (second_seq, mut second_rx, _second_guard) = self.register();
        self.write_request(RequestMessage::new(first_seq, first.0, first.1))
            .await?;
        self.write_request(RequestMessage::new(second_seq, second.0, second.1))
            .await?;

        let deadline = self.inner.config.request_timeout;
        let replies = async {
            let first_body = receive_reply(&mut first_rx).await?;
            let second_body = receive_reply(&mut second_rx).await?;
            Ok::<_, DapError>((first_body, second_body))
        };

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(DapError::Disconnected),
            outcome = timeout(deadline, replies) => match outcome {
                Ok(replies) => replies,
                Err(_) => Err(DapError::Timeout),
            },
        }
    }

    /// Subscribes to the unsolicited-event stream. Events sent before the
    /// subscription are not replayed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Waits for the first event matching `predicate` on a fresh
    /// subscription. Use [`Client::wait_for_event_on`] with a receiver taken
    /// out earlier when the event may already be in flight.
    pub async fn wait_for_event(
        &self,
        predicate: impl FnMut(&Event) -> bool,
        deadline: Duration,
    ) -> Result<Event> {
        let receiver = self.subscribe_events();
        self.wait_for_event_on(receiver, predicate, deadline).await
    }

    /// Waits on an existing subscription for the first event matching
    /// `predicate`. Lagged subscriptions log and keep going.
    pub async fn wait_for_event_on(
        &self,
        mut receiver: broadcast::Receiver<Event>,
        mut predicate: impl FnMut(&Event) -> bool,
        deadline: Duration,
    ) -> Result<Event> {
        let matched = async {
            loop {
                match receiver.recv().await {
                    Ok(event) if predicate(&event) => return Ok(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(target: "godot.dap", skipped, "event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DapError::Disconnected)
                    }
                }
            }
        };

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(DapError::Disconnected),
            outcome = timeout(deadline, matched) => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(DapError::Timeout),
            },
        }
    }

    /// Tears the connection down. Every blocked caller, request and event
    /// waiter alike, wakes with [`DapError::Disconnected`], the same way a
    /// peer-initiated close surfaces. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Resolved once the connection is gone, whatever ended it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<Option<Value>>>, PendingGuard) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        poison::lock(&self.inner.pending, "pending requests").insert(seq, tx);
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
            seq,
        };
        (seq, rx, guard)
    }

    async fn write_request(&self, request: RequestMessage) -> Result<()> {
        let body =
            serde_json::to_vec(&request).map_err(|err| DapError::Encoding(err.to_string()))?;
        debug!(
            target: "godot.dap",
            seq = request.seq,
            command = %request.command,
            "sending request"
        );
        let mut writer = self.inner.writer.lock().await;
        codec::write_frame(&mut *writer, &body).await
    }

    async fn await_reply(
        &self,
        rx: &mut oneshot::Receiver<Result<Option<Value>>>,
    ) -> Result<Option<Value>> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                // The response may have been resolved just before teardown.
                match rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(_) => Err(DapError::Disconnected),
                }
            }
            outcome = timeout(self.inner.config.request_timeout, &mut *rx) => match outcome {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(DapError::Disconnected),
                Err(_) => Err(DapError::Timeout),
            },
        }
    }
}

async fn receive_reply(
    rx: &mut oneshot::Receiver<Result<Option<Value>>>,
) -> Result<Option<Value>> {
    match rx.await {
        Ok(outcome) => outcome,
        Err(_) => Err(DapError::Disconnected),
    }
}

/// Removes the pending entry when the requesting future is dropped before a
/// response arrives, so cancelled callers never leak table slots.
struct PendingGuard {
    inner: Arc<Inner>,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        poison::lock(&self.inner.pending, "pending requests").remove(&self.seq);
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, inner: Arc<Inner>) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = codec::read_frame(&mut reader) => frame,
        };

        match frame {
            Ok(Some(body)) => match classify(&body) {
                Ok(Incoming::Response {
                    request_seq,
                    command,
                    body,
                }) => {
                    debug!(target: "godot.dap", request_seq, command = %command, "response");
                    resolve(&inner, request_seq, Ok(body));
                }
                Ok(Incoming::ErrorResponse {
                    request_seq,
                    command,
                    message,
                }) => {
                    debug!(
                        target: "godot.dap",
                        request_seq,
                        command = %command,
                        message = %message,
                        "error response"
                    );
                    resolve(&inner, request_seq, Err(DapError::Protocol(message)));
                }
                Ok(Incoming::Event(event)) => {
                    debug!(target: "godot.dap", event = event.name(), "event");
                    let _ = inner.events.send(event);
                }
                Ok(Incoming::Request(request)) => {
                    warn!(
                        target: "godot.dap",
                        command = %request.command,
                        "ignoring reverse request from the adapter"
                    );
                }
                Err(err) => {
                    error!(target: "godot.dap", %err, "undecodable message; closing");
                    break;
                }
            },
            Ok(None) => {
                debug!(target: "godot.dap", "adapter closed the connection");
                break;
            }
            Err(err) => {
                if !inner.shutdown.is_cancelled() {
                    error!(target: "godot.dap", %err, "read failed; closing");
                }
                break;
            }
        }
    }

    // Wake blocked callers with Disconnected before the token flips, so they
    // observe the connection loss rather than a generic cancellation.
    let waiters: Vec<ReplySender> = {
        let mut pending = poison::lock(&inner.pending, "pending requests");
        pending.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
        let _ = tx.send(Err(DapError::Disconnected));
    }
    inner.shutdown.cancel();
}

fn resolve(inner: &Inner, request_seq: u64, outcome: Result<Option<Value>>) {
    let tx = poison::lock(&inner.pending, "pending requests").remove(&request_seq);
    match tx {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => {
            warn!(
                target: "godot.dap",
                request_seq,
                "dropping response for unknown or timed-out request"
            );
        }
    }
}
