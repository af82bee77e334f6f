//! Scripted in-process DAP peer for tests.
//!
//! The mock binds an ephemeral localhost port, accepts a single connection,
//! and hands every decoded request to the test through a channel. The test
//! script drives the conversation explicitly: receive a request, respond (or
//! respond with an error), interleave events. Nothing is answered
//! automatically, so tests control ordering down to the frame.
//!
//! This is a test collaborator, so it panics on misuse rather than
//! propagating errors.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::messages::{EventMessage, RequestMessage, ResponseMessage};

const RECV_DEADLINE: Duration = Duration::from_secs(5);

pub struct MockDapServer {
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    requests: Mutex<mpsc::UnboundedReceiver<RequestMessage>>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    next_seq: AtomicU64,
    bytes_received: Arc<AtomicUsize>,
}

impl MockDapServer {
    /// Binds an ephemeral port and starts serving the first connection.
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock listener address");

        let shutdown = CancellationToken::new();
        let writer: Arc<Mutex<Option<OwnedWriteHalf>>> = Arc::new(Mutex::new(None));
        let bytes_received = Arc::new(AtomicUsize::new(0));
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        tokio::spawn(serve(
            listener,
            shutdown.clone(),
            Arc::clone(&writer),
            Arc::clone(&bytes_received),
            requests_tx,
        ));

        Self {
            addr,
            shutdown,
            requests: Mutex::new(requests_rx),
            writer,
            next_seq: AtomicU64::new(1),
            bytes_received,
        }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Bytes that have arrived on the wire so far. Lets tests assert that a
    /// locally rejected call produced no traffic at all.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// Receives the next request, whatever its command.
    pub async fn recv_request(&self) -> RequestMessage {
        let mut requests = self.requests.lock().await;
        timeout(RECV_DEADLINE, requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("connection closed before a request arrived")
    }

    /// Receives the next request and asserts its command.
    pub async fn expect_request(&self, command: &str) -> RequestMessage {
        let request = self.recv_request().await;
        assert_eq!(
            request.command, command,
            "expected a {command:?} request, got {:?}",
            request.command
        );
        request
    }

    /// Sends a success response for `request`.
    pub async fn respond(&self, request: &RequestMessage, body: Option<Value>) {
        self.send(&ResponseMessage {
            seq: self.next_seq(),
            kind: "response".to_string(),
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        })
        .await;
    }

    /// Sends a failure response for `request` carrying `message`.
    pub async fn respond_error(&self, request: &RequestMessage, message: &str) {
        self.send(&ResponseMessage {
            seq: self.next_seq(),
            kind: "response".to_string(),
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.to_string()),
            body: None,
        })
        .await;
    }

    /// Sends an unsolicited event.
    pub async fn send_event(&self, event: &str, body: Option<Value>) {
        self.send(&EventMessage {
            seq: self.next_seq(),
            kind: "event".to_string(),
            event: event.to_string(),
            body,
        })
        .await;
    }

    /// Sends a raw value as one frame. Useful for malformed-message tests.
    pub async fn send_raw(&self, value: &Value) {
        let body = serde_json::to_vec(value).expect("encode raw frame");
        self.write(&body).await;
    }

    /// Drops the connection, simulating an editor crash or exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.writer.lock().await.take();
    }

    async fn send<T: serde::Serialize>(&self, message: &T) {
        let body = serde_json::to_vec(message).expect("encode mock message");
        self.write(&body).await;
    }

    async fn write(&self, body: &[u8]) {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().expect("no client connected");
        codec::write_frame(writer, body)
            .await
            .expect("write mock frame");
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }
}

async fn serve(
    listener: TcpListener,
    shutdown: CancellationToken,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    bytes_received: Arc<AtomicUsize>,
    requests: mpsc::UnboundedSender<RequestMessage>,
) {
    let stream = tokio::select! {
        _ = shutdown.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(_) => return,
        },
    };
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    *writer.lock().await = Some(write_half);

    let mut reader = BufReader::new(CountingReader {
        inner: read_half,
        count: bytes_received,
    });
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = codec::read_frame(&mut reader) => frame,
        };
        let Ok(Some(body)) = frame else {
            return;
        };
        let Ok(request) = serde_json::from_slice::<RequestMessage>(&body) else {
            continue;
        };
        if requests.send(request).is_err() {
            return;
        }
    }
}

/// Counts every byte the client manages to put on the wire.
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicUsize>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        let poll = std::pin::Pin::new(&mut me.inner).poll_read(cx, buf);
        if let std::task::Poll::Ready(Ok(())) = &poll {
            me.count
                .fetch_add(buf.filled().len() - before, Ordering::SeqCst);
        }
        poll
    }
}
