//! The connection multiplexer.
//!
//! One `Connection` owns one socket. Writes are serialized behind an async
//! mutex; a single reader task drains the socket and resolves pending
//! completions by correlation id or routes sync-less frames to watch
//! callbacks. On any socket loss every outstanding completion fails with a
//! transport error — none is ever left pending.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use boxproto_wire::{encode_request, read_frame, Request, Response, WireError};

use crate::auth::auth_request;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::greeting::{parse_greeting, GREETING_SIZE};

/// A pushed watch event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub data: Option<rmpv::Value>,
}

/// Callback invoked for every pushed event on a watched key.
pub type WatchHandler = Arc<dyn Fn(WatchEvent) + Send + Sync>;

type Completion = oneshot::Sender<ClientResult<Response>>;

struct Shared {
    peer: String,
    /// Next correlation id; monotonically increasing, never reused.
    sync: AtomicU64,
    pending: StdMutex<HashMap<u64, Completion>>,
    watchers: StdMutex<HashMap<String, WatchHandler>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
}

/// Handle to one multiplexed connection. Clones share the socket, the
/// correlation counter, and the pending table.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Connects, reads the greeting, and runs the auth exchange when
    /// credentials are configured. The reader task starts only after auth
    /// succeeds, so a rejected attempt leaves no state behind.
    pub async fn connect(config: &ClientConfig) -> ClientResult<Connection> {
        config.validate()?;
        let addr = config.addr();

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Transport(format!("connect to {addr} timed out")))??;
        stream.set_nodelay(true)?;

        let mut stream = stream;
        let mut banner = [0u8; GREETING_SIZE];
        tokio::io::AsyncReadExt::read_exact(&mut stream, &mut banner).await?;
        let greeting = parse_greeting(&banner)?;

        if let Some(user) = &config.user {
            let req = auth_request(user, &config.password, config.auth_method, &greeting.salt);
            let mut buf = Vec::with_capacity(128);
            encode_request(&req, Some(0), None, &mut buf)?;
            stream.write_all(&buf).await?;

            let frame = read_frame(&mut stream).await?;
            let resp = Response::decode(&frame)?;
            if resp.is_error() {
                let message = resp
                    .error_message()
                    .unwrap_or("credentials rejected")
                    .to_string();
                return Err(ClientError::Auth(message));
            }
            debug!(%addr, %user, "authenticated");
        }

        let (rd, wr) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            peer: addr,
            sync: AtomicU64::new(1),
            pending: StdMutex::new(HashMap::new()),
            watchers: StdMutex::new(HashMap::new()),
            writer: Mutex::new(Some(wr)),
            reader: StdMutex::new(None),
            closed_tx,
        });

        let handle = tokio::spawn(read_loop(rd, shared.clone()));
        *shared.reader.lock().expect("reader mutex poisoned") = Some(handle);

        Ok(Connection { shared })
    }

    /// Issues one request and awaits its response.
    ///
    /// On timeout the pending completion is removed and the call fails with
    /// [`ClientError::Timeout`]; a late server reply is then dropped by the
    /// reader.
    pub async fn request(&self, req: &Request, timeout: Duration) -> ClientResult<Response> {
        self.request_on_stream(req, None, timeout).await
    }

    /// Issues one request bound to a caller-supplied stream id.
    ///
    /// The stream id is an opaque tag correlating several requests with one
    /// server-side transaction; the transport gives no per-stream ordering
    /// guarantee beyond byte-stream FIFO delivery.
    pub async fn request_on_stream(
        &self,
        req: &Request,
        stream_id: Option<u64>,
        timeout: Duration,
    ) -> ClientResult<Response> {
        if req.is_fire_and_forget() {
            return Err(ClientError::Config(
                "watch/unwatch are fire-and-forget; use watch()/unwatch()".into(),
            ));
        }
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let sync = self.shared.sync.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(sync, tx);

        let mut buf = Vec::with_capacity(64);
        if let Err(e) = encode_request(req, Some(sync), stream_id, &mut buf) {
            self.remove_pending(sync);
            return Err(e.into());
        }
        if let Err(e) = self.write_frame(&buf).await {
            self.remove_pending(sync);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without resolving; only possible mid-teardown.
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.remove_pending(sync);
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Minimal no-payload round trip; failure means the connection is
    /// unusable.
    pub async fn ping(&self, timeout: Duration) -> ClientResult<()> {
        self.request(&Request::Ping, timeout).await.map(|_| ())
    }

    /// Registers a callback for pushed events on `key` and sends the
    /// fire-and-forget watch frame.
    pub async fn watch(&self, key: &str, handler: WatchHandler) -> ClientResult<()> {
        self.shared
            .watchers
            .lock()
            .expect("watchers mutex poisoned")
            .insert(key.to_string(), handler);
        self.send_fire_and_forget(&Request::Watch {
            key: key.to_string(),
        })
        .await
    }

    /// Unregisters the callback for `key` and sends the unwatch frame.
    pub async fn unwatch(&self, key: &str) -> ClientResult<()> {
        self.shared
            .watchers
            .lock()
            .expect("watchers mutex poisoned")
            .remove(key);
        self.send_fire_and_forget(&Request::Unwatch {
            key: key.to_string(),
        })
        .await
    }

    /// One-shot read of a watched key's current value; a normal correlated
    /// request, not a subscription.
    pub async fn watch_once(&self, key: &str, timeout: Duration) -> ClientResult<Response> {
        self.request(
            &Request::WatchOnce {
                key: key.to_string(),
            },
            timeout,
        )
        .await
    }

    /// Closes the connection. Every outstanding completion fails with a
    /// transport error. Idempotent.
    pub fn close(&self) {
        self.shared.teardown("closed locally");
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed_tx.borrow()
    }

    /// A watch channel that flips to `true` when the connection is torn
    /// down, however that happens.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.shared.closed_tx.subscribe()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .len()
    }

    /// Remote address this connection talks to.
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    async fn send_fire_and_forget(&self, req: &Request) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let mut buf = Vec::with_capacity(64);
        encode_request(req, None, None, &mut buf)?;
        self.write_frame(&buf).await
    }

    async fn write_frame(&self, buf: &[u8]) -> ClientResult<()> {
        let mut guard = self.shared.writer.lock().await;
        let Some(wr) = guard.as_mut() else {
            return Err(ClientError::Closed);
        };
        if let Err(e) = wr.write_all(buf).await {
            drop(guard);
            self.shared.teardown("write failed");
            return Err(e.into());
        }
        Ok(())
    }

    fn remove_pending(&self, sync: u64) {
        self.shared
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&sync);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    /// Tears the connection down: marks it closed, fails every pending
    /// completion with a transport error, and stops the reader. Idempotent.
    fn teardown(&self, reason: &str) {
        if self.closed_tx.send_replace(true) {
            return;
        }

        let drained: Vec<(u64, Completion)> = {
            let mut pending = self.pending.lock().expect("pending mutex poisoned");
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(
                peer = %self.peer,
                count = drained.len(),
                reason,
                "failing pending requests"
            );
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::Transport(format!(
                "connection lost: {reason}"
            ))));
        }

        self.watchers
            .lock()
            .expect("watchers mutex poisoned")
            .clear();

        // Drop the write half so the peer sees the close; skip if a writer
        // is mid-flight, its next write fails anyway.
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
        if let Some(handle) = self.reader.lock().expect("reader mutex poisoned").take() {
            handle.abort();
        }
    }
}

async fn read_loop(mut rd: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let frame = match read_frame(&mut rd).await {
            Ok(frame) => frame,
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                shared.teardown("closed by peer");
                return;
            }
            Err(e) => {
                warn!(peer = %shared.peer, error = %e, "read failed");
                shared.teardown("read failed");
                return;
            }
        };
        match Response::decode(&frame) {
            Ok(resp) => dispatch(&shared, resp),
            Err(e) => {
                // A frame we cannot parse means we lost framing; the
                // connection cannot be trusted past this point.
                warn!(peer = %shared.peer, error = %e, "malformed frame");
                shared.teardown("malformed frame");
                return;
            }
        }
    }
}

fn dispatch(shared: &Shared, resp: Response) {
    match resp.sync() {
        Some(sync) => {
            let completion = shared
                .pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&sync);
            match completion {
                Some(tx) => {
                    let result = if resp.is_error() {
                        Err(ClientError::Application {
                            code: resp.error_code().unwrap_or(0),
                            message: resp
                                .error_message()
                                .unwrap_or("unknown error")
                                .to_string(),
                        })
                    } else {
                        Ok(resp)
                    };
                    let _ = tx.send(result);
                }
                // Usually a reply arriving after its request timed out.
                None => debug!(peer = %shared.peer, sync, "response with no pending request"),
            }
        }
        None => {
            let Some(key) = resp.event_key().map(str::to_string) else {
                debug!(peer = %shared.peer, "ignored packet without sync or event key");
                return;
            };
            let handler = shared
                .watchers
                .lock()
                .expect("watchers mutex poisoned")
                .get(&key)
                .cloned();
            match handler {
                Some(handler) => handler(WatchEvent {
                    data: resp.event_data().cloned(),
                    key,
                }),
                None => debug!(peer = %shared.peer, %key, "event for unwatched key ignored"),
            }
        }
    }
}
