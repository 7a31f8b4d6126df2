//! Correlating client over a single WebSocket connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use batchline_common::{
    ClientStatus, Envelope, EnvelopeKind, ErrorBody, Hello, HelloAck, Payload, ServerStatus,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Version reported in the handshake and compared against the server.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>;

/// Outcome of one request, tagged with the id it was sent under.
#[derive(Debug)]
pub struct Fetched {
    pub request_id: u64,
    pub result: Result<Payload>,
}

/// Client connected to a batchline server.
///
/// Cheap to clone; every clone shares the same connection and the same
/// concurrency bound. Replies are matched to callers by request id, so calls
/// may complete in any order.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    identity: String,
    outbound: mpsc::Sender<Message>,
    pending: PendingMap,
    next_request_id: AtomicU64,
    slots: Arc<Semaphore>,
    reader: JoinHandle<()>,
    /// Results of [`Client::submit`] calls, waiting for [`Client::fetch`].
    completed_tx: mpsc::UnboundedSender<Fetched>,
    completed_rx: AsyncMutex<mpsc::UnboundedReceiver<Fetched>>,
    /// Submitted requests whose result has not been fetched yet.
    unfetched: AtomicUsize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a correlation entry when the waiting call finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.request_id);
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Envelope>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Connect, perform the handshake and, unless `ignore_all_checks` is set,
    /// verify the server protocol and version.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let identity = config
            .identity
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (ws_stream, _) = connect_async(config.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let hello = Hello {
            identity: identity.clone(),
            protocol: config.protocol,
            client_version: CLIENT_VERSION.to_string(),
        };
        let frame = Envelope::with_json(EnvelopeKind::Hello, &identity, 0, &hello)?;
        write.send(Message::Binary(frame.encode().to_vec())).await?;

        match timeout(config.handshake_timeout, read.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                let env = Envelope::decode(Bytes::from(data))?;
                match env.kind {
                    EnvelopeKind::HelloAck => {
                        let ack: HelloAck = env.decode_json()?;
                        tracing::debug!(
                            "Connected to {} as {} (server {})",
                            config.url,
                            ack.identity,
                            ack.server_version
                        );
                    }
                    EnvelopeKind::Error => {
                        let body: ErrorBody = env.decode_json()?;
                        return Err(ClientError::Handshake(format!(
                            "{} - {}",
                            body.kind, body.message
                        )));
                    }
                    other => {
                        return Err(ClientError::Handshake(format!(
                            "Unexpected {:?} frame in response to hello",
                            other
                        )));
                    }
                }
            }
            Ok(Some(Ok(_))) => {
                return Err(ClientError::Handshake(
                    "Expected binary frame for hello ack".to_string(),
                ));
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => {
                return Err(ClientError::Handshake(
                    "Connection closed during handshake".to_string(),
                ));
            }
            Err(_) => {
                return Err(ClientError::Handshake(
                    "Hello acknowledgement timeout".to_string(),
                ));
            }
        }

        let (tx, mut rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    tracing::warn!("Failed to send frame to server: {}", e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        let pending: PendingMap = Arc::default();
        let reader = tokio::spawn(read_loop(read, pending.clone()));
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();

        let client = Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                config,
                identity,
                outbound: tx,
                pending,
                next_request_id: AtomicU64::new(0),
                reader,
                completed_tx,
                completed_rx: AsyncMutex::new(completed_rx),
                unfetched: AtomicUsize::new(0),
            }),
        };

        if !client.inner.config.ignore_all_checks {
            client.verify_server().await?;
        }

        Ok(client)
    }

    async fn verify_server(&self) -> Result<()> {
        let status = self.server_status().await?;
        let config = &self.inner.config;
        if status.protocol != config.protocol {
            return Err(ClientError::ProtocolMismatch {
                server: status.protocol,
                client: config.protocol,
            });
        }
        if config.check_version && status.server_version != CLIENT_VERSION {
            return Err(ClientError::VersionMismatch {
                server: status.server_version,
                client: CLIENT_VERSION.to_string(),
            });
        }
        Ok(())
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Submit a payload and wait for its reassembled result.
    ///
    /// Waits for a free concurrency slot first.
    pub async fn encode(&self, payload: impl Into<Payload>) -> Result<Payload> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Closed)?;
        self.call(payload.into(), permit).await
    }

    /// Like [`Client::encode`] but fails with `ConcurrencyExceeded` instead of
    /// waiting when every slot is taken.
    pub async fn try_encode(&self, payload: impl Into<Payload>) -> Result<Payload> {
        let permit = self.try_slot()?;
        self.call(payload.into(), permit).await
    }

    fn try_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::NoPermits => {
                    ClientError::ConcurrencyExceeded(self.inner.config.max_concurrency)
                }
                TryAcquireError::Closed => ClientError::Closed,
            })
    }

    /// Send a payload without waiting for its result and return its request id.
    ///
    /// Waits for a free concurrency slot; the slot is held until the reply
    /// arrives or the call times out. Collect results with [`Client::fetch`]
    /// or [`Client::fetch_all`].
    pub async fn submit(&self, payload: impl Into<Payload>) -> Result<u64> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Closed)?;
        let request_id = self.next_request_id();
        self.inner.unfetched.fetch_add(1, Ordering::SeqCst);

        let client = self.clone();
        let payload = payload.into();
        tokio::spawn(async move {
            let result = client.call_as(request_id, payload, permit).await;
            let _ = client.inner.completed_tx.send(Fetched { request_id, result });
        });
        Ok(request_id)
    }

    /// Next finished submitted request, in completion order.
    ///
    /// Returns `None` once every submitted request has been fetched.
    pub async fn fetch(&self) -> Option<Fetched> {
        let mut completed = self.inner.completed_rx.lock().await;
        if self.inner.unfetched.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let fetched = completed.recv().await?;
        self.inner.unfetched.fetch_sub(1, Ordering::SeqCst);
        Some(fetched)
    }

    /// Wait for every submitted request. With `sort` the results come back in
    /// request id order, which is submission order.
    pub async fn fetch_all(&self, sort: bool) -> Vec<Fetched> {
        let mut all = Vec::new();
        while let Some(fetched) = self.fetch().await {
            if let Err(e) = &fetched.result {
                tracing::warn!("Request {} failed: {}", fetched.request_id, e);
            }
            all.push(fetched);
        }
        if sort {
            all.sort_by_key(|f| f.request_id);
        }
        all
    }

    /// Encode every payload of `inputs`, keeping up to `max_concurrency` in
    /// flight, and yield results as they finish.
    pub fn encode_stream<S, P>(&self, inputs: S) -> impl Stream<Item = Fetched> + Send + 'static
    where
        S: Stream<Item = P> + Send + 'static,
        P: Into<Payload> + Send + 'static,
    {
        let client = self.clone();
        let limit = self.inner.config.max_concurrency.max(1);
        inputs
            .map(move |payload| {
                let client = client.clone();
                async move { client.encode_tracked(payload.into()).await }
            })
            .buffer_unordered(limit)
    }

    async fn encode_tracked(&self, payload: Payload) -> Fetched {
        let result = self.inner.slots.clone().acquire_owned().await;
        let request_id = self.next_request_id();
        let result = match result {
            Ok(permit) => self.call_as(request_id, payload, permit).await,
            Err(_) => Err(ClientError::Closed),
        };
        Fetched { request_id, result }
    }

    async fn call(&self, payload: Payload, permit: OwnedSemaphorePermit) -> Result<Payload> {
        let request_id = self.next_request_id();
        self.call_as(request_id, payload, permit).await
    }

    async fn call_as(&self, request_id: u64, payload: Payload, _permit: OwnedSemaphorePermit) -> Result<Payload> {
        let expected = self.inner.config.protocol;
        if payload.protocol() != expected {
            return Err(ClientError::WrongPayloadProtocol {
                expected,
                actual: payload.protocol(),
            });
        }

        let env = Envelope::request(&self.inner.identity, request_id, &payload)?;
        let reply = self.round_trip(env).await?;

        match reply.kind {
            EnvelopeKind::Reply => Ok(reply.decode_payload()?),
            EnvelopeKind::Partial => Err(ClientError::PartialResult {
                received: reply.partition_index,
                expected: reply.partition_count,
                payload: reply.decode_payload()?,
            }),
            EnvelopeKind::Error => {
                let body: ErrorBody = reply.decode_json()?;
                Err(ClientError::Remote {
                    kind: body.kind,
                    message: body.message,
                })
            }
            other => Err(ClientError::Handshake(format!(
                "Unexpected {:?} frame in response to request {}",
                other, request_id
            ))),
        }
    }

    /// Current status of the server this client is connected to.
    pub async fn server_status(&self) -> Result<ServerStatus> {
        let _permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Closed)?;

        let request_id = self.next_request_id();
        let env = Envelope::with_json(
            EnvelopeKind::StatusRequest,
            &self.inner.identity,
            request_id,
            &serde_json::json!({}),
        )?;
        let reply = self.round_trip(env).await?;
        match reply.kind {
            EnvelopeKind::StatusReply => Ok(reply.decode_json()?),
            EnvelopeKind::Error => {
                let body: ErrorBody = reply.decode_json()?;
                Err(ClientError::Remote {
                    kind: body.kind,
                    message: body.message,
                })
            }
            other => Err(ClientError::Handshake(format!(
                "Unexpected {:?} frame in response to status request",
                other
            ))),
        }
    }

    /// Local status of this client.
    pub fn status(&self) -> ClientStatus {
        let mut pending_request: Vec<u64> = lock(&self.inner.pending).keys().copied().collect();
        pending_request.sort_unstable();
        let config = &self.inner.config;
        ClientStatus {
            identity: self.inner.identity.clone(),
            server_url: config.url.clone(),
            protocol: config.protocol,
            client_version: CLIENT_VERSION.to_string(),
            num_request: self.inner.next_request_id.load(Ordering::Relaxed),
            num_pending_request: pending_request.len(),
            pending_request,
            max_concurrency: config.max_concurrency,
            timeout_ms: config.timeout.as_millis() as u64,
        }
    }

    /// Number of calls that could start right now without waiting.
    pub fn available_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Gently close the connection. Pending calls fail with `Closed`.
    pub async fn close(&self) {
        let _ = self.inner.outbound.send(Message::Close(None)).await;
        self.inner.slots.close();
    }

    fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn round_trip(&self, env: Envelope) -> Result<Envelope> {
        let request_id = env.request_id;
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            request_id,
        };

        self.inner
            .outbound
            .send(Message::Binary(env.encode().to_vec()))
            .await
            .map_err(|_| ClientError::Closed)?;

        let deadline = self.inner.config.timeout;
        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                tracing::warn!(
                    "Request {}#{} timed out after {:?}",
                    self.inner.identity,
                    request_id,
                    deadline
                );
                Err(ClientError::Timeout {
                    request_id,
                    timeout_ms: deadline.as_millis() as u64,
                })
            }
        }
    }
}

/// Route each inbound frame to the caller waiting on its request id.
async fn read_loop<R>(mut read: R, pending: PendingMap)
where
    R: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(result) = read.next().await {
        match result {
            Ok(Message::Binary(data)) => match Envelope::decode(Bytes::from(data)) {
                Ok(env) => {
                    let waiter = lock(&pending).remove(&env.request_id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(env);
                        }
                        None => {
                            tracing::debug!(
                                "Discarding reply for request {} with no waiting caller",
                                env.request_id
                            );
                        }
                    }
                }
                Err(e) => tracing::warn!("Dropping undecodable frame from server: {}", e),
            },
            Ok(Message::Close(_)) => {
                tracing::debug!("Server sent close frame");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket error from server: {}", e);
                break;
            }
        }
    }

    // Wake every waiting caller with `Closed`.
    lock(&pending).clear();
}
