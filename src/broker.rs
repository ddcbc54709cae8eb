//! Broker connections.
//!
//! A [`Broker`] is one node of the cluster. It owns at most one live
//! connection, opened lazily on the first request and reopened on demand
//! after a connection-level failure.
//!
//! # Connection lifecycle
//!
//! 1. Dial under `net.dial_timeout`
//! 2. ApiVersions, when `net.api_versions_request` is set
//! 3. SASL handshake and authentication, when `net.sasl.enable` is set
//! 4. Split into a serialized writer and a reader task
//!
//! Writes happen under one lock, which also assigns correlation ids, so the
//! in-flight queue is in wire order. The reader pops the queue head for every
//! response frame: brokers answer in request order on a connection. A
//! correlation mismatch, a read error or a timed-out request tears the
//! connection down and fails every pending request.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::constants::MAX_RESPONSE_SIZE;
use crate::error::{Error, KafkaCode, Result};
use crate::metrics::{self, MetricsRegistry};
use crate::protocol::api_versions::ApiVersionsRequest;
use crate::protocol::sasl::{SaslAuthenticateRequest, SaslHandshakeRequest};
use crate::protocol::versions::{BrokerVersions, negotiate};
use crate::protocol::{
    ApiKey, KafkaVersion, Request, Response, decode_body, encode_request, split_response,
};
use crate::sasl::{Authenticator, SaslStep};

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// Length-prefixed framing shared by the client and the mock broker.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .max_frame_length(MAX_RESPONSE_SIZE)
        .new_codec()
}

/// A cluster node and its connection.
pub struct Broker {
    id: i32,
    addr: String,
    rack: Option<String>,
    config: Arc<Config>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("rack", &self.rack)
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// A broker known from metadata. Seed brokers use id `-1`.
    pub fn new(id: i32, addr: impl Into<String>, rack: Option<String>, config: Arc<Config>) -> Self {
        Self {
            id,
            addr: addr.into(),
            rack,
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn rack(&self) -> Option<&str> {
        self.rack.as_deref()
    }

    /// Open the connection if it is not already live.
    pub async fn open(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    /// Whether a live connection exists.
    pub async fn connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    /// Version ranges the broker advertised, if ApiVersions ran.
    pub async fn api_versions(&self) -> Option<BrokerVersions> {
        self.connection
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.versions.clone())
    }

    /// Fail pending requests with [`Error::ConnectionClosed`] and drop the
    /// connection.
    pub async fn close(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().await.take() else {
            return Err(Error::NotConnected);
        };
        connection.shutdown(Error::ConnectionClosed).await;
        if let Some(reader) = connection.reader.lock().await.take() {
            let _ = reader.await;
        }
        tracing::info!(broker = %self.addr, id = self.id, "Closed broker connection");
        Ok(())
    }

    /// Send a request and wait for its response, bounded by `net.read_timeout`.
    pub async fn send<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.send_with_wait(request, Duration::ZERO).await
    }

    /// [`send`](Self::send) for requests the broker may legitimately hold,
    /// such as Fetch and JoinGroup: `wait` is added to the read timeout.
    pub async fn send_with_wait<R: Request>(&self, request: &R, wait: Duration) -> Result<R::Response> {
        self.dispatch(request, wait).await?.ok_or_else(|| {
            Error::InvariantViolation(format!("{} request expects no response", R::KEY))
        })
    }

    /// Send a request the broker does not answer (Produce with acks=0).
    pub async fn send_without_response<R: Request>(&self, request: &R) -> Result<()> {
        self.dispatch(request, Duration::ZERO).await.map(|_| ())
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref()
            && !connection.is_closed()
        {
            return Ok(connection.clone());
        }
        let connection = Arc::new(Connection::open(self.id, &self.addr, &self.config).await?);
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn dispatch<R: Request>(&self, request: &R, wait: Duration) -> Result<Option<R::Response>> {
        let connection = self.connection().await?;
        let version = negotiate_version::<R>(connection.versions.as_ref(), self.config.version)?;
        let expects_response = request.expects_response();

        let (reply, frame_len, correlation_id) = connection
            .write(request, version, &self.config, expects_response)
            .await?;
        let sent_at = Instant::now();
        self.record_request(frame_len);

        let Some(reply) = reply else {
            return Ok(None);
        };

        let deadline = self.config.net.read_timeout + wait;
        let body = match timeout(deadline, reply).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    broker = %self.addr,
                    api = %R::KEY,
                    correlation_id,
                    timeout_ms = deadline.as_millis() as u64,
                    "Request timed out, closing connection"
                );
                connection.shutdown(Error::RequestTimeout).await;
                return Err(Error::RequestTimeout);
            }
        };

        let latency = sent_at.elapsed();
        let response_len = body.len() + 4;
        let response: R::Response = decode_body(body, version)?;
        self.record_response(response_len, latency, response.throttle_time_ms());
        tracing::debug!(
            broker = %self.addr,
            api = %R::KEY,
            version,
            correlation_id,
            latency_ms = latency.as_millis() as u64,
            "Received response"
        );
        Ok(Some(response))
    }

    fn metrics(&self) -> &dyn MetricsRegistry {
        self.config.metrics.as_ref()
    }

    fn record_request(&self, size: usize) {
        let registry = self.metrics();
        registry.mark_meter(metrics::REQUEST_RATE, 1);
        registry.update_histogram(metrics::REQUEST_SIZE, size as i64);
        registry.mark_meter(metrics::OUTGOING_BYTE_RATE, size as u64);
        if self.id >= 0 {
            registry.mark_meter(&metrics::for_broker(metrics::REQUEST_RATE, self.id), 1);
            registry.update_histogram(&metrics::for_broker(metrics::REQUEST_SIZE, self.id), size as i64);
            registry.mark_meter(&metrics::for_broker(metrics::OUTGOING_BYTE_RATE, self.id), size as u64);
        }
    }

    fn record_response(&self, size: usize, latency: Duration, throttle_ms: i32) {
        let registry = self.metrics();
        let latency_ms = latency.as_millis() as i64;
        registry.mark_meter(metrics::RESPONSE_RATE, 1);
        registry.update_histogram(metrics::RESPONSE_SIZE, size as i64);
        registry.mark_meter(metrics::INCOMING_BYTE_RATE, size as u64);
        registry.update_histogram(metrics::REQUEST_LATENCY, latency_ms);
        if self.id >= 0 {
            registry.mark_meter(&metrics::for_broker(metrics::RESPONSE_RATE, self.id), 1);
            registry.update_histogram(&metrics::for_broker(metrics::RESPONSE_SIZE, self.id), size as i64);
            registry.mark_meter(&metrics::for_broker(metrics::INCOMING_BYTE_RATE, self.id), size as u64);
            registry.update_histogram(&metrics::for_broker(metrics::REQUEST_LATENCY, self.id), latency_ms);
        }
        if throttle_ms > 0 {
            tracing::debug!(broker = %self.addr, throttle_ms, "Response was throttled");
            registry.update_histogram(metrics::THROTTLE_TIME, throttle_ms as i64);
            if self.id >= 0 {
                registry.update_histogram(
                    &metrics::for_broker(metrics::THROTTLE_TIME, self.id),
                    throttle_ms as i64,
                );
            }
        }
    }
}

/// Highest version both sides support under the configured cap.
fn negotiate_version<R: Request>(versions: Option<&BrokerVersions>, cap: KafkaVersion) -> Result<i16> {
    negotiate(
        R::KEY,
        (R::MIN_VERSION, R::MAX_VERSION),
        versions.and_then(|v| v.range(R::KEY)),
        cap,
        R::required_version,
    )
}

// ============================================================================
// Connection
// ============================================================================

struct InFlight {
    correlation_id: i32,
    api_key: ApiKey,
    reply: oneshot::Sender<Result<Bytes>>,
    _permit: OwnedSemaphorePermit,
}

type PendingQueue = Arc<Mutex<VecDeque<InFlight>>>;

struct Connection {
    addr: String,
    sink: Mutex<SplitSink<Transport, Bytes>>,
    pending: PendingQueue,
    correlation_id: AtomicI32,
    permits: Arc<Semaphore>,
    versions: Option<BrokerVersions>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    async fn open(id: i32, addr: &str, config: &Config) -> Result<Self> {
        let stream = timeout(config.net.dial_timeout, dial(addr, config.net.keep_alive))
            .await
            .map_err(|_| Error::RequestTimeout)??;
        let mut transport = Framed::new(stream, frame_codec());
        let mut handshake = Handshake {
            transport: &mut transport,
            config,
            correlation_id: 0,
        };

        let versions = if config.net.api_versions_request {
            handshake.api_versions().await?
        } else {
            None
        };
        if let Some(authenticator) = config.net.sasl.authenticator()? {
            handshake.authenticate(authenticator.as_ref(), versions.as_ref()).await?;
        }
        let next_correlation_id = handshake.correlation_id;

        let (sink, stream) = transport.split();
        let pending: PendingQueue = Arc::new(Mutex::new(VecDeque::new()));
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            addr.to_string(),
            stream,
            pending.clone(),
            cancel.clone(),
        ));

        tracing::info!(broker = %addr, id, "Connected to broker");
        Ok(Self {
            addr: addr.to_string(),
            sink: Mutex::new(sink),
            pending,
            correlation_id: AtomicI32::new(next_correlation_id),
            permits: Arc::new(Semaphore::new(config.net.max_open_requests.max(1))),
            versions,
            cancel,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Encode and write one request. The returned receiver is `None` when
    /// the broker sends no response.
    async fn write<R: Request>(
        &self,
        request: &R,
        version: i16,
        config: &Config,
        expects_response: bool,
    ) -> Result<(Option<oneshot::Receiver<Result<Bytes>>>, usize, i32)> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let mut sink = self.sink.lock().await;
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode_request(request, version, correlation_id, Some(&config.client_id))?;
        let frame_len = frame.len();

        let reply = if expects_response {
            let (tx, rx) = oneshot::channel();
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            pending.push_back(InFlight {
                correlation_id,
                api_key: R::KEY,
                reply: tx,
                _permit: permit,
            });
            Some(rx)
        } else {
            if self.is_closed() {
                return Err(Error::ConnectionClosed);
            }
            None
        };

        tracing::trace!(
            broker = %self.addr,
            api = %R::KEY,
            version,
            correlation_id,
            bytes = frame_len,
            "Writing request"
        );
        let written = timeout(config.net.write_timeout, sink.send(frame.slice(4..))).await;
        drop(sink);
        match written {
            Ok(Ok(())) => Ok((reply, frame_len, correlation_id)),
            Ok(Err(e)) => {
                let error = Error::from(e);
                self.shutdown(error.clone()).await;
                Err(error)
            }
            Err(_) => {
                self.shutdown(Error::RequestTimeout).await;
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Stop the reader and fail every pending request with `error`.
    async fn shutdown(&self, error: Error) {
        self.cancel.cancel();
        fail_pending(&self.pending, &error).await;
        let _ = self.sink.lock().await.close().await;
    }
}

async fn fail_pending(pending: &PendingQueue, error: &Error) {
    let drained: Vec<InFlight> = pending.lock().await.drain(..).collect();
    for entry in drained {
        let _ = entry.reply.send(Err(error.clone()));
    }
}

async fn read_loop(
    addr: String,
    mut stream: SplitStream<Transport>,
    pending: PendingQueue,
    cancel: CancellationToken,
) {
    let failure = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break Error::ConnectionClosed,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            None => break Error::ConnectionClosed,
            Some(Err(e)) => break Error::from(e),
            Some(Ok(frame)) => frame.freeze(),
        };
        let (correlation_id, body) = match split_response(frame) {
            Ok(parts) => parts,
            Err(e) => break e,
        };
        let Some(entry) = pending.lock().await.pop_front() else {
            break Error::InvariantViolation(format!(
                "response {correlation_id} arrived with no request in flight"
            ));
        };
        if entry.correlation_id != correlation_id {
            let error = Error::InvariantViolation(format!(
                "expected correlation id {} for {}, got {correlation_id}",
                entry.correlation_id, entry.api_key
            ));
            tracing::warn!(broker = %addr, error = %error, "Broker connection failed");
            cancel.cancel();
            let _ = entry.reply.send(Err(error.clone()));
            break error;
        }
        let _ = entry.reply.send(Ok(body));
    };

    if !cancel.is_cancelled() {
        tracing::warn!(broker = %addr, error = %failure, "Broker connection failed");
    }
    cancel.cancel();
    fail_pending(&pending, &failure).await;
}

async fn dial(addr: &str, keep_alive: Option<Duration>) -> Result<TcpStream> {
    let mut last_error = Error::IoError(std::io::ErrorKind::AddrNotAvailable);
    for socket_addr in lookup_host(addr).await? {
        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if keep_alive.is_some() {
            socket.set_keepalive(true)?;
        }
        match socket.connect(socket_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(broker = %addr, %socket_addr, error = %e, "Dial attempt failed");
                last_error = e.into();
            }
        }
    }
    Err(last_error)
}

// ============================================================================
// Handshake
// ============================================================================

/// Request/response exchanges on the unsplit transport before the reader
/// task starts.
struct Handshake<'a> {
    transport: &'a mut Transport,
    config: &'a Config,
    correlation_id: i32,
}

impl Handshake<'_> {
    async fn exchange<R: Request>(&mut self, request: &R, version: i16) -> Result<R::Response> {
        let correlation_id = self.correlation_id;
        self.correlation_id += 1;
        let frame = encode_request(request, version, correlation_id, Some(&self.config.client_id))?;
        self.write_token(frame.slice(4..)).await?;
        let (got, body) = split_response(self.read_token().await?)?;
        if got != correlation_id {
            return Err(Error::InvariantViolation(format!(
                "expected correlation id {correlation_id} for {}, got {got}",
                R::KEY
            )));
        }
        decode_body(body, version)
    }

    async fn write_token(&mut self, token: Bytes) -> Result<()> {
        timeout(self.config.net.write_timeout, self.transport.send(token))
            .await
            .map_err(|_| Error::RequestTimeout)??;
        Ok(())
    }

    async fn read_token(&mut self) -> Result<Bytes> {
        let frame = timeout(self.config.net.read_timeout, self.transport.next())
            .await
            .map_err(|_| Error::RequestTimeout)?
            .ok_or(Error::ConnectionClosed)??;
        Ok(frame.freeze())
    }

    /// `None` when the configured version predates ApiVersions.
    async fn api_versions(&mut self) -> Result<Option<BrokerVersions>> {
        let Ok(version) = negotiate_version::<ApiVersionsRequest>(None, self.config.version) else {
            return Ok(None);
        };
        let mut response = self.exchange(&ApiVersionsRequest, version).await?;
        if response.error_code == KafkaCode::UnsupportedVersion && version > 0 {
            // Brokers answer an unknown ApiVersions version with a v0 body.
            response = self.exchange(&ApiVersionsRequest, 0).await?;
        }
        response.error_code.ok()?;
        Ok(Some(BrokerVersions::new(&response.api_keys)))
    }

    async fn authenticate(
        &mut self,
        authenticator: &dyn Authenticator,
        versions: Option<&BrokerVersions>,
    ) -> Result<()> {
        let mechanism = authenticator.mechanism().to_string();
        let mut handshake_version = self.config.net.sasl.handshake_version;
        if let Some((_, max)) = versions.and_then(|v| v.range(ApiKey::SaslHandshake)) {
            handshake_version = handshake_version.min(max);
        }
        let response = self
            .exchange(
                &SaslHandshakeRequest {
                    mechanism: mechanism.clone(),
                },
                handshake_version,
            )
            .await?;
        match response.error_code {
            KafkaCode::None => {}
            KafkaCode::UnsupportedSaslMechanism => {
                return Err(Error::SaslAuthentication(format!(
                    "broker does not support {mechanism}, enabled: {}",
                    response.mechanisms.join(", ")
                )));
            }
            code => return Err(Error::Kafka(code)),
        }

        let authenticate_version = if handshake_version >= 1 {
            Some(negotiate_version::<SaslAuthenticateRequest>(versions, self.config.version)?)
        } else {
            None
        };

        let mut exchange = authenticator.begin().await?;
        let mut challenge: Option<Bytes> = None;
        loop {
            let token = match exchange.step(challenge.as_deref())? {
                SaslStep::Respond(token) => token,
                SaslStep::Done => break,
            };
            challenge = Some(match authenticate_version {
                Some(version) => {
                    let response = self
                        .exchange(&SaslAuthenticateRequest { auth_bytes: token }, version)
                        .await?;
                    if !response.error_code.is_ok() {
                        return Err(Error::SaslAuthentication(
                            response
                                .error_message
                                .unwrap_or_else(|| format!("{:?}", response.error_code)),
                        ));
                    }
                    response.auth_bytes
                }
                None => {
                    self.write_token(token).await?;
                    self.read_token().await?
                }
            });
        }
        tracing::info!(mechanism = %mechanism, "SASL authentication succeeded");
        Ok(())
    }
}
