use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use nombytes::NomBytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::broker::frame_codec;
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::api_versions::{ApiVersionRange, ApiVersionsResponse};
use crate::protocol::fetch::FetchRequest;
use crate::protocol::groups::{ErrorOnlyResponse, JoinGroupResponse, SyncGroupResponse};
use crate::protocol::sasl::{SaslAuthenticateResponse, SaslHandshakeResponse};
use crate::protocol::{self, ApiKey, Request, RequestBody, RequestHeader, ResponseBody, encode_response};

use super::group::{Group, Reply};
use super::state::ClusterState;

/// State shared by every broker of one mock cluster.
pub(crate) struct Shared {
    pub(crate) state: StdMutex<ClusterState>,
    pub(crate) appended: Notify,
    pub(crate) sasl: Option<(String, String)>,
}

impl Shared {
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, ClusterState>> {
        self.state
            .lock()
            .map_err(|_| Error::InvariantViolation("mock cluster state poisoned".to_string()))
    }
}

/// What a connection does with a handled request.
enum Outcome {
    Respond(ResponseBody),
    /// Write nothing and keep reading.
    Skip,
    /// Write nothing and hang up.
    Close,
    /// Write nothing, ever, until the broker shuts down.
    Stall,
}

// ============================================================================
// Listener
// ============================================================================

/// One mock broker: a TCP listener speaking the Kafka protocol against the
/// shared cluster model.
pub struct MockBroker {
    id: i32,
    addr: String,
    shutdown: broadcast::Sender<()>,
}

impl MockBroker {
    pub(crate) async fn bind() -> Result<(TcpListener, String)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        Ok((listener, addr))
    }

    pub(crate) fn start(id: i32, listener: TcpListener, addr: String, shared: Arc<Shared>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown.subscribe();
        let conn_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!(broker = id, "Mock broker shutting down");
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                tracing::warn!(broker = id, error = %e, "Mock broker accept failed");
                                continue;
                            }
                        };
                        tracing::debug!(broker = id, client_addr = %peer, "Accepted connection");
                        let connection = Connection::new(id, stream, shared.clone());
                        let mut stop = conn_shutdown.subscribe();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = stop.recv() => {}
                                result = connection.run() => {
                                    if let Err(e) = result {
                                        tracing::debug!(broker = id, client_addr = %peer, error = %e, "Mock connection ended");
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });
        Self { id, addr, shutdown }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// `host:port` the broker listens on.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    broker: i32,
    transport: Framed<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    shared: Arc<Shared>,
    client_id: String,
    authenticated: bool,
    /// Set after a v0 SaslHandshake: the next frame is a bare token.
    raw_token_next: bool,
}

impl Connection {
    fn new(broker: i32, stream: TcpStream, shared: Arc<Shared>) -> Self {
        let authenticated = shared.sasl.is_none();
        Self {
            broker,
            transport: Framed::new(stream, frame_codec()),
            shared,
            client_id: String::new(),
            authenticated,
            raw_token_next: false,
        }
    }

    /// Requests are answered one at a time, in the order they arrived.
    async fn run(mut self) -> Result<()> {
        while let Some(frame) = self.transport.next().await {
            let frame = frame?.freeze();
            if self.raw_token_next {
                self.raw_token_next = false;
                if !self.check_plain(&frame) {
                    tracing::warn!(broker = self.broker, "Mock SASL authentication failed");
                    return Ok(());
                }
                self.authenticated = true;
                self.transport.send(Bytes::new()).await?;
                continue;
            }

            let (body, header) = RequestHeader::decode(NomBytes::new(frame))?;
            if let Some(client_id) = &header.client_id {
                self.client_id.clone_from(client_id);
            }
            let outcome = match RequestBody::decode(header.api_key, header.api_version, body.into_bytes()) {
                Ok(request) => self.handle(&header, request).await?,
                Err(Error::UnsupportedVersion { .. }) if header.api_key == ApiKey::ApiVersions => {
                    Outcome::Respond(ResponseBody::ApiVersions(ApiVersionsResponse {
                        error_code: KafkaCode::UnsupportedVersion,
                        api_keys: supported_versions(),
                        throttle_time_ms: 0,
                    }))
                }
                Err(e) => {
                    tracing::warn!(broker = self.broker, api = %header.api_key, error = %e, "Mock broker cannot decode request");
                    return Err(e);
                }
            };
            match outcome {
                Outcome::Respond(response) => {
                    let version = match &response {
                        // v0 body for an ApiVersions version we do not know
                        ResponseBody::ApiVersions(r) if r.error_code == KafkaCode::UnsupportedVersion => 0,
                        _ => header.api_version,
                    };
                    let frame = encode_response(&response, version, header.correlation_id)?;
                    self.transport.send(frame.slice(4..)).await?;
                }
                Outcome::Skip => {}
                Outcome::Close => {
                    tracing::debug!(broker = self.broker, api = %header.api_key, "Mock broker dropping connection");
                    return Ok(());
                }
                Outcome::Stall => {
                    tracing::debug!(broker = self.broker, api = %header.api_key, "Mock broker stalling connection");
                    std::future::pending::<()>().await;
                }
            }
        }
        Ok(())
    }

    fn check_plain(&self, token: &[u8]) -> bool {
        let Some((user, password)) = &self.shared.sasl else {
            return true;
        };
        let mut parts = token.split(|b| *b == 0);
        let _authzid = parts.next();
        parts.next() == Some(user.as_bytes()) && parts.next() == Some(password.as_bytes())
    }

    async fn handle(&mut self, header: &RequestHeader, request: RequestBody) -> Result<Outcome> {
        let broker = self.broker;
        let respond = |body: ResponseBody| -> Result<Outcome> { Ok(Outcome::Respond(body)) };

        if !self.authenticated
            && !matches!(
                request,
                RequestBody::ApiVersions(_) | RequestBody::SaslHandshake(_) | RequestBody::SaslAuthenticate(_)
            )
        {
            tracing::warn!(broker, api = %header.api_key, "Request before SASL authentication");
            return Ok(Outcome::Close);
        }

        match request {
            RequestBody::ApiVersions(_) => respond(ResponseBody::ApiVersions(ApiVersionsResponse {
                error_code: KafkaCode::None,
                api_keys: supported_versions(),
                throttle_time_ms: 0,
            })),
            RequestBody::SaslHandshake(r) => {
                let mechanisms = vec!["PLAIN".to_string()];
                let error_code = if r.mechanism == "PLAIN" {
                    self.raw_token_next = header.api_version == 0;
                    KafkaCode::None
                } else {
                    KafkaCode::UnsupportedSaslMechanism
                };
                respond(ResponseBody::SaslHandshake(SaslHandshakeResponse { error_code, mechanisms }))
            }
            RequestBody::SaslAuthenticate(r) => {
                let ok = self.check_plain(&r.auth_bytes);
                self.authenticated |= ok;
                respond(ResponseBody::SaslAuthenticate(SaslAuthenticateResponse {
                    error_code: if ok {
                        KafkaCode::None
                    } else {
                        KafkaCode::SaslAuthenticationFailed
                    },
                    error_message: (!ok).then(|| "invalid credentials".to_string()),
                    auth_bytes: Bytes::new(),
                    session_lifetime_ms: 0,
                }))
            }
            RequestBody::Metadata(r) => {
                respond(ResponseBody::Metadata(self.shared.lock()?.metadata(&r, header.api_version)))
            }
            RequestBody::Produce(r) => {
                let (response, drop_response) = self.shared.lock()?.produce(broker, &r);
                self.shared.appended.notify_waiters();
                if r.acks == 0 {
                    return Ok(Outcome::Skip);
                }
                if drop_response {
                    return Ok(Outcome::Close);
                }
                respond(ResponseBody::Produce(response))
            }
            RequestBody::Fetch(r) => respond(ResponseBody::Fetch(self.fetch(&r).await?)),
            RequestBody::ListOffsets(r) => respond(ResponseBody::ListOffsets(self.shared.lock()?.list_offsets(broker, &r))),
            RequestBody::FindCoordinator(r) => {
                respond(ResponseBody::FindCoordinator(self.shared.lock()?.find_coordinator(&r)))
            }
            RequestBody::OffsetCommit(r) => {
                let mut state = self.shared.lock()?;
                if state.coordinator() != broker {
                    let mut response = protocol::offsets::OffsetCommitResponse::default();
                    for topic in &r.topics {
                        for p in &topic.partitions {
                            response.add_partition(&topic.name, p.partition_index, KafkaCode::NotCoordinator);
                        }
                    }
                    return respond(ResponseBody::OffsetCommit(response));
                }
                respond(ResponseBody::OffsetCommit(state.offset_commit(&r)))
            }
            RequestBody::OffsetFetch(r) => {
                let state = self.shared.lock()?;
                if state.coordinator() != broker {
                    return respond(ResponseBody::OffsetFetch(protocol::offsets::OffsetFetchResponse {
                        error_code: KafkaCode::NotCoordinator,
                        ..Default::default()
                    }));
                }
                respond(ResponseBody::OffsetFetch(state.offset_fetch(&r)))
            }
            RequestBody::JoinGroup(r) => {
                let reply = {
                    let mut state = self.shared.lock()?;
                    if state.coordinator() != broker {
                        Reply::Now(JoinGroupResponse {
                            error_code: KafkaCode::NotCoordinator,
                            generation_id: -1,
                            ..Default::default()
                        })
                    } else if let Some(code) = state.faults.join_errors.pop_front() {
                        Reply::Now(JoinGroupResponse {
                            error_code: code,
                            generation_id: -1,
                            member_id: r.member_id.clone(),
                            ..Default::default()
                        })
                    } else {
                        let group_id = r.group_id.clone();
                        state
                            .groups
                            .entry(group_id.clone())
                            .or_insert_with(|| Group::new(&group_id))
                            .join(r, &self.client_id, Instant::now())
                    }
                };
                let response = match reply {
                    Reply::Now(response) => response,
                    Reply::Later(rx) => rx.await.unwrap_or_else(|_| JoinGroupResponse {
                        error_code: KafkaCode::UnknownMemberId,
                        generation_id: -1,
                        ..Default::default()
                    }),
                };
                respond(ResponseBody::JoinGroup(response))
            }
            RequestBody::SyncGroup(r) => {
                let reply = {
                    let mut state = self.shared.lock()?;
                    let coordinator = state.coordinator();
                    match state.groups.get_mut(&r.group_id) {
                        _ if coordinator != broker => Reply::Now(sync_error(KafkaCode::NotCoordinator)),
                        None => Reply::Now(sync_error(KafkaCode::UnknownMemberId)),
                        Some(group) => group.sync(r, Instant::now()),
                    }
                };
                let response = match reply {
                    Reply::Now(response) => response,
                    Reply::Later(rx) => rx
                        .await
                        .unwrap_or_else(|_| sync_error(KafkaCode::RebalanceInProgress)),
                };
                respond(ResponseBody::SyncGroup(response))
            }
            RequestBody::Heartbeat(r) => {
                let mut state = self.shared.lock()?;
                if state.faults.stall_heartbeats {
                    return Ok(Outcome::Stall);
                }
                let coordinator = state.coordinator();
                let code = match state.groups.get_mut(&r.group_id) {
                    _ if coordinator != broker => KafkaCode::NotCoordinator,
                    None => KafkaCode::UnknownMemberId,
                    Some(group) => group.heartbeat(&r, Instant::now()),
                };
                respond(ResponseBody::Heartbeat(ErrorOnlyResponse::new(code)))
            }
            RequestBody::LeaveGroup(r) => {
                let mut state = self.shared.lock()?;
                let coordinator = state.coordinator();
                let code = match state.groups.get_mut(&r.group_id) {
                    _ if coordinator != broker => KafkaCode::NotCoordinator,
                    None => KafkaCode::UnknownMemberId,
                    Some(group) => group.leave(&r.member_id, Instant::now()),
                };
                respond(ResponseBody::LeaveGroup(ErrorOnlyResponse::new(code)))
            }
            RequestBody::DescribeGroups(r) => {
                respond(ResponseBody::DescribeGroups(self.shared.lock()?.describe_groups(&r)))
            }
            RequestBody::ListGroups(_) => respond(ResponseBody::ListGroups(self.shared.lock()?.list_groups())),
            RequestBody::InitProducerId(r) => {
                respond(ResponseBody::InitProducerId(self.shared.lock()?.init_producer_id(&r)?))
            }
            RequestBody::AddPartitionsToTxn(r) => {
                respond(ResponseBody::AddPartitionsToTxn(self.shared.lock()?.add_partitions_to_txn(&r)))
            }
            RequestBody::AddOffsetsToTxn(r) => {
                respond(ResponseBody::AddOffsetsToTxn(self.shared.lock()?.add_offsets_to_txn(&r)))
            }
            RequestBody::TxnOffsetCommit(r) => {
                respond(ResponseBody::TxnOffsetCommit(self.shared.lock()?.txn_offset_commit(&r)))
            }
            RequestBody::EndTxn(r) => {
                let response = self.shared.lock()?.end_txn(&r)?;
                self.shared.appended.notify_waiters();
                respond(ResponseBody::EndTxn(response))
            }
        }
    }

    /// Long-poll until `min_bytes` are available or `max_wait_ms` passes.
    async fn fetch(&self, request: &FetchRequest) -> Result<protocol::fetch::FetchResponse> {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        let min_bytes = usize::try_from(request.min_bytes).unwrap_or(0);
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (response, bytes) = self.shared.lock()?.fetch(self.broker, request);
            let has_errors = response
                .topics
                .iter()
                .flat_map(|t| t.partitions.iter())
                .any(|p| p.error_code != KafkaCode::None);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if bytes >= min_bytes || has_errors || remaining.is_zero() {
                return Ok(response);
            }
            if timeout(remaining, notified).await.is_err() {
                return Ok(self.shared.lock()?.fetch(self.broker, request).0);
            }
        }
    }
}

fn sync_error(code: KafkaCode) -> SyncGroupResponse {
    SyncGroupResponse {
        error_code: code,
        ..Default::default()
    }
}

/// Version ranges the mock answers, taken from the codec itself.
fn supported_versions() -> Vec<ApiVersionRange> {
    fn range<R: Request>() -> ApiVersionRange {
        ApiVersionRange {
            api_key: R::KEY,
            min_version: R::MIN_VERSION,
            max_version: R::MAX_VERSION,
        }
    }
    use protocol::{api_versions, fetch, groups, list_offsets, metadata, offsets, produce, sasl, txn};
    vec![
        range::<produce::ProduceRequest>(),
        range::<fetch::FetchRequest>(),
        range::<list_offsets::ListOffsetsRequest>(),
        range::<metadata::MetadataRequest>(),
        range::<offsets::OffsetCommitRequest>(),
        range::<offsets::OffsetFetchRequest>(),
        range::<groups::FindCoordinatorRequest>(),
        range::<groups::JoinGroupRequest>(),
        range::<groups::HeartbeatRequest>(),
        range::<groups::LeaveGroupRequest>(),
        range::<groups::SyncGroupRequest>(),
        range::<groups::DescribeGroupsRequest>(),
        range::<groups::ListGroupsRequest>(),
        range::<sasl::SaslHandshakeRequest>(),
        range::<api_versions::ApiVersionsRequest>(),
        range::<txn::InitProducerIdRequest>(),
        range::<txn::AddPartitionsToTxnRequest>(),
        range::<txn::AddOffsetsToTxnRequest>(),
        range::<txn::EndTxnRequest>(),
        range::<txn::TxnOffsetCommitRequest>(),
        range::<sasl::SaslAuthenticateRequest>(),
    ]
}
