//! Client configuration.
//!
//! One [`Config`] drives every subsystem. Start from [`Config::default`], a
//! named profile, or the environment, adjust fields, and hand it to
//! [`Client::new`](crate::client::Client::new), which validates it:
//!
//! ```rust,no_run
//! use gregor::config::{Config, ConfigProfile};
//! use gregor::types::RequiredAcks;
//!
//! let mut config = Config::from_profile(ConfigProfile::HighThroughput);
//! config.client_id = "billing".to_string();
//! config.producer.required_acks = RequiredAcks::All;
//! config.validate().expect("valid config");
//! ```
//!
//! # Profiles
//!
//! | Profile | Flush | Fetch wait | Compression |
//! |---------|-------|------------|-------------|
//! | Default | every message | 500ms | none |
//! | LowLatency | every message | 100ms | none |
//! | HighThroughput | 1000 messages / 1 MB / 100ms | 500ms | lz4 |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::group::assignor::{self, BalanceStrategy};
use crate::metrics::{MetricsRegistry, PrometheusMetrics};
use crate::producer::partitioner::PartitionerFactory;
use crate::protocol::KafkaVersion;
use crate::protocol::records::Compression;
use crate::retry::Backoff;
use crate::sasl::{
    Authenticator, OAuthBearerAuthenticator, PlainAuthenticator, SaslMechanism,
    ScramAuthenticator, ScramHash, TokenProvider,
};
use crate::types::{IsolationLevel, RequiredAcks, StartOffset};

/// Named starting points for [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigProfile {
    #[default]
    Default,
    /// Small batches and short fetch waits.
    LowLatency,
    /// Large compressed batches.
    HighThroughput,
}

impl fmt::Display for ConfigProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigProfile::Default => write!(f, "default"),
            ConfigProfile::LowLatency => write!(f, "low-latency"),
            ConfigProfile::HighThroughput => write!(f, "high-throughput"),
        }
    }
}

impl FromStr for ConfigProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "default" => Ok(ConfigProfile::Default),
            "low-latency" | "latency" | "ll" => Ok(ConfigProfile::LowLatency),
            "high-throughput" | "throughput" | "ht" => Ok(ConfigProfile::HighThroughput),
            _ => Err(format!(
                "Unknown profile '{s}'. Valid profiles: default, low-latency, high-throughput"
            )),
        }
    }
}

// ============================================================================
// Net
// ============================================================================

#[derive(Clone)]
pub struct SaslConfig {
    pub enable: bool,
    pub mechanism: SaslMechanism,
    /// SaslHandshake version: 0 sends raw tokens, 1 wraps them in
    /// SaslAuthenticate.
    pub handshake_version: i16,
    pub user: String,
    pub password: String,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    /// Replaces the built-in mechanism, e.g. for GSSAPI.
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslConfig")
            .field("enable", &self.enable)
            .field("mechanism", &self.mechanism)
            .field("handshake_version", &self.handshake_version)
            .field("user", &self.user)
            .field("token_provider", &self.token_provider.is_some())
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for SaslConfig {
    fn default() -> Self {
        Self {
            enable: false,
            mechanism: SaslMechanism::Plain,
            handshake_version: 1,
            user: String::new(),
            password: String::new(),
            token_provider: None,
            authenticator: None,
        }
    }
}

impl SaslConfig {
    /// The authenticator every connection runs, or `None` when SASL is off.
    pub fn authenticator(&self) -> Result<Option<Arc<dyn Authenticator>>> {
        if !self.enable {
            return Ok(None);
        }
        if let Some(custom) = &self.authenticator {
            return Ok(Some(custom.clone()));
        }
        let auth: Arc<dyn Authenticator> = match self.mechanism {
            SaslMechanism::Plain => Arc::new(PlainAuthenticator::new(&self.user, &self.password)),
            SaslMechanism::ScramSha256 => Arc::new(ScramAuthenticator::new(
                ScramHash::Sha256,
                &self.user,
                &self.password,
            )),
            SaslMechanism::ScramSha512 => Arc::new(ScramAuthenticator::new(
                ScramHash::Sha512,
                &self.user,
                &self.password,
            )),
            SaslMechanism::OAuthBearer => {
                let provider = self.token_provider.clone().ok_or_else(|| {
                    Error::Config("OAUTHBEARER requires a token provider".to_string())
                })?;
                Arc::new(OAuthBearerAuthenticator::new(provider))
            }
            SaslMechanism::Gssapi => {
                return Err(Error::Config(
                    "GSSAPI requires a custom authenticator".to_string(),
                ));
            }
        };
        Ok(Some(auth))
    }
}

#[derive(Debug, Clone)]
pub struct NetConfig {
    /// In-flight requests per broker connection.
    pub max_open_requests: usize,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// TCP keep-alive; `None` disables it.
    pub keep_alive: Option<Duration>,
    /// Send ApiVersions on connect and negotiate request versions from it.
    pub api_versions_request: bool,
    pub sasl: SaslConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_open_requests: DEFAULT_MAX_OPEN_REQUESTS,
            dial_timeout: DEFAULT_NET_TIMEOUT,
            read_timeout: DEFAULT_NET_TIMEOUT,
            write_timeout: DEFAULT_NET_TIMEOUT,
            keep_alive: None,
            api_versions_request: true,
            sasl: SaslConfig::default(),
        }
    }
}

// ============================================================================
// Metadata
// ============================================================================

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub retry_max: u32,
    pub retry_backoff: Backoff,
    /// Background refresh interval; `None` disables the refresher.
    pub refresh_frequency: Option<Duration>,
    /// Refresh every topic instead of only the ones in use.
    pub full: bool,
    pub allow_auto_topic_creation: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            retry_max: DEFAULT_METADATA_RETRY_MAX,
            retry_backoff: Backoff::Constant(DEFAULT_METADATA_RETRY_BACKOFF),
            refresh_frequency: Some(DEFAULT_METADATA_REFRESH_FREQUENCY),
            full: true,
            allow_auto_topic_creation: true,
        }
    }
}

// ============================================================================
// Producer
// ============================================================================

/// When a pending partition batch is sent.
#[derive(Debug, Clone, Default)]
pub struct FlushConfig {
    /// Send once this many bytes are buffered; 0 disables the trigger.
    pub bytes: usize,
    /// Send once this many messages are buffered; 0 disables the trigger.
    pub messages: usize,
    /// Send pending messages after this long.
    pub frequency: Option<Duration>,
    /// Hard cap on messages per request; 0 means unlimited.
    pub max_messages: usize,
}

#[derive(Debug, Clone)]
pub struct ProducerRetryConfig {
    pub max: u32,
    pub backoff: Backoff,
}

impl Default for ProducerRetryConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_PRODUCER_RETRY_MAX,
            backoff: Backoff::Constant(DEFAULT_PRODUCER_RETRY_BACKOFF),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Setting an id turns on the transactional producer.
    pub id: Option<String>,
    pub timeout: Duration,
    pub retry_max: u32,
    pub retry_backoff: Backoff,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            id: None,
            timeout: Duration::from_secs(60),
            retry_max: 50,
            retry_backoff: Backoff::Constant(Duration::from_millis(100)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub max_message_bytes: usize,
    pub required_acks: RequiredAcks,
    /// Broker-side wait for acks, sent in every produce request.
    pub timeout: Duration,
    pub compression: Compression,
    pub compression_level: Option<i32>,
    pub partitioner: PartitionerFactory,
    pub return_successes: bool,
    pub return_errors: bool,
    pub flush: FlushConfig,
    pub retry: ProducerRetryConfig,
    pub idempotent: bool,
    pub transaction: TransactionConfig,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            required_acks: RequiredAcks::Leader,
            timeout: DEFAULT_PRODUCE_TIMEOUT,
            compression: Compression::None,
            compression_level: None,
            partitioner: PartitionerFactory::hash(),
            return_successes: false,
            return_errors: true,
            flush: FlushConfig::default(),
            retry: ProducerRetryConfig::default(),
            idempotent: false,
            transaction: TransactionConfig::default(),
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct FetchConfig {
    pub min: i32,
    /// Starting per-partition fetch size.
    pub default: i32,
    /// Upper bound for fetch size growth; 0 means the library ceiling.
    pub max: i32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_FETCH_MIN,
            default: DEFAULT_FETCH_DEFAULT,
            max: 0,
        }
    }
}

impl FetchConfig {
    /// The largest size a fetch may grow to.
    pub fn ceiling(&self) -> i32 {
        if self.max > 0 { self.max } else { FETCH_SIZE_CEILING }
    }
}

#[derive(Debug, Clone)]
pub struct OffsetsConfig {
    pub initial: StartOffset,
    pub auto_commit_enable: bool,
    pub auto_commit_interval: Duration,
    /// Sent as the commit retention; `None` uses the broker default.
    pub retention: Option<Duration>,
    pub retry_max: u32,
}

impl Default for OffsetsConfig {
    fn default() -> Self {
        Self {
            initial: StartOffset::Newest,
            auto_commit_enable: true,
            auto_commit_interval: DEFAULT_COMMIT_INTERVAL,
            retention: None,
            retry_max: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    pub timeout: Duration,
    pub strategy: Arc<dyn BalanceStrategy>,
    pub retry_max: u32,
    pub retry_backoff: Backoff,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REBALANCE_TIMEOUT,
            strategy: assignor::range(),
            retry_max: DEFAULT_REBALANCE_RETRY_MAX,
            retry_backoff: Backoff::Constant(DEFAULT_REBALANCE_RETRY_BACKOFF),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rebalance: RebalanceConfig,
    /// Opaque bytes announced with this member's subscription.
    pub member_user_data: Option<Bytes>,
    /// Static membership id (`group.instance.id`).
    pub instance_id: Option<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rebalance: RebalanceConfig::default(),
            member_user_data: None,
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub fetch: FetchConfig,
    pub max_wait_time: Duration,
    /// How long delivery may block before the fetch loop pauses the partition.
    pub max_processing_time: Duration,
    pub retry_backoff: Backoff,
    pub return_errors: bool,
    pub isolation_level: IsolationLevel,
    pub offsets: OffsetsConfig,
    pub group: GroupConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            max_processing_time: DEFAULT_MAX_PROCESSING_TIME,
            retry_backoff: Backoff::Constant(DEFAULT_CONSUMER_RETRY_BACKOFF),
            return_errors: false,
            isolation_level: IsolationLevel::ReadUncommitted,
            offsets: OffsetsConfig::default(),
            group: GroupConfig::default(),
        }
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub client_id: String,
    /// Highest broker release whose API versions the client may use.
    pub version: KafkaVersion,
    /// Capacity of producer ingress and consumer delivery channels.
    pub channel_buffer_size: usize,
    pub net: NetConfig,
    pub metadata: MetadataConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub metrics: Arc<dyn MetricsRegistry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            version: KafkaVersion::default(),
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            net: NetConfig::default(),
            metadata: MetadataConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            metrics: Arc::new(PrometheusMetrics::new()),
        }
    }
}

impl Config {
    pub fn from_profile(profile: ConfigProfile) -> Self {
        let mut config = Config::default();
        match profile {
            ConfigProfile::Default => {}
            ConfigProfile::LowLatency => {
                config.producer.flush = FlushConfig::default();
                config.consumer.max_wait_time = Duration::from_millis(100);
                config.consumer.fetch.min = 1;
                config.consumer.group.heartbeat_interval = Duration::from_secs(1);
                config.consumer.group.session_timeout = Duration::from_secs(6);
                config.producer.retry.backoff = Backoff::Constant(Duration::from_millis(20));
            }
            ConfigProfile::HighThroughput => {
                config.producer.flush = FlushConfig {
                    bytes: 1024 * 1024,
                    messages: 1000,
                    frequency: Some(Duration::from_millis(100)),
                    max_messages: 0,
                };
                config.producer.compression = Compression::Lz4;
                config.consumer.fetch.default = 8 * 1024 * 1024;
                config.consumer.fetch.min = 64 * 1024;
                config.channel_buffer_size = 4096;
            }
        }
        config
    }

    pub fn low_latency() -> Self {
        Self::from_profile(ConfigProfile::LowLatency)
    }

    pub fn high_throughput() -> Self {
        Self::from_profile(ConfigProfile::HighThroughput)
    }

    /// Check cross-field constraints, returning every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.client_id.is_empty() {
            errors.push("client_id must not be empty".to_string());
        }
        if self.channel_buffer_size == 0 {
            errors.push("channel_buffer_size must be at least 1".to_string());
        }

        // Net
        if self.net.max_open_requests == 0 {
            errors.push("net.max_open_requests must be at least 1".to_string());
        }
        for (name, timeout) in [
            ("net.dial_timeout", self.net.dial_timeout),
            ("net.read_timeout", self.net.read_timeout),
            ("net.write_timeout", self.net.write_timeout),
        ] {
            if timeout.is_zero() {
                errors.push(format!("{name} must be positive"));
            }
        }
        let sasl = &self.net.sasl;
        if sasl.enable {
            if !(0..=1).contains(&sasl.handshake_version) {
                errors.push(format!(
                    "net.sasl.handshake_version ({}) must be 0 or 1",
                    sasl.handshake_version
                ));
            }
            if let Err(e) = sasl.authenticator() {
                errors.push(e.to_string());
            }
            let needs_credentials = sasl.authenticator.is_none()
                && matches!(
                    sasl.mechanism,
                    SaslMechanism::Plain | SaslMechanism::ScramSha256 | SaslMechanism::ScramSha512
                );
            if needs_credentials && (sasl.user.is_empty() || sasl.password.is_empty()) {
                errors.push(format!(
                    "net.sasl.user and net.sasl.password are required for {}",
                    sasl.mechanism
                ));
            }
        }

        // Metadata
        if let Some(frequency) = self.metadata.refresh_frequency
            && frequency.is_zero()
        {
            errors.push("metadata.refresh_frequency must be positive when set".to_string());
        }

        // Producer
        let producer = &self.producer;
        if producer.max_message_bytes == 0 {
            errors.push("producer.max_message_bytes must be positive".to_string());
        }
        if producer.timeout.is_zero() {
            errors.push("producer.timeout must be positive".to_string());
        }
        if producer.flush.max_messages > 0 && producer.flush.max_messages < producer.flush.messages
        {
            errors.push(format!(
                "producer.flush.max_messages ({}) must be at least producer.flush.messages ({})",
                producer.flush.max_messages, producer.flush.messages
            ));
        }
        if let Some(level) = producer.compression_level
            && let Err(e) = producer.compression.validate_level(level)
        {
            errors.push(e.to_string());
        }
        if producer.idempotent {
            if !self.version.is_at_least(KafkaVersion::V0_11_0_0) {
                errors.push("idempotent producer requires version >= 0.11.0".to_string());
            }
            if self.net.max_open_requests != 1 {
                errors.push(format!(
                    "idempotent producer requires net.max_open_requests == 1 (got {})",
                    self.net.max_open_requests
                ));
            }
            if producer.required_acks != RequiredAcks::All {
                errors.push("idempotent producer requires required_acks == All".to_string());
            }
            if producer.retry.max == 0 {
                errors.push("idempotent producer requires producer.retry.max >= 1".to_string());
            }
        }
        if let Some(id) = &producer.transaction.id {
            if id.is_empty() {
                errors.push("producer.transaction.id must not be empty".to_string());
            }
            if !producer.idempotent {
                errors.push("transactional producer requires producer.idempotent".to_string());
            }
        }

        // Consumer
        let consumer = &self.consumer;
        if consumer.fetch.min <= 0 {
            errors.push("consumer.fetch.min must be positive".to_string());
        }
        if consumer.fetch.default <= 0 {
            errors.push("consumer.fetch.default must be positive".to_string());
        }
        if consumer.fetch.min > consumer.fetch.default {
            errors.push(format!(
                "consumer.fetch.min ({}) must not exceed consumer.fetch.default ({})",
                consumer.fetch.min, consumer.fetch.default
            ));
        }
        if consumer.fetch.max < 0 {
            errors.push("consumer.fetch.max must not be negative".to_string());
        }
        if consumer.fetch.max > 0 && consumer.fetch.default > consumer.fetch.max {
            errors.push(format!(
                "consumer.fetch.default ({}) must not exceed consumer.fetch.max ({})",
                consumer.fetch.default, consumer.fetch.max
            ));
        }
        if consumer.max_wait_time < Duration::from_millis(1) {
            errors.push("consumer.max_wait_time must be at least 1ms".to_string());
        }
        if consumer.max_processing_time.is_zero() {
            errors.push("consumer.max_processing_time must be positive".to_string());
        }
        if consumer.offsets.auto_commit_interval.is_zero() {
            errors.push("consumer.offsets.auto_commit_interval must be positive".to_string());
        }

        let group = &consumer.group;
        if group.session_timeout < Duration::from_millis(2) {
            errors.push("consumer.group.session_timeout must be at least 2ms".to_string());
        }
        if group.heartbeat_interval.is_zero() {
            errors.push("consumer.group.heartbeat_interval must be positive".to_string());
        }
        if group.heartbeat_interval >= group.session_timeout {
            errors.push(format!(
                "consumer.group.heartbeat_interval ({:?}) must be less than consumer.group.session_timeout ({:?})",
                group.heartbeat_interval, group.session_timeout
            ));
        }
        if group.rebalance.timeout < Duration::from_millis(2) {
            errors.push("consumer.group.rebalance.timeout must be at least 2ms".to_string());
        }
        if let Some(id) = &group.instance_id {
            if id.is_empty() {
                errors.push("consumer.group.instance_id must not be empty".to_string());
            } else if !self.version.is_at_least(KafkaVersion::V2_3_0_0) {
                errors.push("consumer.group.instance_id requires version >= 2.3.0".to_string());
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// [`validate`](Self::validate) folded into a single error.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| Error::Config(errors.join("; ")))
    }

    /// Overlay `GREGOR_*` environment variables onto a profile.
    ///
    /// Values that fail to parse keep the profile's setting.
    ///
    /// - `GREGOR_PROFILE`: `default`, `low-latency` or `high-throughput`
    /// - `GREGOR_CLIENT_ID`, `GREGOR_VERSION` (e.g. `2.1.0`)
    /// - `GREGOR_DIAL_TIMEOUT_MS`, `GREGOR_READ_TIMEOUT_MS`, `GREGOR_WRITE_TIMEOUT_MS`
    /// - `GREGOR_MAX_OPEN_REQUESTS`, `GREGOR_METADATA_REFRESH_MS`
    /// - `GREGOR_REQUIRED_ACKS` (`none`, `leader`, `all`), `GREGOR_PRODUCER_TIMEOUT_MS`
    /// - `GREGOR_COMPRESSION`, `GREGOR_COMPRESSION_LEVEL`
    /// - `GREGOR_FLUSH_MESSAGES`, `GREGOR_FLUSH_BYTES`, `GREGOR_FLUSH_FREQUENCY_MS`
    /// - `GREGOR_PRODUCER_RETRY_MAX`, `GREGOR_IDEMPOTENT`, `GREGOR_TRANSACTIONAL_ID`
    /// - `GREGOR_ISOLATION_LEVEL`, `GREGOR_INITIAL_OFFSET`
    /// - `GREGOR_SESSION_TIMEOUT_MS`, `GREGOR_HEARTBEAT_INTERVAL_MS`, `GREGOR_REBALANCE_STRATEGY`
    /// - `GREGOR_GROUP_INSTANCE_ID`
    /// - `GREGOR_SASL_ENABLE`, `GREGOR_SASL_MECHANISM`, `GREGOR_SASL_USER`, `GREGOR_SASL_PASSWORD`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.is_empty()) };
        fn parse<T: FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let raw = value?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "Ignoring unparsable configuration value");
                    None
                }
            }
        }
        let millis = |key: &str| parse::<u64>(key, parsed(key)).map(Duration::from_millis);

        let profile = parse::<ConfigProfile>("GREGOR_PROFILE", parsed("GREGOR_PROFILE"))
            .unwrap_or_default();
        let mut config = Config::from_profile(profile);

        if let Some(id) = parsed("GREGOR_CLIENT_ID") {
            config.client_id = id;
        }
        if let Some(v) = parse("GREGOR_VERSION", parsed("GREGOR_VERSION")) {
            config.version = v;
        }
        if let Some(d) = millis("GREGOR_DIAL_TIMEOUT_MS") {
            config.net.dial_timeout = d;
        }
        if let Some(d) = millis("GREGOR_READ_TIMEOUT_MS") {
            config.net.read_timeout = d;
        }
        if let Some(d) = millis("GREGOR_WRITE_TIMEOUT_MS") {
            config.net.write_timeout = d;
        }
        if let Some(n) = parse("GREGOR_MAX_OPEN_REQUESTS", parsed("GREGOR_MAX_OPEN_REQUESTS")) {
            config.net.max_open_requests = n;
        }
        if let Some(d) = millis("GREGOR_METADATA_REFRESH_MS") {
            config.metadata.refresh_frequency = (!d.is_zero()).then_some(d);
        }

        if let Some(acks) = parse("GREGOR_REQUIRED_ACKS", parsed("GREGOR_REQUIRED_ACKS")) {
            config.producer.required_acks = acks;
        }
        if let Some(d) = millis("GREGOR_PRODUCER_TIMEOUT_MS") {
            config.producer.timeout = d;
        }
        if let Some(c) = parse("GREGOR_COMPRESSION", parsed("GREGOR_COMPRESSION")) {
            config.producer.compression = c;
        }
        if let Some(level) = parse("GREGOR_COMPRESSION_LEVEL", parsed("GREGOR_COMPRESSION_LEVEL")) {
            config.producer.compression_level = Some(level);
        }
        if let Some(n) = parse("GREGOR_FLUSH_MESSAGES", parsed("GREGOR_FLUSH_MESSAGES")) {
            config.producer.flush.messages = n;
        }
        if let Some(n) = parse("GREGOR_FLUSH_BYTES", parsed("GREGOR_FLUSH_BYTES")) {
            config.producer.flush.bytes = n;
        }
        if let Some(d) = millis("GREGOR_FLUSH_FREQUENCY_MS") {
            config.producer.flush.frequency = (!d.is_zero()).then_some(d);
        }
        if let Some(n) = parse("GREGOR_PRODUCER_RETRY_MAX", parsed("GREGOR_PRODUCER_RETRY_MAX")) {
            config.producer.retry.max = n;
        }
        if let Some(idempotent) = parse::<bool>("GREGOR_IDEMPOTENT", parsed("GREGOR_IDEMPOTENT")) {
            config.producer.idempotent = idempotent;
            if idempotent {
                config.producer.required_acks = RequiredAcks::All;
                config.net.max_open_requests = 1;
            }
        }
        if let Some(id) = parsed("GREGOR_TRANSACTIONAL_ID") {
            config.producer.transaction.id = Some(id);
        }

        if let Some(level) = parse("GREGOR_ISOLATION_LEVEL", parsed("GREGOR_ISOLATION_LEVEL")) {
            config.consumer.isolation_level = level;
        }
        if let Some(initial) = parse("GREGOR_INITIAL_OFFSET", parsed("GREGOR_INITIAL_OFFSET")) {
            config.consumer.offsets.initial = initial;
        }
        if let Some(d) = millis("GREGOR_SESSION_TIMEOUT_MS") {
            config.consumer.group.session_timeout = d;
        }
        if let Some(d) = millis("GREGOR_HEARTBEAT_INTERVAL_MS") {
            config.consumer.group.heartbeat_interval = d;
        }
        if let Some(name) = parsed("GREGOR_REBALANCE_STRATEGY") {
            match assignor::by_name(&name) {
                Some(strategy) => config.consumer.group.rebalance.strategy = strategy,
                None => tracing::warn!(strategy = %name, "Ignoring unknown rebalance strategy"),
            }
        }
        if let Some(id) = parsed("GREGOR_GROUP_INSTANCE_ID") {
            config.consumer.group.instance_id = Some(id);
        }

        if let Some(enable) = parse("GREGOR_SASL_ENABLE", parsed("GREGOR_SASL_ENABLE")) {
            config.net.sasl.enable = enable;
        }
        if let Some(mechanism) = parse("GREGOR_SASL_MECHANISM", parsed("GREGOR_SASL_MECHANISM")) {
            config.net.sasl.mechanism = mechanism;
        }
        if let Some(user) = parsed("GREGOR_SASL_USER") {
            config.net.sasl.user = user;
        }
        if let Some(password) = parsed("GREGOR_SASL_PASSWORD") {
            config.net.sasl.password = password;
        }

        config
    }

    /// Make the producer idempotent along with the settings that requires.
    pub fn enable_idempotence(&mut self) -> &mut Self {
        self.producer.idempotent = true;
        self.producer.required_acks = RequiredAcks::All;
        self.net.max_open_requests = 1;
        if self.producer.retry.max == 0 {
            self.producer.retry.max = 1;
        }
        if !self.version.is_at_least(KafkaVersion::V0_11_0_0) {
            self.version = KafkaVersion::V0_11_0_0;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::low_latency().validate(), Ok(()));
        assert_eq!(Config::high_throughput().validate(), Ok(()));
    }

    #[test]
    fn test_heartbeat_must_be_below_session_timeout() {
        let mut config = Config::default();
        config.consumer.group.heartbeat_interval = config.consumer.group.session_timeout;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_interval")));
    }

    #[test]
    fn test_idempotent_requirements_all_reported() {
        let mut config = Config::default();
        config.producer.idempotent = true;
        config.producer.retry.max = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("max_open_requests")));
        assert!(errors.iter().any(|e| e.contains("required_acks")));
        assert!(errors.iter().any(|e| e.contains("retry.max")));

        config.enable_idempotence();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_transaction_requires_idempotence() {
        let mut config = Config::default();
        config.producer.transaction.id = Some("txn".to_string());
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("requires producer.idempotent")));
    }

    #[test]
    fn test_fetch_bounds() {
        let mut config = Config::default();
        config.consumer.fetch.min = 10;
        config.consumer.fetch.default = 5;
        config.consumer.fetch.max = 4;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
        assert_eq!(FetchConfig::default().ceiling(), FETCH_SIZE_CEILING);
    }

    #[test]
    fn test_sasl_requires_credentials() {
        let mut config = Config::default();
        config.net.sasl.enable = true;
        config.net.sasl.mechanism = SaslMechanism::ScramSha256;
        assert!(config.validate().is_err());
        config.net.sasl.user = "u".to_string();
        config.net.sasl.password = "p".to_string();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(
            config.net.sasl.authenticator().unwrap().unwrap().mechanism(),
            "SCRAM-SHA-256"
        );

        config.net.sasl.mechanism = SaslMechanism::Gssapi;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("GREGOR_PROFILE", "high-throughput"),
            ("GREGOR_CLIENT_ID", "svc"),
            ("GREGOR_VERSION", "2.3.0"),
            ("GREGOR_REQUIRED_ACKS", "all"),
            ("GREGOR_COMPRESSION", "zstd"),
            ("GREGOR_ISOLATION_LEVEL", "read_committed"),
            ("GREGOR_INITIAL_OFFSET", "oldest"),
            ("GREGOR_REBALANCE_STRATEGY", "roundrobin"),
            ("GREGOR_FLUSH_MESSAGES", "not-a-number"),
        ]));
        assert_eq!(config.client_id, "svc");
        assert_eq!(config.version, KafkaVersion::V2_3_0_0);
        assert_eq!(config.producer.required_acks, RequiredAcks::All);
        assert_eq!(config.producer.compression, Compression::Zstd);
        assert_eq!(config.consumer.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(config.consumer.offsets.initial, StartOffset::Oldest);
        assert_eq!(config.consumer.group.rebalance.strategy.name(), "roundrobin");
        // Unparsable values keep the profile setting.
        assert_eq!(config.producer.flush.messages, 1000);
    }

    #[test]
    fn test_from_lookup_idempotent_is_valid() {
        let config = Config::from_lookup(lookup(&[("GREGOR_IDEMPOTENT", "true")]));
        assert!(config.producer.idempotent);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!("ll".parse::<ConfigProfile>().unwrap(), ConfigProfile::LowLatency);
        assert!("fast".parse::<ConfigProfile>().is_err());
        assert_eq!(ConfigProfile::HighThroughput.to_string(), "high-throughput");
    }
}
