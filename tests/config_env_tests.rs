//! Integration tests for `Config::from_env()`.
//!
//! Environment variables are process-global, so every test here runs
//! serially and removes what it set before returning.

use std::time::Duration;

use serial_test::serial;

use gregor::config::Config;
use gregor::protocol::records::Compression;
use gregor::sasl::SaslMechanism;
use gregor::types::{IsolationLevel, RequiredAcks, StartOffset};

/// Run `f` with `vars` set, removing them afterwards.
fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
    for (key, value) in vars {
        // SAFETY: tests in this file are serialized with #[serial].
        unsafe { std::env::set_var(key, value) };
    }
    let result = f();
    for (key, _) in vars {
        // SAFETY: as above.
        unsafe { std::env::remove_var(key) };
    }
    result
}

// ============================================================================
// Defaults
// ============================================================================

#[test]
#[serial]
fn test_no_variables_gives_default_profile() {
    let config = with_env(&[], Config::from_env);
    let default = Config::default();
    assert_eq!(config.client_id, default.client_id);
    assert_eq!(config.producer.required_acks, default.producer.required_acks);
    assert_eq!(config.consumer.group.session_timeout, default.consumer.group.session_timeout);
    assert_eq!(config.validate(), Ok(()));
}

// ============================================================================
// Producer settings
// ============================================================================

#[test]
#[serial]
fn test_producer_variables() {
    let config = with_env(
        &[
            ("GREGOR_CLIENT_ID", "billing"),
            ("GREGOR_REQUIRED_ACKS", "none"),
            ("GREGOR_COMPRESSION", "zstd"),
            ("GREGOR_FLUSH_MESSAGES", "50"),
            ("GREGOR_FLUSH_FREQUENCY_MS", "25"),
        ],
        Config::from_env,
    );
    assert_eq!(config.client_id, "billing");
    assert_eq!(config.producer.required_acks, RequiredAcks::None);
    assert_eq!(config.producer.compression, Compression::Zstd);
    assert_eq!(config.producer.flush.messages, 50);
    assert_eq!(config.producer.flush.frequency, Some(Duration::from_millis(25)));
}

#[test]
#[serial]
fn test_idempotent_variable_implies_its_requirements() {
    let config = with_env(&[("GREGOR_IDEMPOTENT", "true")], Config::from_env);
    assert!(config.producer.idempotent);
    assert_eq!(config.producer.required_acks, RequiredAcks::All);
    assert_eq!(config.net.max_open_requests, 1);
    assert_eq!(config.validate(), Ok(()));
}

#[test]
#[serial]
fn test_unparsable_value_keeps_profile_setting() {
    let config = with_env(
        &[("GREGOR_FLUSH_MESSAGES", "lots"), ("GREGOR_REQUIRED_ACKS", "maybe")],
        Config::from_env,
    );
    let default = Config::default();
    assert_eq!(config.producer.flush.messages, default.producer.flush.messages);
    assert_eq!(config.producer.required_acks, default.producer.required_acks);
}

// ============================================================================
// Consumer and SASL settings
// ============================================================================

#[test]
#[serial]
fn test_consumer_variables() {
    let config = with_env(
        &[
            ("GREGOR_ISOLATION_LEVEL", "read-committed"),
            ("GREGOR_INITIAL_OFFSET", "oldest"),
            ("GREGOR_SESSION_TIMEOUT_MS", "30000"),
            ("GREGOR_HEARTBEAT_INTERVAL_MS", "2000"),
            ("GREGOR_REBALANCE_STRATEGY", "roundrobin"),
        ],
        Config::from_env,
    );
    assert_eq!(config.consumer.isolation_level, IsolationLevel::ReadCommitted);
    assert_eq!(config.consumer.offsets.initial, StartOffset::Oldest);
    assert_eq!(config.consumer.group.session_timeout, Duration::from_secs(30));
    assert_eq!(config.consumer.group.heartbeat_interval, Duration::from_secs(2));
    assert_eq!(config.consumer.group.rebalance.strategy.name(), "roundrobin");
}

#[test]
#[serial]
fn test_sasl_variables() {
    let config = with_env(
        &[
            ("GREGOR_SASL_ENABLE", "true"),
            ("GREGOR_SASL_MECHANISM", "SCRAM-SHA-512"),
            ("GREGOR_SASL_USER", "svc"),
            ("GREGOR_SASL_PASSWORD", "hunter2"),
        ],
        Config::from_env,
    );
    assert!(config.net.sasl.enable);
    assert_eq!(config.net.sasl.mechanism, SaslMechanism::ScramSha512);
    assert_eq!(config.net.sasl.user, "svc");
    assert_eq!(config.validate(), Ok(()));
}
