//! Configuration loading tests.


use enginet::prelude::*;
use std::time::Duration;

fn config_with(values: &[(&str, i64)]) -> config::Config {
    let mut builder = config::Config::builder();
    for (key, value) in values {
        builder = builder.set_default(*key, *value).unwrap();
    }
    builder.build().unwrap()
}

#[test]
fn session_config_defaults_without_keys() {
    let config = config::Config::builder().build().unwrap();
    let session = SessionConfig::from_config(&config, "").unwrap();
    assert_eq!(session, SessionConfig::default());
    assert_eq!(session.handshake_timeout, None);
}

#[test]
fn session_config_prefers_namespaced_keys() {
    let config = config_with(&[
        ("max_in_buffer_capacity", 8192),
        ("server.max_in_buffer_capacity", 16384),
        ("handshake_timeout_ms", 250),
        ("server.handshake_loops_threshold", 50),
    ]);

    let server = SessionConfig::from_config(&config, "server").unwrap();
    assert_eq!(server.max_in_buffer_capacity, 16384);
    assert_eq!(server.handshake_loops_threshold, 50);
    assert_eq!(server.handshake_timeout, Some(Duration::from_millis(250)));

    let client = SessionConfig::from_config(&config, "client").unwrap();
    assert_eq!(client.max_in_buffer_capacity, 8192);
    assert_eq!(client.handshake_loops_threshold, 500);
}

#[test]
fn zero_handshake_timeout_disables_it() {
    let config = config_with(&[("handshake_timeout_ms", 0)]);
    let session = SessionConfig::from_config(&config, "").unwrap();
    assert_eq!(session.handshake_timeout, None);
}

#[test]
fn inconsistent_buffer_limits_are_rejected() {
    let config = config_with(&[
        ("min_in_buffer_capacity", 4096),
        ("max_in_buffer_capacity", 1024),
    ]);
    match SessionConfig::from_config(&config, "") {
        Err(Error::InvalidConfig { key, .. }) => assert_eq!(key, "max_in_buffer_capacity"),
        other => panic!("Expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn malformed_value_is_a_config_error() {
    let config = config::Config::builder()
        .set_default("optimize_copying", "sometimes")
        .unwrap()
        .build()
        .unwrap();
    assert!(matches!(
        SessionConfig::from_config(&config, ""),
        Err(Error::Config(_))
    ));
}

#[test]
fn loop_config_from_namespaced_keys() {
    let config = config_with(&[
        ("io.select_timeout_ms", 20),
        ("rebuild_threshold", 8),
    ]);
    let loop_config = LoopConfig::from_config(&config, "io").unwrap();
    assert_eq!(
        loop_config,
        LoopConfig {
            select_timeout: Duration::from_millis(20),
            rebuild_threshold: 8,
            poll_capacity: LoopConfig::default().poll_capacity,
        }
    );

    let bad = config_with(&[("poll_capacity", 0)]);
    assert!(matches!(
        LoopConfig::from_config(&bad, ""),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn named_loop_runs_with_config() {
    let config = config_with(&[("worker.select_timeout_ms", 10)]);
    let handle = SelectorLoop::new_named(&config, "worker")
        .unwrap()
        .start()
        .unwrap();
    assert_eq!(handle.name(), "worker");
    assert!(handle.execute(|| {}).wait().is_ok());
    handle.stop(StopKind::Quick);
    handle.join().unwrap();
}

#[cfg(feature = "tls")]
#[test]
fn tls_factory_reads_namespaced_settings() {
    let (config, _guard) = tls_test_helper::generate_test_tls_config_named("edge");

    let named = TlsEngineFactory::new_named(&config, "edge").unwrap();
    assert!(named.server_engine().is_ok());
    assert!(named.client_engine().is_ok());

    let unnamed = TlsEngineFactory::new(&config).unwrap();
    assert!(matches!(
        unnamed.server_engine(),
        Err(Error::TlsServerConfigMissing)
    ));
}
