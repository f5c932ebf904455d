use inc_collectives::distributed::{Algorithm, AlgorithmTable, OpCode};
use inc_collectives::utils::config::{BackendChoice, CollectiveConfig, SwitchConfig};
use inc_collectives::utils::error::CollectiveError;
use inc_collectives::utils::logging::{self, LogFormat};
use inc_collectives::utils::retry::{retry_with_backoff, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[tokio::test]
async fn test_retry_integration() {
    let policy = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(10),
        ..Default::default()
    };

    let result = retry_with_backoff(|| async {
        Ok::<_, CollectiveError>("Success")
    }, &policy).await;

    assert_eq!(result.unwrap(), "Success");
}

#[tokio::test]
async fn test_retry_recovers_from_refused_connections() {
    let policy = RetryPolicy {
        max_retries: 3,
        initial_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let attempts = AtomicU32::new(0);
    let counter = &attempts;

    let result = retry_with_backoff(move || async move {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(CollectiveError::Connectivity { rank: 1, reason: "connection refused".to_string() })
        } else {
            Ok(7)
        }
    }, &policy).await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_config_file_round_trip_drives_algorithm_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("collectives.json");

    let config = CollectiveConfig {
        backend: BackendChoice::Cpu,
        small_message_threshold_bytes: 1024,
        switch: Some(SwitchConfig {
            address: "127.0.0.1:30000".to_string(),
            timeout_ms: 250,
            quantize: true,
        }),
        log_format: LogFormat::Compact,
        ..Default::default()
    };
    config.save(&path).unwrap();

    let loaded = CollectiveConfig::from_file(&path).unwrap();
    assert_eq!(loaded.backend, BackendChoice::Cpu);
    assert_eq!(loaded.switch, config.switch);
    assert_eq!(loaded.small_message_threshold_bytes, 1024);

    let table = AlgorithmTable::from_config(&loaded);
    assert_eq!(table.select(OpCode::AllReduce, 4096), Algorithm::InNetwork);
    assert_eq!(table.select(OpCode::ReduceScatter, 512), Algorithm::RecursiveHalving);
    assert_eq!(table.select(OpCode::ReduceScatter, 4096), Algorithm::Ring);
}

#[test]
fn test_partial_config_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.json");
    std::fs::write(&path, r#"{ "worker_threads": 3 }"#).unwrap();

    let loaded = CollectiveConfig::from_file(&path).unwrap();
    assert_eq!(loaded.worker_threads, 3);
    assert_eq!(loaded.default_timeout(), CollectiveConfig::default().default_timeout());
    assert!(loaded.switch.is_none());
    loaded.validate().unwrap();
}

#[test]
fn test_logging_init_is_idempotent() {
    logging::init_logging_with_format(LogFormat::Json);
    logging::init_logging();
}
