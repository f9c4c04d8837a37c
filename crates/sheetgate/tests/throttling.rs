mod common;

use common::{OBJECT, fixture, gate, gate_with, read};
use sheetgate::{GateConfig, GateError, OperationClass, RateLimitConfig};
use sheetgate_testkit::InMemorySheets;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn backend_throttling_is_retried_and_slows_the_limiter() {
    let sheets = fixture();
    let (gate, _) = gate(&sheets);
    sheets.throttle_next(1, None);

    gate.submit(read("Data!A1:B2")).await.unwrap();
    assert_eq!(sheets.calls_of("fetch_structure").len(), 2);
    assert_eq!(gate.requests_sent(), 3);

    let stats = gate.rate_limiter_stats();
    assert_eq!(stats.read.throttle_events, 1);
    assert_eq!(stats.read.throttle_multiplier, 0.5);
    assert_eq!(stats.read.effective_per_minute, 150.0);
    assert_eq!(stats.write.throttle_multiplier, 1.0);

    // Cool-down holds the reduced rate, then it ramps back linearly.
    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(gate.rate_limiter_stats().read.throttle_multiplier, 0.5);
    tokio::time::advance(Duration::from_secs(16)).await;
    let ramping = gate.rate_limiter_stats().read.throttle_multiplier;
    assert!(ramping > 0.7 && ramping < 0.8, "{ramping}");
    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(gate.rate_limiter_stats().read.throttle_multiplier, 1.0);
}

#[tokio::test(start_paused = true)]
async fn persistent_throttling_surfaces_after_the_last_attempt() {
    let sheets = fixture();
    let (gate, _) = gate(&sheets);
    sheets.throttle_next(10, Some(Duration::from_secs(1)));

    let err = gate.submit(read("Data!A1")).await.unwrap_err();
    assert_eq!(
        err,
        GateError::BackendThrottled {
            attempts: 4,
            retry_after: Some(Duration::from_secs(1)),
        }
    );
    assert!(err.is_retryable());
    assert_eq!(gate.rate_limiter_stats().read.throttle_events, 4);
}

#[tokio::test(start_paused = true)]
async fn exhausted_quota_times_out_instead_of_waiting_forever() {
    let sheets = fixture();
    let config = GateConfig {
        rate_limit: RateLimitConfig {
            reads_per_minute: 1,
            burst: 1,
            acquire_timeout_ms: 1_000,
            ..RateLimitConfig::default()
        },
        ..GateConfig::default()
    };
    let (gate, _) = gate_with(&sheets, config);

    // The structure fetch takes the only token; the read itself cannot get one.
    let err = gate.submit(read("Data!A1")).await.unwrap_err();
    match err {
        GateError::RateLimitTimeout { class, waited } => {
            assert_eq!(class, OperationClass::Read);
            assert!(waited >= Duration::from_secs(1));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(sheets.calls_of("batch_get").is_empty());
    assert_eq!(gate.rate_limiter_stats().read.timeouts, 1);

    // Writes draw from their own bucket.
    assert_eq!(gate.rate_limiter_stats().write.tokens_available, 1.0);
}

#[tokio::test(start_paused = true)]
async fn identical_calls_in_flight_share_one_request() {
    let sheets = InMemorySheets::with_latency(Duration::from_millis(100));
    sheets.insert(fixture().object(OBJECT).unwrap());
    let (gate, _) = gate_with(&sheets, GateConfig::default());

    let id = gate.begin(OBJECT).await.unwrap();
    gate.queue(id, read("Data!A1:B2")).unwrap();
    let (windowed, committed) = tokio::join!(gate.submit(read("Data!A1:B2")), gate.commit(id));

    let committed = committed.unwrap();
    assert_eq!(windowed.unwrap().values(), committed[0].values());
    assert_eq!(sheets.calls_of("fetch_structure").len(), 1);
    assert_eq!(sheets.calls_of("batch_get").len(), 1);
    assert!(gate.dedup_stats().coalesced >= 1);
}
