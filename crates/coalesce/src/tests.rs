use std::time::Duration;

use coalesce_test as test;
use coalesce_test::ScriptedUpstream;
use futures::join;
use tokio::time;

use crate::{Coordinator, CoordinatorConfig, FetchOptions, GetError, is_rate_limit_message};

/// The lending pool rates the upstream in these tests hands out.
#[derive(Debug, Clone, PartialEq)]
struct Pools {
    sol: f64,
}

fn pools(sol: f64) -> Pools {
    Pools { sol }
}

fn coordinator(name: &str) -> Coordinator<&'static str, Pools, String> {
    let config = CoordinatorConfig {
        name: name.into(),
        ..Default::default()
    };
    Coordinator::new(config, |error: &String| is_rate_limit_message(error))
}

const RATE_LIMITED: &str = "429 Too Many Requests";

#[tokio::test]
async fn test_single_flight() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    // a single scripted result: a second upstream call would panic
    let upstream =
        ScriptedUpstream::new([Ok(pools(4.5))]).with_latency(Duration::from_millis(50));
    let options = FetchOptions::default();

    let (a, b, c) = join!(
        coordinator.get("pools", || upstream.fetch(), options),
        coordinator.get("pools", || upstream.fetch(), options),
        coordinator.get("pools", || upstream.fetch(), options),
    );

    assert_eq!(a.unwrap(), pools(4.5));
    assert_eq!(b.unwrap(), pools(4.5));
    assert_eq!(c.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_concurrent_callers_share_the_error() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([Err("account not found".to_string())])
        .with_latency(Duration::from_millis(50));
    let options = FetchOptions::default();

    let (a, b) = join!(
        coordinator.get("pools", || upstream.fetch(), options),
        coordinator.get("pools", || upstream.fetch(), options),
    );

    let expected = GetError::Upstream("account not found".to_string());
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);
    assert_eq!(upstream.calls(), 1);

    // a non-retryable failure does not open a backoff window, and the
    // settled flight does not linger: the next call computes again
    upstream.push(Ok(pools(4.5)));
    assert_eq!(coordinator.backoff_remaining(&"pools"), None);
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_freshness_and_expiry() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([Ok(pools(4.5)), Ok(pools(5.0))])
        .with_latency(Duration::from_millis(50));
    let options = FetchOptions::default();

    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 1);

    // well within the 15s TTL: served from cache without computing
    time::advance(Duration::from_secs(5)).await;
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 1);

    // past the TTL: the entry is stale and gets recomputed
    time::advance(Duration::from_secs(11)).await;
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(5.0));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_on_cold_key() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([Err(RATE_LIMITED.to_string())]);
    let options = FetchOptions::default();

    // nothing cached yet, so the retryable error propagates
    let error = coordinator
        .get("pools", || upstream.fetch(), options)
        .await
        .unwrap_err();
    assert_eq!(error, GetError::Upstream(RATE_LIMITED.to_string()));
    assert_eq!(coordinator.backoff_remaining(&"pools"), Some(Duration::from_secs(60)));

    // still inside the backoff window: fail fast, no upstream call
    time::advance(Duration::from_secs(1)).await;
    let error = coordinator
        .get("pools", || upstream.fetch(), options)
        .await
        .unwrap_err();
    assert_eq!(
        error,
        GetError::BackingOff {
            retry_after: Duration::from_secs(59),
        }
    );
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test]
async fn test_stale_serve_masks_rate_limits() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([
        Ok(pools(4.5)),
        Err(RATE_LIMITED.to_string()),
        Ok(pools(5.0)),
    ]);
    let options = FetchOptions::default();

    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));

    // recomputation fails with a rate limit, the stale value masks it
    time::advance(Duration::from_secs(16)).await;
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 2);
    assert!(coordinator.backoff_remaining(&"pools").is_some());

    // inside the backoff window the stale value is served without even
    // attempting the upstream
    time::advance(Duration::from_secs(1)).await;
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(upstream.calls(), 2);

    // once the window closes the upstream is tried again, and the success
    // resets the backoff state
    time::advance(Duration::from_secs(60)).await;
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(5.0));
    assert_eq!(upstream.calls(), 3);
    assert_eq!(coordinator.backoff_remaining(&"pools"), None);
}

#[tokio::test]
async fn test_stale_serve_can_be_disabled() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([
        Ok(pools(4.5)),
        Err(RATE_LIMITED.to_string()),
    ]);
    let options = FetchOptions {
        serve_stale: false,
        ..Default::default()
    };

    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));

    // with stale serving disabled the failure propagates even though a
    // previous value exists
    time::advance(Duration::from_secs(16)).await;
    let error = coordinator
        .get("pools", || upstream.fetch(), options)
        .await
        .unwrap_err();
    assert_eq!(error, GetError::Upstream(RATE_LIMITED.to_string()));

    // and so does the backoff rejection
    let error = coordinator
        .get("pools", || upstream.fetch(), options)
        .await
        .unwrap_err();
    assert!(matches!(error, GetError::BackingOff { .. }));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_panicking_computation_does_not_wedge_the_key() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let options = FetchOptions::default();

    let error = coordinator
        .get("pools", || async { panic!("upstream worker died") }, options)
        .await
        .unwrap_err();
    assert!(matches!(error, GetError::Aborted(_)));

    // the ticket was cleaned up and panics are not classified, so the next
    // call computes right away
    assert_eq!(coordinator.backoff_remaining(&"pools"), None);
    let upstream = ScriptedUpstream::new([Ok(pools(4.5))]);
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
}

#[tokio::test]
async fn test_invalidation_forces_recompute() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([Ok(pools(4.5)), Ok(pools(5.0))]);
    let options = FetchOptions::default();

    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));
    assert_eq!(coordinator.cached(&"pools"), Some(pools(4.5)));

    coordinator.invalidate(&"pools");
    assert_eq!(coordinator.cached(&"pools"), None);

    // the entry is gone, so even a fresh-looking key recomputes
    let value = coordinator.get("pools", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(5.0));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test]
async fn test_get_or_else_degrades_to_fallback() {
    test::setup();
    time::pause();

    let coordinator = coordinator("pools");
    let upstream = ScriptedUpstream::new([Err(RATE_LIMITED.to_string())]);
    let options = FetchOptions::default();
    let mock = pools(0.0);

    // cold key plus rate limit: the caller-supplied default takes over
    let value = coordinator
        .get_or_else("pools", || upstream.fetch(), options, || mock.clone())
        .await;
    assert_eq!(value.unwrap(), mock);

    // inside the backoff window the fallback also covers the fast rejection
    time::advance(Duration::from_secs(1)).await;
    let value = coordinator
        .get_or_else("pools", || upstream.fetch(), options, || mock.clone())
        .await;
    assert_eq!(value.unwrap(), mock);
    assert_eq!(upstream.calls(), 1);

    // non-retryable errors are not masked by the fallback
    let upstream = ScriptedUpstream::new([Err("account not found".to_string())]);
    let error = coordinator
        .get_or_else("positions", || upstream.fetch(), options, || mock.clone())
        .await
        .unwrap_err();
    assert_eq!(error, GetError::Upstream("account not found".to_string()));
}

#[tokio::test]
async fn test_coordinators_are_independent() {
    test::setup();
    time::pause();

    let pools_cache = coordinator("pools");
    let positions_cache = coordinator("positions");
    let options = FetchOptions::default();

    let upstream = ScriptedUpstream::new([Err(RATE_LIMITED.to_string())]);
    pools_cache
        .get("key", || upstream.fetch(), options)
        .await
        .unwrap_err();
    assert!(pools_cache.backoff_remaining(&"key").is_some());

    // the same key in another coordinator instance is unaffected
    assert!(positions_cache.backoff_remaining(&"key").is_none());
    let upstream = ScriptedUpstream::new([Ok(pools(4.5))]);
    let value = positions_cache.get("key", || upstream.fetch(), options).await;
    assert_eq!(value.unwrap(), pools(4.5));

    assert_eq!(format!("{pools_cache:?}"), "Coordinator { name: \"pools\", entries: 0, in-flight: 0 }");
}
