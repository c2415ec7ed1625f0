//! Rate-limited dispatcher behaviour under a paused clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pos_gateway::dispatcher::Dispatcher;
use pos_gateway::{ErrorCode, ExternalSystemType, IntegrationError, RateLimit};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

mod test_utils;
use test_utils::{ScriptedAdapter, build_gateway, subscribe, test_config};

const SYSTEM: ExternalSystemType = ExternalSystemType::Shopify;

async fn wait_for_depth(dispatcher: &Dispatcher, system: ExternalSystemType, depth: usize) {
    for _ in 0..1_000 {
        if dispatcher.queue_depth(system) == depth {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!(
        "queue depth never reached {depth}, stuck at {}",
        dispatcher.queue_depth(system)
    );
}

#[tokio::test(start_paused = true)]
async fn sustained_load_is_spread_over_the_rate_window() {
    let mut config = test_config();
    config.rate_limits.insert(SYSTEM, RateLimit::per_second(2));
    let tg = build_gateway(config, ScriptedAdapter::new(SYSTEM));
    let dispatcher = tg.gateway.dispatcher().clone();

    let started = Instant::now();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let dispatcher = dispatcher.clone();
        let calls = calls.clone();
        tasks.spawn(async move {
            dispatcher
                .dispatch(SYSTEM, None, 0, move || {
                    let calls = calls.clone();
                    async move {
                        calls.lock().unwrap().push(Instant::now());
                        Ok::<_, IntegrationError>(())
                    }
                })
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task").expect("call succeeds");
    }

    assert!(
        started.elapsed() >= Duration::from_millis(24_500),
        "drained 50 calls in {:?}",
        started.elapsed()
    );

    let mut times = calls.lock().unwrap().clone();
    times.sort();
    assert_eq!(times.len(), 50);
    for window in times.windows(3) {
        assert!(
            window[2] - window[0] >= Duration::from_secs(1),
            "three calls within one second: {:?}",
            window[2] - window[0]
        );
    }
    assert_eq!(dispatcher.queue_depth(SYSTEM), 0);
}

#[tokio::test(start_paused = true)]
async fn higher_priority_runs_first_and_ties_keep_arrival_order() {
    let tg = build_gateway(test_config(), ScriptedAdapter::new(SYSTEM));
    let dispatcher = tg.gateway.dispatcher().clone();
    dispatcher.pause(SYSTEM);
    assert!(dispatcher.is_paused(SYSTEM));

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks = JoinSet::new();
    let queued = [("low", 0), ("mid-a", 5), ("lowish", 1), ("urgent", 10), ("mid-b", 5)];
    for (depth, (label, priority)) in queued.into_iter().enumerate() {
        let dispatcher_for_task = dispatcher.clone();
        let order = order.clone();
        tasks.spawn(async move {
            dispatcher_for_task
                .dispatch(SYSTEM, None, priority, move || {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        Ok::<_, IntegrationError>(())
                    }
                })
                .await
        });
        wait_for_depth(&dispatcher, SYSTEM, depth + 1).await;
    }
    assert!(order.lock().unwrap().is_empty(), "paused queue dispatched");

    dispatcher.resume(SYSTEM);
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task").expect("call succeeds");
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec!["urgent", "mid-a", "mid-b", "lowish", "low"]
    );
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_are_retried_until_success() {
    let tg = build_gateway(test_config(), ScriptedAdapter::new(SYSTEM));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let value = tg
        .gateway
        .dispatch(SYSTEM, None, 0, move || {
            let counter = counter.clone();
            async move {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(IntegrationError::from_http_status(503, "unavailable", None))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("third attempt succeeds");

    assert_eq!(value, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_stop_at_max_attempts() {
    let config = test_config();
    let max_attempts = config.dispatcher.retry.max_attempts;
    let tg = build_gateway(config, ScriptedAdapter::new(SYSTEM));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let err = tg
        .gateway
        .dispatch(SYSTEM, None, 0, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IntegrationError::timeout("upstream read timed out"))
            }
        })
        .await
        .expect_err("every attempt fails");

    assert_eq!(err.code, ErrorCode::Timeout);
    assert_eq!(attempts.load(Ordering::SeqCst), max_attempts);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_resolves_on_first_attempt() {
    let tg = build_gateway(test_config(), ScriptedAdapter::new(SYSTEM));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let err = tg
        .gateway
        .dispatch(SYSTEM, None, 0, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(IntegrationError::from_http_status(422, "bad location", None))
            }
        })
        .await
        .expect_err("validation errors are final");

    assert_eq!(err.code, ErrorCode::ValidationError);
    assert!(!err.retryable);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disabled_integration_is_rejected_without_dispatch() {
    let tg = build_gateway(test_config(), ScriptedAdapter::new(SYSTEM));
    let tenant = Uuid::new_v4();
    subscribe(tg.records.as_ref(), tenant, SYSTEM).await.unwrap();
    tg.gateway
        .records()
        .set_subscription_active(tenant, SYSTEM, false, chrono::Utc::now())
        .await
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let err = tg
        .gateway
        .dispatch(SYSTEM, Some(tenant), 0, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, IntegrationError>(())
            }
        })
        .await
        .expect_err("inactive pair is rejected");

    assert_eq!(err.code, ErrorCode::IntegrationDisabled);
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
    assert_eq!(tg.gateway.queue_depth(SYSTEM), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_resolves_queued_calls() {
    let tg = build_gateway(test_config(), ScriptedAdapter::new(SYSTEM));
    let dispatcher = tg.gateway.dispatcher().clone();
    dispatcher.pause(SYSTEM);

    let queued = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .dispatch(SYSTEM, None, 0, || async { Ok::<_, IntegrationError>(()) })
                .await
        })
    };
    wait_for_depth(&dispatcher, SYSTEM, 1).await;

    tg.gateway.shutdown().await;

    let err = queued
        .await
        .expect("task")
        .expect_err("queued call is abandoned");
    assert_eq!(err.code, ErrorCode::QueueUnavailable);

    let late = tg
        .gateway
        .dispatch(SYSTEM, None, 0, || async { Ok::<_, IntegrationError>(()) })
        .await
        .expect_err("no dispatch after shutdown");
    assert_eq!(late.code, ErrorCode::QueueUnavailable);
}

#[tokio::test(start_paused = true)]
async fn rate_metrics_count_dispatched_calls() {
    let system = ExternalSystemType::Square;
    let tg = build_gateway(test_config(), ScriptedAdapter::new(system));

    for _ in 0..3 {
        tg.gateway
            .dispatch(system, None, 0, || async { Ok::<_, IntegrationError>(()) })
            .await
            .unwrap();
    }

    let metrics = tg.gateway.rate_metrics(system, None).await.unwrap();
    assert_eq!(metrics.system, system);
    assert_eq!(metrics.minute, 3);
    assert_eq!(metrics.consecutive_errors, 0);
    assert_eq!(metrics.last_error_at, None);
}
