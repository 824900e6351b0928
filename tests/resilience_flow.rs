use foto_guard::resilience::BucketKind;
use foto_guard::{
    BreakerConfig, BreakerOpen, BreakerState, CallBreaker, Error, GateConfig, Guard,
    GuardSettings, ResilienceRegistry,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Caller-side error type for the analyze-then-upload workflow.
#[derive(Debug)]
enum PipelineError {
    Vision(String),
    Upload(u16),
    Unavailable(BreakerOpen),
    Guard(Error),
}

impl From<BreakerOpen> for PipelineError {
    fn from(e: BreakerOpen) -> Self {
        PipelineError::Unavailable(e)
    }
}

impl From<Error> for PipelineError {
    fn from(e: Error) -> Self {
        PipelineError::Guard(e)
    }
}

fn scenario_breaker() -> CallBreaker {
    CallBreaker::new(
        "openai",
        BreakerConfig::new()
            .with_failure_threshold(3)
            .with_base_timeout(Duration::from_secs(2))
            .with_max_timeout(Duration::from_secs(10)),
    )
}

#[tokio::test(start_paused = true)]
async fn test_breaker_fails_fast_after_threshold() {
    let breaker = scenario_breaker();
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let r: Result<(), PipelineError> = breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Vision("model overloaded".into()))
            })
            .await;
        assert!(matches!(r, Err(PipelineError::Vision(_))));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    tokio::time::advance(Duration::from_secs(1)).await;
    let r: Result<(), PipelineError> = breaker
        .call(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    match r {
        Err(PipelineError::Unavailable(open)) => {
            assert_eq!(open.name, "openai");
            assert_eq!(open.state, BreakerState::Open);
            assert_eq!(open.retry_after, Duration::from_secs(3));
        }
        other => panic!("expected breaker rejection, got {:?}", other),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovery_and_reopen() {
    // Recovery path: past the 4s window, successes close it again
    let breaker = scenario_breaker();
    for _ in 0..3 {
        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::Upload(503)) })
            .await;
    }
    assert_eq!(breaker.current_timeout(), Duration::from_secs(4));
    tokio::time::advance(Duration::from_millis(4_100)).await;
    for _ in 0..3 {
        let r: Result<u32, PipelineError> = breaker.call(|| async { Ok(201) }).await;
        assert_eq!(r.unwrap(), 201);
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.current_timeout(), Duration::from_secs(2));

    // Reopen path: a failing probe doubles the window to 8s
    let breaker = scenario_breaker();
    for _ in 0..3 {
        let _ = breaker
            .call(|| async { Err::<(), _>(PipelineError::Upload(503)) })
            .await;
    }
    tokio::time::advance(Duration::from_millis(4_100)).await;
    let r: Result<(), PipelineError> = breaker
        .call(|| async { Err(PipelineError::Upload(502)) })
        .await;
    assert!(matches!(r, Err(PipelineError::Upload(502))));
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(breaker.current_timeout(), Duration::from_secs(8));
}

#[tokio::test(start_paused = true)]
async fn test_drained_gate_waits_about_one_second() {
    let reg = ResilienceRegistry::new();
    let gate = reg
        .register_gate(
            "gpt-4o",
            GateConfig::new()
                .with_requests_per_minute(60)
                .with_weight_units_per_minute(6_000)
                .with_max_concurrent_requests(10),
        )
        .unwrap();
    assert!(gate.try_consume(BucketKind::Requests, 60.0).await);

    let start = Instant::now();
    let ran_at: Result<Instant, Error> = gate.run(100, || async { Ok(Instant::now()) }).await;
    let waited = ran_at.unwrap() - start;
    assert!(waited >= Duration::from_secs(1), "waited {:?}", waited);
    assert!(waited < Duration::from_millis(1_100), "waited {:?}", waited);

    let stats = gate.stats().await;
    assert_eq!(stats.requests_throttled, 1);
    assert!((stats.throttle_rate() - 1.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_guarded_workflow_isolates_services() {
    let settings = GuardSettings::from_yaml_str(
        r#"
breakers:
  openai:
    failure_threshold: 2
    base_timeout_secs: 30
  microsoft_graph:
    failure_threshold: 2
"#,
    )
    .unwrap();
    let guard = Guard::new(Arc::new(ResilienceRegistry::from_settings(settings).unwrap()));

    // Upload service keeps failing
    for _ in 0..2 {
        let r: Result<(), PipelineError> = guard
            .run("sharepoint", "microsoft_graph", 1, || async {
                Err(PipelineError::Upload(500))
            })
            .await;
        assert!(matches!(r, Err(PipelineError::Upload(500))));
    }
    let r: Result<(), PipelineError> = guard
        .run("sharepoint", "microsoft_graph", 1, || async { Ok(()) })
        .await;
    assert!(matches!(r, Err(PipelineError::Unavailable(_))));

    // Vision service is unaffected
    let tags: Result<Vec<&str>, PipelineError> = guard
        .run("gpt-4o-mini", "openai", 2_000, || async {
            Ok(vec!["portrait", "studio"])
        })
        .await;
    assert_eq!(tags.unwrap(), vec!["portrait", "studio"]);

    let snap = guard.registry().snapshot().await;
    assert_eq!(snap.tripped_breakers(), vec!["microsoft_graph"]);
    let mini = snap.gate("gpt-4o-mini").unwrap();
    assert_eq!(mini.weight_units_per_minute, 200_000);
    assert_eq!(mini.total_weight_consumed, 2_000);

    guard.registry().reset_breakers();
    let r: Result<(), PipelineError> = guard
        .run("sharepoint", "microsoft_graph", 1, || async { Ok(()) })
        .await;
    assert!(r.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_uploads_respect_slot_limit() {
    let reg = Arc::new(ResilienceRegistry::new());
    reg.register_gate(
        "sharepoint",
        GateConfig::new().with_max_concurrent_requests(3),
    )
    .unwrap();
    let guard = Guard::new(Arc::clone(&reg));
    let running = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for i in 0..12u16 {
        let guard = guard.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            guard
                .run("sharepoint", "microsoft_graph", 1, || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<u16, PipelineError>(i)
                })
                .await
        }));
    }
    for t in tasks {
        assert!(t.await.unwrap().is_ok());
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(
        reg.gate("sharepoint").unwrap().stats().await.slots_available,
        3
    );
}
