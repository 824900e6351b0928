//! Resilience Patterns Demo
//!
//! Walks through the guard layer used by the photo pipeline:
//! - Call breaker opening, rejecting, probing and closing
//! - Admission gate pacing requests and inference weight
//! - Guard composing both, with metrics written through a sink
//!
//! Usage:
//!   RUST_LOG=foto_guard=debug cargo run --example resilience_patterns

use foto_guard::resilience::BucketKind;
use foto_guard::telemetry::LogMetricsSink;
use foto_guard::{
    BreakerConfig, BreakerOpen, CallBreaker, Error, GateConfig, Guard, MetricsSink,
    ResilienceRegistry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum VisionError {
    Overloaded,
    Rejected(BreakerOpen),
    Guard(Error),
}

impl From<BreakerOpen> for VisionError {
    fn from(e: BreakerOpen) -> Self {
        VisionError::Rejected(e)
    }
}

impl From<Error> for VisionError {
    fn from(e: Error) -> Self {
        VisionError::Guard(e)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    println!("=== foto-guard Resilience Patterns Demo ===\n");

    demo_call_breaker().await;
    demo_admission_gate().await?;
    demo_guarded_pipeline().await?;
    Ok(())
}

async fn demo_call_breaker() {
    println!("--- Example 1: Call Breaker ---\n");

    let breaker = CallBreaker::new(
        "openai",
        BreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(1)
            .with_base_timeout(Duration::from_millis(200))
            .with_max_timeout(Duration::from_secs(2)),
    );

    for i in 1..=5 {
        let r: Result<(), VisionError> = breaker.call(|| async { Err(VisionError::Overloaded) }).await;
        match r {
            Err(VisionError::Rejected(open)) => {
                println!("Request {}: rejected, retry in {:?}", i, open.retry_after)
            }
            Err(e) => println!("Request {}: failed ({:?}), state {}", i, e, breaker.state()),
            Ok(()) => unreachable!(),
        }
    }

    tokio::time::sleep(breaker.current_timeout()).await;
    let r: Result<&str, VisionError> = breaker.call(|| async { Ok("recovered") }).await;
    println!("After the open window: {:?}, state {}\n", r, breaker.state());
}

async fn demo_admission_gate() -> anyhow::Result<()> {
    println!("--- Example 2: Admission Gate ---\n");

    let gate = foto_guard::AdmissionGate::new(
        "gpt-4o",
        GateConfig::new()
            .with_requests_per_minute(120)
            .with_weight_units_per_minute(6_000)
            .with_max_concurrent_requests(2),
    );

    // Leave two request tokens so the third call has to wait for refill
    gate.try_consume(BucketKind::Requests, 118.0).await;
    for i in 1..=4 {
        let start = Instant::now();
        let permit = gate.acquire(200).await?;
        println!(
            "Request {}: admitted after {:?} (bucket wait {:?})",
            i,
            start.elapsed(),
            permit.waited()
        );
    }

    let stats = gate.stats().await;
    println!(
        "\nthrottled {} of {} requests, avg wait {:.0}ms\n",
        stats.requests_throttled,
        stats.total_requests,
        stats.avg_wait_ms()
    );
    Ok(())
}

async fn demo_guarded_pipeline() -> anyhow::Result<()> {
    println!("--- Example 3: Guarded Pipeline ---\n");

    let registry = Arc::new(ResilienceRegistry::new());
    registry.register_breaker(
        "openai",
        BreakerConfig::new()
            .with_failure_threshold(2)
            .with_base_timeout(Duration::from_secs(30)),
    )?;
    let guard = Guard::new(Arc::clone(&registry));

    for i in 1..=6 {
        let r: Result<String, VisionError> = guard
            .run("gpt-4o-mini", "openai", 1_500, || async move {
                if i % 3 == 0 {
                    Err(VisionError::Overloaded)
                } else {
                    Ok(format!("photo-{}: portrait, outdoor", i))
                }
            })
            .await;
        match r {
            Ok(tags) => println!("Request {}: {}", i, tags),
            Err(e) => println!("Request {}: {:?}", i, e),
        }
    }

    println!();
    let snapshot = registry.snapshot().await;
    LogMetricsSink::default().record(&snapshot).await?;
    println!("{}", snapshot.to_json_pretty()?);
    Ok(())
}
