use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use plume_common::{AiRequest, CallerContext, PoolConfig};
use plume_pool::{CountingPrivacyRouter, Executor, PoolError, PrivacyRouter, Reporter, WorkerPool};
use serde_json::Value;
use tokio_stream::StreamExt;

/// Scripted executor: the first message's content is a directive.
///
/// - `echo:<text>`        respond with `<text>`
/// - `sleep:<ms>`         sleep, then respond
/// - `fail:<msg>`         report an execution error
/// - `panic-after:<ms>`   sleep, then panic (simulated context crash)
/// - `provider-echo`      reflect the dispatched provider into the response
/// - `progress`           emit two progress frames, then respond
/// - `malformed`          respond with a non-object payload
struct Scripted;

fn directive(request: &AiRequest) -> String {
    request
        .messages
        .as_ref()
        .and_then(|m| m.first())
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

impl Executor for Scripted {
    fn execute(&self, request: AiRequest, reporter: &Reporter) -> Result<Value, String> {
        let directive = directive(&request);
        if let Some(text) = directive.strip_prefix("echo:") {
            return Ok(serde_json::json!({"content": text, "success": true}));
        }
        if let Some(ms) = directive.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap();
            std::thread::sleep(Duration::from_millis(ms));
            return Ok(serde_json::json!({"content": "slept", "success": true}));
        }
        if let Some(msg) = directive.strip_prefix("fail:") {
            return Err(msg.to_string());
        }
        if let Some(ms) = directive.strip_prefix("panic-after:") {
            let ms: u64 = ms.parse().unwrap();
            std::thread::sleep(Duration::from_millis(ms));
            panic!("scripted crash");
        }
        if directive == "provider-echo" {
            return Ok(serde_json::json!({
                "content": "routed",
                "provider": request.provider,
            }));
        }
        if directive == "malformed" {
            return Ok(serde_json::json!("just a string"));
        }
        if directive == "progress" {
            reporter.progress(serde_json::json!({"stage": "drafting"}));
            reporter.progress(serde_json::json!({"stage": "polishing"}));
            return Ok(serde_json::json!({"content": "done"}));
        }
        Ok(serde_json::json!({"content": "ok"}))
    }
}

fn req(directive: &str) -> AiRequest {
    AiRequest::new("test").with_prompt("user", directive)
}

fn pool_config(num_workers: usize, timeout_ms: u64) -> PoolConfig {
    PoolConfig {
        num_workers,
        request_timeout_ms: timeout_ms,
        ..Default::default()
    }
}

#[tokio::test]
async fn five_requests_round_robin_over_two_workers() {
    let pool = WorkerPool::new(pool_config(2, 10_000), Arc::new(Scripted), None).unwrap();

    let mut indices = Vec::new();
    for _ in 0..5 {
        let resp = pool.process_request(&req("echo:hi"), None).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.content.as_deref(), Some("hi"));
        indices.push(resp.metadata.worker_index);
    }
    assert_eq!(indices, vec![0, 1, 0, 1, 0]);

    pool.shutdown().await;
}

#[tokio::test]
async fn round_robin_is_fair_over_full_cycles() {
    let pool = WorkerPool::new(pool_config(3, 10_000), Arc::new(Scripted), None).unwrap();

    let mut counts = [0usize; 3];
    for _ in 0..9 {
        let resp = pool.process_request(&req("echo:x"), None).await.unwrap();
        counts[resp.metadata.worker_index] += 1;
    }
    assert_eq!(counts, [3, 3, 3]);

    pool.shutdown().await;
}

#[tokio::test]
async fn mute_context_rejects_with_timeout_and_pool_recovers() {
    let pool = WorkerPool::new(pool_config(1, 50), Arc::new(Scripted), None).unwrap();

    let started = Instant::now();
    let err = pool
        .process_request(&req("sleep:400"), None)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(matches!(err, PoolError::Timeout { timeout_ms: 50, .. }), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(45), "rejected too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "rejected too late: {elapsed:?}");

    // The late response for the timed-out request is dropped silently and
    // the pool keeps serving.
    let resp = pool.process_request(&req("echo:after"), None).await.unwrap();
    assert_eq!(resp.content.as_deref(), Some("after"));

    pool.shutdown().await;
}

#[tokio::test]
async fn executor_error_is_surfaced_to_the_caller() {
    let pool = WorkerPool::new(pool_config(1, 10_000), Arc::new(Scripted), None).unwrap();

    let err = pool
        .process_request(&req("fail:quota exhausted"), None)
        .await
        .unwrap_err();
    match err {
        PoolError::Execution(msg) => assert!(msg.contains("quota exhausted")),
        other => panic!("expected execution error, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test(flavor = "current_thread")]
async fn crashed_context_rejects_only_its_own_requests() {
    let pool = WorkerPool::new(pool_config(2, 10_000), Arc::new(Scripted), None).unwrap();

    // Dispatch order is deterministic: worker 0, worker 1, worker 0.
    let p0 = pool.clone();
    let h0 = tokio::spawn(async move { p0.process_request(&req("panic-after:100"), None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let p1 = pool.clone();
    let h1 = tokio::spawn(async move { p1.process_request(&req("sleep:300"), None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let p2 = pool.clone();
    let h2 = tokio::spawn(async move { p2.process_request(&req("sleep:300"), None).await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Worker 0 crashes while owning requests 0 and 2.
    match h0.await.unwrap() {
        Err(PoolError::WorkerFailed { index, .. }) => assert_eq!(index, 0),
        other => panic!("expected context failure, got {other:?}"),
    }
    match h2.await.unwrap() {
        Err(PoolError::WorkerFailed { index, .. }) => assert_eq!(index, 0),
        other => panic!("expected context failure, got {other:?}"),
    }

    // Worker 1 is untouched.
    let resp = h1.await.unwrap().unwrap();
    assert_eq!(resp.content.as_deref(), Some("slept"));
    assert_eq!(resp.metadata.worker_index, 1);

    // Replacement happened at the same index; the pool keeps accepting
    // requests and its size is unchanged.
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.workers[0].generation, 1);
    assert_eq!(snapshot.workers[1].generation, 0);
    let resp = pool.process_request(&req("echo:alive"), None).await.unwrap();
    assert_eq!(resp.content.as_deref(), Some("alive"));

    pool.shutdown().await;
}

struct FixedRouter(&'static str);

#[async_trait]
impl PrivacyRouter for FixedRouter {
    async fn provider_for(&self, _identity: &str) -> anyhow::Result<String> {
        Ok(self.0.to_string())
    }
}

struct FailingRouter;

#[async_trait]
impl PrivacyRouter for FailingRouter {
    async fn provider_for(&self, _identity: &str) -> anyhow::Result<String> {
        anyhow::bail!("privacy backend unavailable")
    }
}

fn caller(user: &str) -> CallerContext {
    CallerContext {
        user_id: Some(user.to_string()),
        session_id: None,
    }
}

#[tokio::test]
async fn privacy_mode_substitutes_the_provider() {
    let pool = WorkerPool::new(
        pool_config(1, 10_000),
        Arc::new(Scripted),
        Some(Arc::new(FixedRouter("sealed-llm"))),
    )
    .unwrap();

    let mut request = req("provider-echo").with_provider("openai");
    request.use_privacy_mode = true;

    let resp = pool
        .process_request(&request, Some(&caller("u1")))
        .await
        .unwrap();
    assert_eq!(resp.metadata.provider.as_deref(), Some("sealed-llm"));
    // The caller's own request is untouched.
    assert_eq!(request.provider.as_deref(), Some("openai"));

    pool.shutdown().await;
}

#[tokio::test]
async fn privacy_lookup_failure_keeps_the_original_provider() {
    let pool = WorkerPool::new(
        pool_config(1, 10_000),
        Arc::new(Scripted),
        Some(Arc::new(FailingRouter)),
    )
    .unwrap();

    let mut request = req("provider-echo").with_provider("openai");
    request.use_privacy_mode = true;

    let resp = pool
        .process_request(&request, Some(&caller("u1")))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.metadata.provider.as_deref(), Some("openai"));

    pool.shutdown().await;
}

#[tokio::test]
async fn privacy_mode_without_identity_degrades_silently() {
    let pool = WorkerPool::new(
        pool_config(1, 10_000),
        Arc::new(Scripted),
        Some(Arc::new(FixedRouter("sealed-llm"))),
    )
    .unwrap();

    let mut request = req("provider-echo").with_provider("openai");
    request.use_privacy_mode = true;

    let resp = pool.process_request(&request, None).await.unwrap();
    assert_eq!(resp.metadata.provider.as_deref(), Some("openai"));

    pool.shutdown().await;
}

#[tokio::test]
async fn counting_router_rotates_providers_across_dispatches() {
    let router = Arc::new(
        CountingPrivacyRouter::new(vec!["aegis".to_string(), "bastion".to_string()]).unwrap(),
    );
    let pool = WorkerPool::new(pool_config(1, 10_000), Arc::new(Scripted), Some(router)).unwrap();

    let mut request = req("provider-echo");
    request.use_privacy_mode = true;

    let first = pool
        .process_request(&request, Some(&caller("u1")))
        .await
        .unwrap();
    let second = pool
        .process_request(&request, Some(&caller("u1")))
        .await
        .unwrap();
    assert_eq!(first.metadata.provider.as_deref(), Some("aegis"));
    assert_eq!(second.metadata.provider.as_deref(), Some("bastion"));

    pool.shutdown().await;
}

#[tokio::test(flavor = "current_thread")]
async fn shutdown_rejects_pending_and_then_new_requests() {
    let pool = WorkerPool::new(pool_config(2, 10_000), Arc::new(Scripted), None).unwrap();

    let p0 = pool.clone();
    let h0 = tokio::spawn(async move { p0.process_request(&req("sleep:300"), None).await });
    let p1 = pool.clone();
    let h1 = tokio::spawn(async move { p1.process_request(&req("sleep:300"), None).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    pool.shutdown().await;

    assert!(matches!(h0.await.unwrap(), Err(PoolError::ShuttingDown)));
    assert!(matches!(h1.await.unwrap(), Err(PoolError::ShuttingDown)));

    // Fast rejection after shutdown has begun.
    let started = Instant::now();
    let err = pool.process_request(&req("echo:late"), None).await.unwrap_err();
    assert!(matches!(err, PoolError::ShuttingDown));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn progress_frames_reach_subscribers_without_retiring_the_request() {
    let pool = WorkerPool::new(pool_config(1, 10_000), Arc::new(Scripted), None).unwrap();
    let mut progress = pool.subscribe_progress();

    let resp = pool.process_request(&req("progress"), None).await.unwrap();
    assert_eq!(resp.content.as_deref(), Some("done"));

    let first = progress.next().await.unwrap().unwrap();
    assert_eq!(first.request_id, resp.metadata.request_id);
    assert_eq!(first.progress["stage"], "drafting");
    let second = progress.next().await.unwrap().unwrap();
    assert_eq!(second.progress["stage"], "polishing");

    pool.shutdown().await;
}

#[tokio::test]
async fn malformed_payload_rejects_with_protocol_error() {
    let pool = WorkerPool::new(pool_config(1, 10_000), Arc::new(Scripted), None).unwrap();

    let err = pool
        .process_request(&req("malformed"), None)
        .await
        .unwrap_err();
    match err {
        PoolError::Protocol(msg) => assert!(msg.contains("not an object"), "got {msg}"),
        other => panic!("expected protocol violation, got {other:?}"),
    }

    // No dangling registry entry, and the pool keeps serving.
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.pending, 0);
    assert_eq!(snapshot.workers[0].assigned, 0);
    let resp = pool.process_request(&req("echo:still-up"), None).await.unwrap();
    assert_eq!(resp.content.as_deref(), Some("still-up"));

    pool.shutdown().await;
}

#[tokio::test]
async fn snapshot_reflects_pool_shape() {
    let pool = WorkerPool::new(pool_config(3, 10_000), Arc::new(Scripted), None).unwrap();

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 3);
    assert_eq!(snapshot.pending, 0);
    assert!(!snapshot.shutting_down);

    pool.shutdown().await;
}
