mod args;
mod stub;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use plume_common::{telemetry, AiRequest, CallerContext, PoolConfig};
use plume_pool::{CountingPrivacyRouter, PrivacyRouter, WorkerPool};

use crate::args::Args;
use crate::stub::StubExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init("plume-cli");
    let args = Args::parse();

    let mut config = PoolConfig::from_env();
    if let Some(workers) = args.workers {
        config.num_workers = workers.max(1);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.request_timeout_ms = timeout_ms;
    }

    let privacy: Option<Arc<dyn PrivacyRouter>> = if args.privacy {
        Some(Arc::new(CountingPrivacyRouter::new(vec![
            "aegis-private".to_string(),
            "bastion-private".to_string(),
        ])?))
    } else {
        None
    };

    let pool = WorkerPool::new(
        config,
        Arc::new(StubExecutor::new(args.stub_delay_ms)),
        privacy,
    )?;

    let caller = CallerContext {
        user_id: Some("local-user".to_string()),
        session_id: None,
    };

    let mut set = tokio::task::JoinSet::new();
    for i in 0..args.requests {
        let pool = pool.clone();
        let prompt = args.prompt.clone();
        let privacy_mode = args.privacy;
        let caller = caller.clone();
        set.spawn(async move {
            let mut request = AiRequest::new("chat").with_prompt("user", &prompt);
            request.use_privacy_mode = privacy_mode;
            (i, pool.process_request(&request, Some(&caller)).await)
        });
    }

    while let Some(res) = set.join_next().await {
        let (i, outcome) = res?;
        match outcome {
            Ok(resp) => println!(
                "request {} → worker {} in {}ms (provider {}): {}",
                i,
                resp.metadata.worker_index,
                resp.metadata.duration_ms,
                resp.metadata.provider.as_deref().unwrap_or("-"),
                resp.content.unwrap_or_default()
            ),
            Err(err) => eprintln!("✗ request {} failed: {}", i, err),
        }
    }

    let snapshot = pool.snapshot().await?;
    tracing::info!(
        workers = snapshot.workers.len(),
        pending = snapshot.pending,
        "run complete"
    );

    pool.shutdown().await;
    Ok(())
}
