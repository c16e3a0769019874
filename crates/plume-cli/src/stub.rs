use std::time::Duration;

use plume_common::AiRequest;
use plume_pool::{Executor, Reporter};
use serde_json::Value;

/// Stand-in executor for local smoke runs: sleeps to mimic provider latency,
/// emits a progress frame per stage and answers with a canned completion.
pub struct StubExecutor {
    delay: Duration,
}

impl StubExecutor {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl Executor for StubExecutor {
    fn execute(&self, request: AiRequest, reporter: &Reporter) -> Result<Value, String> {
        let prompt = request
            .messages
            .as_ref()
            .and_then(|m| m.last())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        reporter.progress(serde_json::json!({"stage": "thinking"}));
        std::thread::sleep(self.delay);
        reporter.progress(serde_json::json!({"stage": "writing"}));

        Ok(serde_json::json!({
            "content": format!("[stub completion for: {prompt}]"),
            "success": true,
            "stop_reason": "end_turn",
            "provider": request.provider,
        }))
    }
}
