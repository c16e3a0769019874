use plume_common::AiRequest;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the pool sends into an execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerInbound {
    Request { request_id: String, data: AiRequest },
    Shutdown,
}

/// Messages an execution context sends back to the pool, correlated by
/// request id. `Response` and `Error` are terminal; `Progress` is
/// informational and does not retire the pending entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerOutbound {
    Response { request_id: String, data: Value },
    Error { request_id: String, error: String },
    Progress { request_id: String, progress: Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_tags_are_lowercase() {
        let msg = WorkerOutbound::Progress {
            request_id: "r1".to_string(),
            progress: serde_json::json!({"stage": "drafting"}),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["requestId"].as_str(), None); // field stays snake_case
        assert_eq!(v["request_id"], "r1");
    }

    #[test]
    fn inbound_request_carries_payload() {
        let msg = WorkerInbound::Request {
            request_id: "r2".to_string(),
            data: AiRequest::new("chat"),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["data"]["kind"], "chat");
    }
}
