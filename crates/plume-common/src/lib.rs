pub mod config;
pub mod request;
pub mod telemetry;

pub use config::{PoolConfig, RateLimitConfig, RetryConfig};
pub use request::{AiRequest, AiResponse, CallerContext, ChatMessage, ResponseMetadata};
