use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "plume", about = "Drive the plume AI worker pool with a stub executor")]
pub struct Args {
    /// Pool size; falls back to PLUME_POOL_WORKERS, then the default.
    #[arg(long, env = "PLUME_POOL_WORKERS")]
    pub workers: Option<usize>,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "PLUME_POOL_REQUEST_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// How many requests to submit concurrently.
    #[arg(long, default_value_t = 5)]
    pub requests: usize,

    #[arg(long, default_value = "Write a haiku about rain.")]
    pub prompt: String,

    /// Route requests through the privacy-mode provider rotation.
    #[arg(long)]
    pub privacy: bool,

    /// Simulated provider latency for the stub executor.
    #[arg(long, default_value_t = 150)]
    pub stub_delay_ms: u64,
}
