use async_trait::async_trait;
use dashmap::DashMap;

/// Query interface of the privacy-mode routing policy. Given a stable
/// caller identity, returns the provider that should service
/// privacy-sensitive requests for that caller.
///
/// The pool treats this as best-effort: any error here is logged and the
/// caller's original provider is used unchanged.
#[async_trait]
pub trait PrivacyRouter: Send + Sync {
    async fn provider_for(&self, identity: &str) -> anyhow::Result<String>;
}

/// In-process counting router: rotates each identity across a fixed set of
/// privacy-cleared providers by per-identity dispatch count. Stands in for
/// the production Redis-backed counter with the same selection semantics.
pub struct CountingPrivacyRouter {
    providers: Vec<String>,
    counts: DashMap<String, u64>,
}

impl CountingPrivacyRouter {
    pub fn new(providers: Vec<String>) -> anyhow::Result<Self> {
        if providers.is_empty() {
            anyhow::bail!("privacy router needs at least one provider");
        }
        Ok(Self {
            providers,
            counts: DashMap::new(),
        })
    }
}

#[async_trait]
impl PrivacyRouter for CountingPrivacyRouter {
    async fn provider_for(&self, identity: &str) -> anyhow::Result<String> {
        let mut entry = self.counts.entry(identity.to_string()).or_insert(0);
        let n = *entry;
        *entry = n.wrapping_add(1);
        Ok(self.providers[(n % self.providers.len() as u64) as usize].clone())
    }
}
