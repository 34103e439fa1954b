//! Access tokens for remote hosts
//!
//! The engine never stores tokens itself. It asks a [`CredentialSupplier`]
//! for one per host origin and reports back when a host rejects it. The
//! [`CredentialCache`] sits in between so every repository synced against the
//! same host within one batch shares a single lookup, and an invalidation is
//! seen by the repositories that follow.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth_url::{authenticated_url, host_origin};

/// External source of access tokens, keyed by `scheme://host[:port]`.
#[async_trait]
pub trait CredentialSupplier: Send + Sync {
    /// A token for `host_origin`, or `None` to proceed unauthenticated.
    async fn resolve_token(&self, host_origin: &str) -> Option<String>;

    /// Forget whatever token was last handed out for `host_origin`.
    async fn invalidate(&self, host_origin: &str);
}

/// Reads tokens from environment variables named per host.
#[derive(Debug, Default, Clone)]
pub struct EnvTokenSupplier {
    vars: HashMap<String, String>,
}

impl EnvTokenSupplier {
    /// `vars` maps a host origin to the environment variable holding its token.
    pub fn new(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }
}

#[async_trait]
impl CredentialSupplier for EnvTokenSupplier {
    async fn resolve_token(&self, host_origin: &str) -> Option<String> {
        let var = self.vars.get(host_origin)?;
        std::env::var(var).ok().filter(|t| !t.is_empty())
    }

    async fn invalidate(&self, host_origin: &str) {
        // The variable is re-read on the next lookup; nothing is cached here.
        debug!(host = host_origin, "token invalidated");
    }
}

/// Per-batch view of a [`CredentialSupplier`].
pub struct CredentialCache {
    supplier: Arc<dyn CredentialSupplier>,
    tokens: Mutex<HashMap<String, Option<String>>>,
}

impl CredentialCache {
    pub fn new(supplier: Arc<dyn CredentialSupplier>) -> Self {
        Self {
            supplier,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// The cached token for the host of `remote`, resolving it on first use.
    pub async fn token_for(&self, remote: &str) -> Option<String> {
        let host = host_origin(remote)?;
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&host) {
            return token.clone();
        }
        let token = self.supplier.resolve_token(&host).await;
        tokens.insert(host, token.clone());
        token
    }

    /// Invalidate the host's token and resolve a fresh one.
    pub async fn refresh(&self, remote: &str) -> Option<String> {
        let host = host_origin(remote)?;
        let mut tokens = self.tokens.lock().await;
        info!(host = %host, "refreshing rejected credential");
        self.supplier.invalidate(&host).await;
        let token = self.supplier.resolve_token(&host).await;
        tokens.insert(host, token.clone());
        token
    }

    /// `remote` with the cached token embedded.
    pub async fn authenticated(&self, remote: &str) -> String {
        let token = self.token_for(remote).await;
        authenticated_url(remote, token.as_deref())
    }

    /// `remote` with a freshly refreshed token embedded.
    pub async fn reauthenticated(&self, remote: &str) -> String {
        let token = self.refresh(remote).await;
        authenticated_url(remote, token.as_deref())
    }
}
