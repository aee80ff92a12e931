//! The generation provider contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use vgen_models::TaskKind;

use crate::error::ProviderResult;
use crate::http::{HttpProvider, HttpProviderConfig};
use crate::types::{GeneratedArtifact, GenerationRequest};

/// One generative capability (outline, script, image, clip or voice).
///
/// Implementations must classify every failure as transient, permanent or
/// timeout. The scheduler bounds each `generate` call with its own deadline
/// as well; `ready` runs before that deadline starts.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Wait until a call would be admitted by client-side quota. Callers
    /// invoke it once before each `generate`.
    async fn ready(&self) {}

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GeneratedArtifact>;
}

/// Providers keyed by task kind.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<TaskKind, Arc<dyn GenerationProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `kind`, replacing any previous one.
    pub fn with(mut self, kind: TaskKind, provider: Arc<dyn GenerationProvider>) -> Self {
        self.providers.insert(kind, provider);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(&kind).cloned()
    }

    /// Kinds with no registered provider.
    pub fn missing_kinds(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| !self.providers.contains_key(k))
            .collect()
    }

    /// HTTP providers for every kind, configured from the environment. The
    /// outline provider is optional, since only some requests plan one.
    pub fn from_env() -> ProviderResult<Self> {
        let mut set = Self::new();
        for kind in TaskKind::ALL {
            if kind == TaskKind::Outline && !HttpProviderConfig::is_configured(kind) {
                continue;
            }
            let config = HttpProviderConfig::from_env(kind)?;
            set = set.with(kind, Arc::new(HttpProvider::new(config)?));
        }
        Ok(set)
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().collect();
        kinds.sort();
        f.debug_struct("ProviderSet").field("kinds", &kinds).finish()
    }
}
