use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use troupe_core::traits::{LlmClient, ModelRegistry};

/// In-process model registry: `(provider, model_id)` → client. The
/// engine only reads it; registration happens at startup (or from
/// tests). Provider CRUD and credential rotation live outside the core.
pub struct StaticModelRegistry {
    clients: RwLock<HashMap<(String, String), Arc<dyn LlmClient>>>,
}

impl StaticModelRegistry {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        provider: impl Into<String>,
        model_id: impl Into<String>,
        client: Arc<dyn LlmClient>,
    ) {
        self.clients
            .write()
            .unwrap()
            .insert((provider.into(), model_id.into()), client);
    }

    pub fn unregister(&self, provider: &str, model_id: &str) -> bool {
        self.clients
            .write()
            .unwrap()
            .remove(&(provider.to_string(), model_id.to_string()))
            .is_some()
    }
}

impl Default for StaticModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry for StaticModelRegistry {
    fn resolve(&self, provider: &str, model_id: &str) -> Option<Arc<dyn LlmClient>> {
        self.clients
            .read()
            .unwrap()
            .get(&(provider.to_string(), model_id.to_string()))
            .cloned()
    }
}
