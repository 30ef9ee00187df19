// Provider registry
//
// Configured adapters keyed by identifier. Registration is idempotent per
// id: re-registering under reconfiguration replaces the instance in place,
// keeping the slot of the first registration so enumeration order is stable.
// In-flight requests hold their own Arc and finish on the old instance.

use std::sync::Arc;

use super::ModelProvider;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ModelProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, or silently replace the provider registered under the same id.
    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        match self.providers.iter().position(|p| p.id() == provider.id()) {
            Some(pos) => self.providers[pos] = provider,
            None => self.providers.push(provider),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelProvider>> {
        self.providers.iter().find(|p| p.id() == id).cloned()
    }

    /// All providers in registration order.
    pub fn all(&self) -> Vec<Arc<dyn ModelProvider>> {
        self.providers.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::providers::types::{ChatRequest, ChatResponse, ModelInfo};
    use crate::providers::TextStream;
    use async_trait::async_trait;

    struct StubProvider {
        id: &'static str,
        name: &'static str,
    }

    #[async_trait]
    impl ModelProvider for StubProvider {
        fn id(&self) -> &str {
            self.id
        }
        fn display_name(&self) -> &str {
            self.name
        }
        async fn list_models(&self) -> Result<Vec<ModelInfo>, LlmError> {
            Ok(Vec::new())
        }
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse::default())
        }
        async fn stream(&self, _request: &ChatRequest) -> Result<TextStream, LlmError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
    }

    fn stub(id: &'static str, name: &'static str) -> Arc<dyn ModelProvider> {
        Arc::new(StubProvider { id, name })
    }

    #[test]
    fn test_get_by_id() {
        let mut registry = ProviderRegistry::new();
        registry.register(stub("local", "Local LLM"));
        assert!(registry.get("local").is_some());
        assert!(registry.get("openai").is_none());
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let mut registry = ProviderRegistry::new();
        registry.register(stub("local", "Local LLM"));
        registry.register(stub("openai", "OpenAI"));
        registry.register(stub("local", "Local LLM (reconfigured)"));

        let all = registry.all();
        assert_eq!(all.len(), 2);
        // The replacement keeps the original slot.
        assert_eq!(all[0].id(), "local");
        assert_eq!(all[0].display_name(), "Local LLM (reconfigured)");
        assert_eq!(all[1].id(), "openai");
    }

    #[test]
    fn test_old_instance_survives_replacement() {
        let mut registry = ProviderRegistry::new();
        registry.register(stub("local", "first"));
        let held = registry.get("local").unwrap();
        registry.register(stub("local", "second"));
        // An in-flight request keeps the adapter it resolved.
        assert_eq!(held.display_name(), "first");
        assert_eq!(registry.get("local").unwrap().display_name(), "second");
    }

    #[test]
    fn test_all_in_registration_order() {
        let mut registry = ProviderRegistry::new();
        for id in ["local", "openai", "anthropic", "gemini"] {
            registry.register(stub(id, id));
        }
        let all = registry.all();
        let ids: Vec<&str> = all.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["local", "openai", "anthropic", "gemini"]);
    }
}
