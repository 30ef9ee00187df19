// Model gateway
//
// The single façade the host calls. Resolves scoped model identifiers to a
// registered adapter, applies the smart-memory policy before local
// dispatch, aggregates model listings concurrently, and serves embeddings
// from the local backend with the native-endpoint fallback.
//
// The gateway alone owns the active-model cell; adapters and the registry
// never touch it.

use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::WorkspaceSettings;
use crate::error::LlmError;
use crate::index::Embedder;
use crate::net::Transport;
use crate::providers::{
    AnthropicProvider, ChatRequest, ChatResponse, GeminiProvider, ModelCapabilities,
    ModelProvider, OpenAiCompatProvider, ProviderRegistry, TextStream,
};

/// Identifier of the local backend instance in the registry.
pub const LOCAL_PROVIDER: &str = "local";

/// A model tagged with the provider it belongs to; `id` is the scoped form
/// (`providerId:modelId`) the UI hands back in requests.
#[derive(Debug, Clone, Serialize)]
pub struct ScopedModelInfo {
    pub id: String,
    pub name: String,
    pub provider_id: String,
    pub capabilities: Option<ModelCapabilities>,
}

pub struct Gateway {
    transport: Arc<Transport>,
    registry: RwLock<ProviderRegistry>,
    settings: RwLock<WorkspaceSettings>,
    /// Most recently used local model; `None` until the first local call or
    /// after an explicit unload.
    active_model: Mutex<Option<String>>,
}

impl Gateway {
    pub fn new(settings: WorkspaceSettings) -> Result<Self, LlmError> {
        let gateway = Self {
            transport: Arc::new(Transport::new()?),
            registry: RwLock::new(ProviderRegistry::new()),
            settings: RwLock::new(WorkspaceSettings::default()),
            active_model: Mutex::new(None),
        };
        gateway.configure(settings);
        Ok(gateway)
    }

    /// Rebuild the provider set from new settings.
    ///
    /// Adapters are immutable; reconfiguration registers fresh instances and
    /// in-flight requests finish on the ones they resolved.
    pub fn configure(&self, settings: WorkspaceSettings) {
        let mut registry = ProviderRegistry::new();

        if !settings.model_url.is_empty() {
            let api_key = if settings.api_key.is_empty() {
                "lm-studio"
            } else {
                &settings.api_key
            };
            registry.register(Arc::new(OpenAiCompatProvider::new(
                LOCAL_PROVIDER,
                "Local LLM",
                api_key,
                &settings.model_url,
                self.transport.clone(),
            )));
        }
        if !settings.openai_api_key.is_empty() {
            registry.register(Arc::new(OpenAiCompatProvider::new(
                "openai",
                "OpenAI",
                &settings.openai_api_key,
                "https://api.openai.com/v1",
                self.transport.clone(),
            )));
        }
        if !settings.anthropic_api_key.is_empty() {
            registry.register(Arc::new(AnthropicProvider::new(
                &settings.anthropic_api_key,
                self.transport.clone(),
            )));
        }
        if !settings.gemini_api_key.is_empty() {
            registry.register(Arc::new(GeminiProvider::new(
                &settings.gemini_api_key,
                self.transport.clone(),
            )));
        }
        if !settings.grok_api_key.is_empty() {
            registry.register(Arc::new(OpenAiCompatProvider::new(
                "grok",
                "Grok",
                &settings.grok_api_key,
                "https://api.x.ai/v1",
                self.transport.clone(),
            )));
        }
        if !settings.openrouter_api_key.is_empty() {
            registry.register(Arc::new(OpenAiCompatProvider::new(
                "openrouter",
                "OpenRouter",
                &settings.openrouter_api_key,
                "https://openrouter.ai/api/v1",
                self.transport.clone(),
            )));
        }

        *self.registry.write().unwrap() = registry;
        *self.settings.write().unwrap() = settings;
    }

    /// Query every registered adapter concurrently and aggregate. One
    /// adapter failing is logged and excluded, never aborts the call.
    pub async fn list_models(&self) -> Vec<ScopedModelInfo> {
        let providers = self.registry.read().unwrap().all();
        let queries = providers.into_iter().map(|provider| async move {
            let models = provider.list_models().await;
            (
                provider.id().to_string(),
                provider.display_name().to_string(),
                models,
            )
        });

        let mut all = Vec::new();
        for (provider_id, display_name, result) in join_all(queries).await {
            match result {
                Ok(models) => {
                    for m in models {
                        all.push(ScopedModelInfo {
                            id: format!("{provider_id}:{}", m.id),
                            name: m.name,
                            provider_id: provider_id.clone(),
                            capabilities: m.capabilities,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!("error listing models for {display_name}: {e}");
                }
            }
        }
        all
    }

    pub async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let (provider_id, model) = self.resolve(request.model.as_deref());
        let provider = self.provider(&provider_id)?;
        if provider_id == LOCAL_PROVIDER {
            self.apply_smart_memory(&model, true).await;
        }
        let mut resolved = request.clone();
        resolved.model = Some(model);
        provider.complete(&resolved).await
    }

    pub async fn stream(&self, request: &ChatRequest) -> Result<TextStream, LlmError> {
        let (provider_id, model) = self.resolve(request.model.as_deref());
        let provider = self.provider(&provider_id)?;
        if provider_id == LOCAL_PROVIDER {
            self.apply_smart_memory(&model, true).await;
        }
        let mut resolved = request.clone();
        resolved.model = Some(model);
        provider.stream(&resolved).await
    }

    /// Embed text on the local backend.
    ///
    /// Retrieval needs one consistent embedding space, so this never routes
    /// to a hosted provider. With no embedding model configured it
    /// auto-detects one; with none found it fails before any network call.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let (model_url, configured_model, api_key, root) = {
            let s = self.settings.read().unwrap();
            (
                s.model_url.trim_end_matches('/').to_string(),
                s.embedding_model.clone(),
                s.api_key.clone(),
                s.local_root_url(),
            )
        };
        if model_url.is_empty() {
            return Err(LlmError::Config(
                "local backend URL not configured; embeddings require a local backend".to_string(),
            ));
        }

        let mut model = configured_model;
        if model.is_empty() || model == "local-model" {
            tracing::debug!("no embedding model set, attempting auto-detection");
            model = self.detect_embedding_model().await;
            if !model.is_empty() {
                tracing::info!("auto-detected embedding model: {model}");
            }
        }
        if model.is_empty() {
            return Err(LlmError::NoEmbeddingModel);
        }

        self.apply_smart_memory(&model, false).await;

        let headers = json_headers(&api_key);
        let body = json!({ "input": text, "model": model });
        let url = format!("{model_url}/embeddings");

        match self.transport.request(&url, "POST", &headers, Some(body)).await {
            Ok(response) => {
                let parsed: EmbeddingsResponse = serde_json::from_value(response)
                    .map_err(|e| LlmError::Protocol(format!("unexpected embeddings shape: {e}")))?;
                let vector = parsed
                    .data
                    .into_iter()
                    .next()
                    .map(|row| row.embedding)
                    .unwrap_or_default();
                require_nonempty(vector)
            }
            Err(original @ LlmError::Api { status: 404, .. }) => {
                // Some local backends only expose their native shape.
                tracing::warn!("standard embeddings endpoint returned 404, trying native fallback");
                let fallback_url = format!("{root}/api/embeddings");
                let fallback_body = json!({ "model": model, "prompt": text });
                let fallback_headers =
                    vec![("Content-Type".to_string(), "application/json".to_string())];
                match self
                    .transport
                    .request(&fallback_url, "POST", &fallback_headers, Some(fallback_body))
                    .await
                {
                    Ok(response) => {
                        let parsed: NativeEmbeddingsResponse = serde_json::from_value(response)
                            .map_err(|e| {
                                LlmError::Protocol(format!("unexpected embeddings shape: {e}"))
                            })?;
                        require_nonempty(parsed.embedding)
                    }
                    Err(inner) => {
                        tracing::warn!("native embeddings fallback also failed: {inner}");
                        Err(original)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Warm a local model before first real use (`keep_alive: -1`).
    /// Best-effort: callers log and ignore the result.
    pub async fn preload(&self, model: &str) -> Result<(), LlmError> {
        let root = self.settings.read().unwrap().local_root_url();
        tracing::debug!("preloading local model: {model}");
        let body = json!({ "model": model, "prompt": "", "keep_alive": -1, "stream": false });
        self.transport
            .request(&format!("{root}/api/generate"), "POST", &[], Some(body))
            .await?;
        Ok(())
    }

    /// Evict a local model from memory (`keep_alive: 0`). Best-effort.
    pub async fn unload(&self, model: &str) -> Result<(), LlmError> {
        let root = self.settings.read().unwrap().local_root_url();
        tracing::debug!("unloading local model: {model}");
        let body = json!({ "model": model, "keep_alive": 0, "stream": false });
        self.transport
            .request(&format!("{root}/api/generate"), "POST", &[], Some(body))
            .await?;
        Ok(())
    }

    /// Models currently loaded by the local backend. Empty when the
    /// process-status endpoint is absent or failing.
    pub async fn running_models(&self) -> Vec<String> {
        let root = self.settings.read().unwrap().local_root_url();
        match self
            .transport
            .request(&format!("{root}/api/ps"), "GET", &[], None)
            .await
        {
            Ok(response) => serde_json::from_value::<PsResponse>(response)
                .map(|ps| {
                    ps.models
                        .into_iter()
                        .filter_map(|m| m.name.or(m.model))
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                tracing::debug!("process status endpoint unavailable: {e}");
                Vec::new()
            }
        }
    }

    /// The most recently used local model, if any.
    pub async fn active_model(&self) -> Option<String> {
        self.active_model.lock().await.clone()
    }

    /// Forget the active model without issuing an unload (used after the
    /// host observes the backend restarting).
    pub async fn clear_active_model(&self) {
        *self.active_model.lock().await = None;
    }

    /// Split a scoped model identifier into provider and model. Unscoped
    /// identifiers target the local provider; empty ones fall back to the
    /// configured default chat model.
    fn resolve(&self, model: Option<&str>) -> (String, String) {
        let chat_model = self.settings.read().unwrap().chat_model.clone();
        match model {
            Some(m) if m.contains(':') => {
                let (provider_id, model_id) = m.split_once(':').unwrap();
                (provider_id.to_string(), model_id.to_string())
            }
            Some(m) if !m.is_empty() && m != LOCAL_PROVIDER => {
                (LOCAL_PROVIDER.to_string(), m.to_string())
            }
            _ => (LOCAL_PROVIDER.to_string(), chat_model),
        }
    }

    fn provider(&self, id: &str) -> Result<Arc<dyn ModelProvider>, LlmError> {
        self.registry
            .read()
            .unwrap()
            .get(id)
            .ok_or_else(|| LlmError::ProviderNotFound(id.to_string()))
    }

    /// Unload the previously active local model before switching to a
    /// different one, when the relevant setting allows it, then record the
    /// new model as active.
    ///
    /// Chat dispatch honors both the auto-unload-on-switch and the
    /// aggressive smart-memory setting; embedding dispatch only the latter.
    async fn apply_smart_memory(&self, model: &str, include_auto_unload: bool) {
        if model.is_empty() {
            return;
        }
        let (smart, auto) = {
            let s = self.settings.read().unwrap();
            (s.enable_smart_memory, s.auto_unload_on_switch)
        };
        let enabled = smart || (include_auto_unload && auto);

        let mut active = self.active_model.lock().await;
        if let Some(previous) = active.clone() {
            if previous != model && enabled {
                if let Err(e) = self.unload(&previous).await {
                    tracing::warn!("failed to unload model {previous}: {e}");
                }
            }
        }
        *active = Some(model.to_string());
    }

    async fn detect_embedding_model(&self) -> String {
        let Ok(local) = self.provider(LOCAL_PROVIDER) else {
            return String::new();
        };
        let models = match local.list_models().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!("embedding model auto-detection failed: {e}");
                return String::new();
            }
        };
        models
            .iter()
            .find(|m| m.id.contains("embed"))
            .or_else(|| models.first())
            .map(|m| m.id.clone())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Embedder for Gateway {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Gateway::embed(self, text).await
    }
}

fn json_headers(api_key: &str) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        ("Authorization".to_string(), format!("Bearer {api_key}")),
    ]
}

fn require_nonempty(vector: Vec<f32>) -> Result<Vec<f32>, LlmError> {
    if vector.is_empty() {
        Err(LlmError::Protocol(
            "backend returned an empty embedding vector".to_string(),
        ))
    } else {
        Ok(vector)
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct NativeEmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Debug, Deserialize)]
struct PsModel {
    name: Option<String>,
    model: Option<String>,
}
