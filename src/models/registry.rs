//! # Model Registry
//!
//! Tracks the status of each model slot so health checks and the models
//! endpoint can report what is loaded without touching the providers.
//!
//! ## State Transitions:
//! Available → Loading → Loaded → Unloaded
//! Loading can also end in Error; a later reload starts over at Loading.

use crate::models::ModelKind;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Current status of a model slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    /// Configured but not loaded yet
    Available,

    /// Files downloading or weights loading
    Loading,

    /// Ready for inference
    Loaded {
        loaded_at: u64,
        memory_usage_bytes: u64,
    },

    /// Was loaded, released by cleanup
    Unloaded { unloaded_at: u64 },

    Error { message: String, error_at: u64 },
}

impl ModelStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded { .. })
    }

    pub fn memory_usage_bytes(&self) -> u64 {
        match self {
            ModelStatus::Loaded { memory_usage_bytes, .. } => *memory_usage_bytes,
            _ => 0,
        }
    }

    pub fn description(&self) -> String {
        match self {
            ModelStatus::Available => "Not loaded".to_string(),
            ModelStatus::Loading => "Loading".to_string(),
            ModelStatus::Loaded { .. } => "Ready for inference".to_string(),
            ModelStatus::Unloaded { .. } => "Unloaded".to_string(),
            ModelStatus::Error { message, .. } => format!("Error: {}", message),
        }
    }
}

/// Registry entry for one model slot.
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub kind: ModelKind,
    pub model_id: String,
    pub revision: String,
    pub adapter: Option<String>,
    pub status: ModelStatus,
    pub last_updated: u64,
}

/// Status table for the three model slots.
///
/// ## Thread Safety:
/// Uses tokio's RwLock so status reads from health checks never block the
/// loader for long, and writers are serialized.
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelKind, ModelEntry>>,
}

impl ModelRegistry {
    /// Create a registry with every slot in `Available`.
    ///
    /// `slots` gives each kind's model id, revision and adapter.
    pub fn new(slots: Vec<(ModelKind, String, String, Option<String>)>) -> Self {
        let now = current_timestamp();
        let models = slots
            .into_iter()
            .map(|(kind, model_id, revision, adapter)| {
                let entry = ModelEntry {
                    kind,
                    model_id,
                    revision,
                    adapter,
                    status: ModelStatus::Available,
                    last_updated: now,
                };
                (kind, entry)
            })
            .collect();

        Self { models: RwLock::new(models) }
    }

    /// All entries, in `ModelKind::ALL` order.
    pub async fn list_models(&self) -> Vec<ModelEntry> {
        let models = self.models.read().await;
        ModelKind::ALL.iter().filter_map(|kind| models.get(kind).cloned()).collect()
    }

    pub async fn get(&self, kind: ModelKind) -> Option<ModelEntry> {
        self.models.read().await.get(&kind).cloned()
    }

    pub async fn status(&self, kind: ModelKind) -> Option<ModelStatus> {
        self.models.read().await.get(&kind).map(|e| e.status.clone())
    }

    pub async fn update_status(&self, kind: ModelKind, status: ModelStatus) {
        let mut models = self.models.write().await;
        if let Some(entry) = models.get_mut(&kind) {
            entry.status = status;
            entry.last_updated = current_timestamp();
        }
    }

    pub async fn mark_loading(&self, kind: ModelKind) {
        self.update_status(kind, ModelStatus::Loading).await;
    }

    pub async fn mark_loaded(&self, kind: ModelKind, memory_usage_bytes: u64) {
        let status = ModelStatus::Loaded {
            loaded_at: current_timestamp(),
            memory_usage_bytes,
        };
        self.update_status(kind, status).await;
    }

    pub async fn mark_error(&self, kind: ModelKind, message: String) {
        let status = ModelStatus::Error {
            message,
            error_at: current_timestamp(),
        };
        self.update_status(kind, status).await;
    }

    /// Move a slot to `Unloaded`, but only if it was loaded.
    pub async fn mark_unloaded(&self, kind: ModelKind) {
        let mut models = self.models.write().await;
        if let Some(entry) = models.get_mut(&kind) {
            if entry.status.is_loaded() {
                entry.status = ModelStatus::Unloaded { unloaded_at: current_timestamp() };
                entry.last_updated = current_timestamp();
            }
        }
    }

    pub async fn total_memory_bytes(&self) -> u64 {
        let models = self.models.read().await;
        models.values().map(|e| e.status.memory_usage_bytes()).sum()
    }

    pub async fn all_loaded(&self) -> bool {
        let models = self.models.read().await;
        !models.is_empty() && models.values().all(|e| e.status.is_loaded())
    }
}

/// Seconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(vec![
            (ModelKind::TextSummarizer, "t5-small".into(), "main".into(), None),
            (ModelKind::ImageCaptioner, "blip".into(), "main".into(), Some("./lora".into())),
            (ModelKind::AudioAsr, "whisper-base".into(), "main".into(), None),
        ])
    }

    #[tokio::test]
    async fn test_registry_starts_available() {
        let registry = registry();
        let entries = registry.list_models().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, ModelKind::TextSummarizer);
        assert!(entries.iter().all(|e| e.status == ModelStatus::Available));
        assert!(!registry.all_loaded().await);
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let registry = registry();

        registry.mark_loading(ModelKind::AudioAsr).await;
        assert_eq!(registry.status(ModelKind::AudioAsr).await, Some(ModelStatus::Loading));

        registry.mark_loaded(ModelKind::AudioAsr, 1024).await;
        assert!(registry.status(ModelKind::AudioAsr).await.unwrap().is_loaded());
        assert_eq!(registry.total_memory_bytes().await, 1024);

        registry.mark_unloaded(ModelKind::AudioAsr).await;
        assert!(matches!(
            registry.status(ModelKind::AudioAsr).await,
            Some(ModelStatus::Unloaded { .. })
        ));
        assert_eq!(registry.total_memory_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_unload_ignores_failed_models() {
        let registry = registry();
        registry.mark_error(ModelKind::ImageCaptioner, "download failed".into()).await;
        registry.mark_unloaded(ModelKind::ImageCaptioner).await;

        let status = registry.status(ModelKind::ImageCaptioner).await.unwrap();
        assert!(status.description().contains("download failed"));
    }

    #[tokio::test]
    async fn test_all_loaded() {
        let registry = registry();
        for kind in ModelKind::ALL {
            registry.mark_loaded(kind, 1).await;
        }
        assert!(registry.all_loaded().await);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ModelStatus::Loaded { loaded_at: 5, memory_usage_bytes: 10 }).unwrap();
        assert_eq!(json["state"], "loaded");
        assert_eq!(json["memory_usage_bytes"], 10);
    }
}
