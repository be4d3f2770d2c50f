// Model configurations and admin settings.

use std::collections::BTreeMap;
use std::sync::RwLock;

use parley_common::protocol::errors::ErrorCode;
use parley_common::types::{AdminSettings, ModelConfig, ModelId, ModelInfo};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::sync::{read_guard, write_guard};

/// Partial update for `modifyModel`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelPatch {
    pub display_name: Option<String>,
    pub provider: Option<String>,
    pub params: Option<Value>,
}

#[derive(Debug, Default)]
struct ModelState {
    models: BTreeMap<ModelId, ModelConfig>,
    settings: AdminSettings,
}

#[derive(Debug, Default)]
pub struct ModelStore {
    state: RwLock<ModelState>,
}

impl ModelStore {
    pub fn list(&self) -> Vec<ModelInfo> {
        read_guard(&self.state).models.values().map(ModelConfig::info).collect()
    }

    pub fn get(&self, model_id: &str) -> ServiceResult<ModelConfig> {
        read_guard(&self.state)
            .models
            .get(model_id)
            .cloned()
            .ok_or_else(|| ServiceError::not_found("model", model_id))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        read_guard(&self.state).models.contains_key(model_id)
    }

    /// Add a model. An empty `id` gets a generated one.
    pub fn insert(&self, mut model: ModelConfig) -> ServiceResult<ModelId> {
        if model.display_name.trim().is_empty() {
            return Err(ServiceError::bad_request("model display name must not be empty"));
        }
        if model.provider.trim().is_empty() {
            return Err(ServiceError::bad_request("model provider must not be empty"));
        }
        if model.id.trim().is_empty() {
            model.id = Uuid::new_v4().to_string();
        }

        let mut state = write_guard(&self.state);
        if state.models.contains_key(&model.id) {
            return Err(ServiceError::new(
                ErrorCode::Conflict,
                format!("model `{}` already exists", model.id),
            ));
        }
        let id = model.id.clone();
        state.models.insert(id.clone(), model);
        Ok(id)
    }

    pub fn modify(&self, model_id: &str, patch: ModelPatch) -> ServiceResult<()> {
        let mut state = write_guard(&self.state);
        let model =
            state.models.get_mut(model_id).ok_or_else(|| ServiceError::not_found("model", model_id))?;
        if let Some(display_name) = patch.display_name {
            if display_name.trim().is_empty() {
                return Err(ServiceError::bad_request("model display name must not be empty"));
            }
            model.display_name = display_name;
        }
        if let Some(provider) = patch.provider {
            model.provider = provider;
        }
        if let Some(params) = patch.params {
            model.params = params;
        }
        Ok(())
    }

    /// Remove a model and clear admin settings that pointed at it.
    pub fn remove(&self, model_id: &str) -> ServiceResult<ModelConfig> {
        let mut state = write_guard(&self.state);
        let removed =
            state.models.remove(model_id).ok_or_else(|| ServiceError::not_found("model", model_id))?;
        let settings = &mut state.settings;
        for reference in [&mut settings.title_model_id, &mut settings.default_model_id] {
            if reference.as_deref() == Some(model_id) {
                *reference = None;
            }
        }
        Ok(removed)
    }

    pub fn admin_settings(&self) -> AdminSettings {
        read_guard(&self.state).settings.clone()
    }

    pub fn set_admin_settings(&self, settings: AdminSettings) -> ServiceResult<()> {
        let mut state = write_guard(&self.state);
        for model_id in [&settings.title_model_id, &settings.default_model_id].into_iter().flatten() {
            if !state.models.contains_key(model_id) {
                return Err(ServiceError::bad_request(format!(
                    "admin settings reference unknown model `{model_id}`"
                )));
            }
        }
        state.settings = settings;
        Ok(())
    }
}
