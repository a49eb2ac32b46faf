use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
pub mod config;
pub use config::EngineConfig;

/// Where the native engine is in its load → prepare → generate lifecycle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineStage {
    Uninitialized,
    Initialized,
    ModelLoaded,
    Ready,
    Generating,
    ShutDown,
}

impl EngineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStage::Uninitialized => "uninitialized",
            EngineStage::Initialized => "initialized",
            EngineStage::ModelLoaded => "model_loaded",
            EngineStage::Ready => "ready",
            EngineStage::Generating => "generating",
            EngineStage::ShutDown => "shut_down",
        }
    }
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the bridge knows about the loaded model file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelSummary {
    pub path: String,
    pub name: Option<String>,
    pub architecture: Option<String>,
    pub file_size: u64,
    pub n_params: u64,
    pub n_ctx_train: u32,
    pub n_vocab: i32,
}

impl ModelSummary {
    /// Short label for reports: the GGUF name, else the file name.
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        std::path::Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.clone())
    }
}

// Returned to the host by `systemInfo`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub stage: EngineStage,
    pub backend_ready: bool,
    pub model: Option<ModelSummary>,
    pub position: i32,
    pub n_ctx: u32,
    pub remaining_budget: Option<u32>,
    pub last_error: Option<String>,
    pub config: EngineConfig,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&EngineStage::ModelLoaded).unwrap();
        assert_eq!(json, "\"model_loaded\"");
        assert_eq!(EngineStage::ShutDown.to_string(), "shut_down");
    }

    #[test]
    fn test_model_label_prefers_gguf_name() {
        let mut summary = ModelSummary {
            path: "/data/user/0/com.example.offgrid/files/qwen.gguf".to_string(),
            ..Default::default()
        };
        assert_eq!(summary.label(), "qwen.gguf");

        summary.name = Some("Qwen2.5 Coder 0.5B".to_string());
        assert_eq!(summary.label(), "Qwen2.5 Coder 0.5B");
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snapshot = StatusSnapshot {
            stage: EngineStage::Ready,
            backend_ready: true,
            model: None,
            position: 17,
            n_ctx: 2048,
            remaining_budget: Some(5),
            last_error: None,
            config: EngineConfig::default(),
        };
        let value: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(value["stage"], "ready");
        assert_eq!(value["position"], 17);
        assert_eq!(value["config"]["n_batch"], 512);
    }
}
