use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use swap_core::FlowConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    pub data_dir: PathBuf,
    pub flow: FlowConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            flow: FlowConfig::default(),
        }
    }
}

impl CliConfig {
    /// Build from the command line, reading flow tuning from a JSON file
    /// when one is given.
    pub async fn load(data_dir: Option<PathBuf>, flow_config: Option<&Path>) -> anyhow::Result<Self> {
        let flow = match flow_config {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid flow config in {}", path.display()))?
            }
            None => FlowConfig::default(),
        };

        Ok(Self {
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            flow,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("htlc-swap")
}
