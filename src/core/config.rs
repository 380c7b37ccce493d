use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::services::image::gradio::GradioConfig;
use crate::services::workflow::SelectionPolicy;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_output")]
    pub output_folder: String,

    /// Replaces the built-in preset catalog when set.
    #[serde(default)]
    pub catalog_file: Option<String>,

    /// Existing outputs at or below this size are regenerated.
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    #[serde(default)]
    pub selection: SelectionPolicy,

    #[serde(default)]
    pub generator: GeneratorConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default)]
    pub gradio: GradioConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            gradio: GradioConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_folder: default_output(),
            catalog_file: None,
            min_file_size: default_min_file_size(),
            request_delay_ms: default_request_delay_ms(),
            selection: SelectionPolicy::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

fn default_output() -> String {
    "images".to_string()
}
fn default_min_file_size() -> u64 {
    100_000
}
fn default_request_delay_ms() -> u64 {
    500
}
fn default_generator_provider() -> String {
    "gradio".to_string()
}

impl Config {
    /// Loads `config.yml` from the working directory, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Path::new(CONFIG_FILE);
        if !path.exists() {
            info!("{} not found, using defaults", CONFIG_FILE);
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.output_folder)
            .with_context(|| format!("Failed to create output folder {}", self.output_folder))?;
        Ok(())
    }
}
