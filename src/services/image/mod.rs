use crate::core::config::Config;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod gradio;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    /// Label the service shows for this size. Defaults to the reduced ratio.
    #[serde(default)]
    pub aspect: Option<String>,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, aspect: None }
    }

    pub fn aspect(&self) -> String {
        if let Some(aspect) = &self.aspect {
            return aspect.clone();
        }
        fn gcd(a: u32, b: u32) -> u32 {
            if b == 0 { a } else { gcd(b, a % b) }
        }
        let d = gcd(self.width, self.height).max(1);
        format!("{}:{}", self.width / d, self.height / d)
    }
}

/// Wire form the service expects: `1024x1024 ( 1:1 )`.
impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} ( {} )", self.width, self.height, self.aspect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub resolution: Resolution,
    pub seed: u64,
    pub steps: u32,
    pub shift: f64,
    pub random_seed: bool,
}

/// Reference to an image produced by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub path: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub images: Vec<ImageRef>,
    pub seed_label: String,
    pub seed: u64,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("no images returned")]
    EmptyResult,
    #[error("image not found: {0}")]
    MissingFile(String),
    #[error("failed to save image: {0}")]
    Copy(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            GenerationError::Connection(e.to_string())
        } else if e.is_decode() {
            GenerationError::Protocol(e.to_string())
        } else {
            GenerationError::Remote(e.to_string())
        }
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest)
        -> Result<GenerationResult, GenerationError>;

    /// Resolves an image reference to its bytes.
    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, GenerationError>;

    /// Fixed per-call parameters; the driver fills in prompt and seed.
    fn request_template(&self) -> GenerationRequest;
}

/// Connects to the configured service. Failing to reach it is fatal.
pub async fn create_image_generator(config: &Config) -> Result<Box<dyn ImageGenerator>> {
    info!("Initializing image generator for provider: {}", config.generator.provider);
    match config.generator.provider.as_str() {
        "gradio" => Ok(Box::new(
            gradio::GradioImageClient::connect(config.generator.gradio.clone()).await?,
        )),
        _ => Err(anyhow!("Unknown image provider: {}", config.generator.provider)),
    }
}
