use super::{GenerationError, GenerationRequest, GenerationResult, ImageGenerator, ImageRef, Resolution};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GradioConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_name")]
    pub api_name: String,
    #[serde(default = "default_size")]
    pub width: u32,
    #[serde(default = "default_size")]
    pub height: u32,
    #[serde(default)]
    pub aspect: Option<String>,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_shift")]
    pub shift: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for GradioConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_name: default_api_name(),
            width: default_size(),
            height: default_size(),
            aspect: None,
            steps: default_steps(),
            shift: default_shift(),
            timeout_seconds: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:7860".to_string()
}
fn default_api_name() -> String {
    "/generate".to_string()
}
fn default_size() -> u32 {
    1024
}
fn default_steps() -> u32 {
    8
}
fn default_shift() -> f64 {
    3.0
}
fn default_timeout() -> u64 {
    300
}

/// Client for a Gradio app's `generate` endpoint (Z-Image-Turbo and friends).
pub struct GradioImageClient {
    config: GradioConfig,
    base: Url,
    client: Client,
}

impl GradioImageClient {
    /// Builds the client and checks the service answers.
    pub async fn connect(config: GradioConfig) -> Result<Self> {
        let client = Self::new(config)?;
        let config_url = client.endpoint("config");
        info!("Connecting to image service at {}", client.base);
        client
            .client
            .get(&config_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Image service not reachable at {}", client.base))?;
        Ok(client)
    }

    pub fn new(config: GradioConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid base_url: {}", config.base_url))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, base, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }

    fn call_endpoint(&self) -> String {
        self.endpoint(&format!("gradio_api/call/{}", self.config.api_name.trim_start_matches('/')))
    }

    fn file_url(&self, path: &str) -> String {
        self.endpoint(&format!("gradio_api/file={}", path))
    }
}

/// Positional arguments of the `generate` endpoint.
pub fn build_payload(request: &GenerationRequest) -> Value {
    json!({
        "data": [
            request.prompt,
            request.resolution.to_string(),
            request.seed,
            request.steps,
            request.shift,
            request.random_seed,
            []
        ]
    })
}

/// Accepts a bare path, `{"image": ...}`, or a Gradio `FileData` object.
pub fn parse_image_ref(item: &Value) -> Option<ImageRef> {
    match item {
        Value::String(path) if !path.is_empty() => Some(ImageRef {
            path: path.clone(),
            url: None,
        }),
        Value::Object(map) => {
            if let Some(inner) = map.get("image") {
                return parse_image_ref(inner);
            }
            let path = map.get("path")?.as_str()?.to_string();
            let url = map.get("url").and_then(Value::as_str).map(str::to_string);
            Some(ImageRef { path, url })
        }
        _ => None,
    }
}

/// Decodes the `[gallery, seed_label, seed]` output tuple.
pub fn parse_output(data: &str) -> Result<GenerationResult, GenerationError> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| GenerationError::Protocol(format!("invalid output JSON: {}", e)))?;
    let outputs = value
        .as_array()
        .ok_or_else(|| GenerationError::Protocol(format!("expected output array, got {}", value)))?;

    let images = match outputs.first() {
        Some(Value::Array(gallery)) => gallery.iter().filter_map(parse_image_ref).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(GenerationError::Protocol(format!("unexpected gallery: {}", other)))
        }
    };

    let seed_label = match outputs.get(1) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let seed = outputs
        .get(2)
        .and_then(Value::as_u64)
        .or_else(|| seed_label.trim().parse().ok())
        .unwrap_or_default();

    Ok(GenerationResult {
        images,
        seed_label,
        seed,
    })
}

/// Incremental reader for the `/gradio_api/call/{api}/{event_id}` event stream.
#[derive(Default)]
pub struct EventStreamReader {
    buffer: Vec<u8>,
    event: String,
}

impl EventStreamReader {
    /// Returns the call outcome once a `complete` or `error` frame is seen.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Result<GenerationResult, GenerationError>> {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if let Some(name) = line.strip_prefix("event:") {
                self.event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                match self.event.as_str() {
                    "complete" => return Some(parse_output(data)),
                    "error" => {
                        let message = match data {
                            "" | "null" => "generation failed".to_string(),
                            other => other.trim_matches('"').to_string(),
                        };
                        return Some(Err(GenerationError::Remote(message)));
                    }
                    _ => {}
                }
            }
        }
        None
    }
}

#[async_trait]
impl ImageGenerator for GradioImageClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        debug!("Submitting generation request (seed {})", request.seed);
        let submit = self
            .client
            .post(self.call_endpoint())
            .json(&build_payload(request))
            .send()
            .await?;
        if !submit.status().is_success() {
            let status = submit.status();
            let body = submit.text().await.unwrap_or_default();
            return Err(GenerationError::Remote(format!("{}: {}", status, body)));
        }
        let submitted: Value = submit.json().await?;
        let event_id = submitted["event_id"]
            .as_str()
            .ok_or_else(|| GenerationError::Protocol(format!("no event_id in {}", submitted)))?;
        debug!("Event id: {}", event_id);

        let mut stream = self
            .client
            .get(format!("{}/{}", self.call_endpoint(), event_id))
            .send()
            .await?
            .error_for_status()?
            .bytes_stream();

        let mut reader = EventStreamReader::default();
        while let Some(chunk) = stream.next().await {
            if let Some(outcome) = reader.feed(&chunk?) {
                return outcome;
            }
        }
        Err(GenerationError::Protocol(
            "event stream ended without a result".to_string(),
        ))
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>, GenerationError> {
        // Same machine as the service: the file is already on disk.
        let local = tokio::fs::metadata(&image.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if local {
            return tokio::fs::read(&image.path)
                .await
                .map_err(|e| GenerationError::MissingFile(format!("{}: {}", image.path, e)));
        }

        let url = image
            .url
            .clone()
            .unwrap_or_else(|| self.file_url(&image.path));
        debug!("Downloading image from {}", url);
        let resp = self.client.get(&url).send().await?;
        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                return Err(GenerationError::MissingFile(image.path.clone()))
            }
            s => return Err(GenerationError::Remote(format!("{} downloading {}", s, url))),
        }
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(GenerationError::MissingFile(image.path.clone()));
        }
        Ok(bytes.to_vec())
    }

    fn request_template(&self) -> GenerationRequest {
        GenerationRequest {
            prompt: String::new(),
            resolution: Resolution {
                width: self.config.width,
                height: self.config.height,
                aspect: self.config.aspect.clone(),
            },
            seed: 0,
            steps: self.config.steps,
            shift: self.config.shift,
            random_seed: false,
        }
    }
}
