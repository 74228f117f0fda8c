use super::dto::{error_message, CreateVideoBody};
use crate::config::ProviderConfig;
use crate::error::{PipelineError, Result};
use crate::ports::provider::{VideoCreateRequest, VideoJob, VideoProvider};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{header, Client, Response};
use std::path::Path;
use tracing::{debug, instrument};

/// Client for `{base}/videos`.
#[derive(Debug, Clone)]
pub struct OpenAiVideoClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiVideoClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    async fn reference_part(path: &Path) -> Result<Part> {
        let data = tokio::fs::read(path).await.map_err(|e| PipelineError::InvalidInput(
            format!("reference image {}: {}", path.display(), e),
        ))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("reference.png"));

        Part::bytes(data)
            .file_name(file_name)
            .mime_str(image_mime(path))
            .map_err(|e| PipelineError::InvalidInput(format!("reference image: {}", e)))
    }
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

/// Status code and error text of a non-success response.
async fn read_failure(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    (status, error_message(&body))
}

fn is_video_content(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("video/") || ct.starts_with("application/octet-stream")
        }
    }
}

#[async_trait]
impl VideoProvider for OpenAiVideoClient {
    #[instrument(skip(self, request), fields(model = %request.model, seconds = %request.seconds, size = %request.size))]
    async fn create_video(&self, request: &VideoCreateRequest) -> Result<VideoJob> {
        let url = format!("{}/videos", self.base_url);
        debug!(url = %url, with_reference = request.input_reference.is_some(), "Submitting video job");

        let builder = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.auth());

        let builder = match &request.input_reference {
            Some(path) => {
                let form = Form::new()
                    .text("model", request.model.clone())
                    .text("prompt", request.prompt.clone())
                    .text("seconds", request.seconds.clone())
                    .text("size", request.size.clone())
                    .part("input_reference", Self::reference_part(path).await?);
                builder.multipart(form)
            }
            None => builder.json(&CreateVideoBody {
                model: &request.model,
                prompt: &request.prompt,
                seconds: &request.seconds,
                size: &request.size,
            }),
        };

        let response = builder.send().await.map_err(|e| PipelineError::Submission {
            status: e.status().map(|s| s.as_u16()),
            message: format!("request failed: {}", e),
        })?;

        if !response.status().is_success() {
            let (status, message) = read_failure(response).await;
            return Err(PipelineError::Submission {
                status: Some(status),
                message,
            });
        }

        response.json::<VideoJob>().await.map_err(|e| PipelineError::Submission {
            status: None,
            message: format!("unexpected response shape: {}", e),
        })
    }

    #[instrument(skip(self))]
    async fn retrieve_video(&self, video_id: &str) -> Result<VideoJob> {
        let url = format!("{}/videos/{}", self.base_url, video_id);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.auth())
            .send()
            .await
            .map_err(|e| PipelineError::Poll {
                status: e.status().map(|s| s.as_u16()),
                message: format!("request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let (status, message) = read_failure(response).await;
            return Err(PipelineError::Poll {
                status: Some(status),
                message,
            });
        }

        response.json::<VideoJob>().await.map_err(|e| PipelineError::Poll {
            status: None,
            message: format!("unexpected response shape: {}", e),
        })
    }

    #[instrument(skip(self))]
    async fn download_content(&self, video_id: &str) -> Result<Bytes> {
        let url = format!("{}/videos/{}/content", self.base_url, video_id);

        let response = self
            .client
            .get(&url)
            .header(header::AUTHORIZATION, self.auth())
            .send()
            .await
            .map_err(|e| PipelineError::Download {
                status: e.status().map(|s| s.as_u16()),
                message: format!("request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let (status, message) = read_failure(response).await;
            return Err(PipelineError::Download {
                status: Some(status),
                message,
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !is_video_content(content_type.as_deref()) {
            return Err(PipelineError::Download {
                status: Some(response.status().as_u16()),
                message: format!(
                    "expected video content, got {}",
                    content_type.unwrap_or_default()
                ),
            });
        }

        let bytes = response.bytes().await.map_err(|e| PipelineError::Download {
            status: None,
            message: format!("reading body: {}", e),
        })?;
        if bytes.is_empty() {
            return Err(PipelineError::Download {
                status: None,
                message: String::from("empty video body"),
            });
        }
        debug!(bytes = bytes.len(), "Downloaded video content");
        Ok(bytes)
    }
}
