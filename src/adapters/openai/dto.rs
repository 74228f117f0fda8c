//! Wire shapes for the videos API.

use serde::{Deserialize, Serialize};

/// JSON body of `POST /videos` when no reference image is attached.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct CreateVideoBody<'a> {
    pub model: &'a str,
    pub prompt: &'a str,
    pub seconds: &'a str,
    pub size: &'a str,
}

/// Error envelope returned with non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorEnvelope {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// Best human-readable message for an error response body.
pub(crate) fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorEnvelope>(body) {
        Ok(envelope) => {
            let error = envelope.error;
            match error.code.or(error.kind) {
                Some(code) => format!("{} ({})", error.message, code),
                None => error.message,
            }
        }
        Err(_) if body.trim().is_empty() => String::from("empty response body"),
        Err(_) => body.trim().to_string(),
    }
}
