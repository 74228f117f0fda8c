use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:9", alias = "wide")]
    Wide,
    #[serde(rename = "9:16", alias = "tall")]
    Tall,
    #[serde(rename = "1:1", alias = "square")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Wide => "16:9",
            AspectRatio::Tall => "9:16",
            AspectRatio::Square => "1:1",
        }
    }

    pub fn composition_hint(&self) -> &'static str {
        match self {
            AspectRatio::Wide => "wide cinematic composition, landscape orientation",
            AspectRatio::Tall => "vertical mobile-first composition, portrait orientation",
            AspectRatio::Square => "square composition, balanced framing",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visual style name as chosen in the scenario editor. Open set: unknown names
/// are carried through and resolved to a generic descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisualStyle(pub String);

impl VisualStyle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn descriptor(&self) -> &'static str {
        match self.0.as_str() {
            "Photorealistic" => "photorealistic, cinematic, high-quality film production",
            "Anime" => "anime style, vibrant colors, Japanese animation aesthetic",
            "Illustration" => "illustrated, artistic, hand-drawn aesthetic",
            "3D Render" => "3D rendered, modern CGI, polished digital art",
            "Minimalist" => "minimalist, clean design, simple geometric shapes",
            _ => "professional, high-quality",
        }
    }
}

impl Default for VisualStyle {
    fn default() -> Self {
        Self::new("Photorealistic")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    /// One clip for the whole narration.
    Single,
    /// Scene count derived from the target duration.
    Scenes,
    /// Fixed 12 second parts covering the target duration.
    Parts,
}

impl SegmentationMode {
    pub fn is_multi(&self) -> bool {
        !matches!(self, SegmentationMode::Single)
    }
}

fn default_language() -> String {
    String::from("Japanese")
}

/// Everything needed to produce one promotional video. Never mutated once a run
/// has started; the snapshot carries its own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub book_id: String,
    #[serde(default)]
    pub book_title: Option<String>,
    pub narration: String,
    pub total_duration_secs: u32,
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub visual_style: VisualStyle,
    pub mode: SegmentationMode,
    #[serde(default = "default_language")]
    pub narration_language: String,
    /// Optional still used as the first frame (image-to-video).
    #[serde(default)]
    pub reference_image: Option<PathBuf>,
}

impl GenerationRequest {
    pub fn new(
        book_id: impl Into<String>,
        narration: impl Into<String>,
        total_duration_secs: u32,
        aspect_ratio: AspectRatio,
        mode: SegmentationMode,
    ) -> Self {
        Self {
            book_id: book_id.into(),
            book_title: None,
            narration: narration.into(),
            total_duration_secs,
            aspect_ratio,
            visual_style: VisualStyle::default(),
            mode,
            narration_language: default_language(),
            reference_image: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.book_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("book_id is empty".into()));
        }
        if self.narration.trim().is_empty() {
            return Err(PipelineError::InvalidInput("narration is empty".into()));
        }
        if let Some(image) = &self.reference_image {
            if !image.is_file() {
                return Err(PipelineError::InvalidInput(format!(
                    "reference image {} does not exist",
                    image.display()
                )));
            }
        }
        Ok(())
    }
}

/// File-system friendly form of a book identifier.
///
/// Identifiers that are already safe are kept as they are. Anything else is
/// cleaned and suffixed with `.` plus a digest of the raw id, so two distinct
/// ids never share a directory.
pub fn safe_name(book_id: &str) -> String {
    let cleaned: String = book_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('_');
    if !trimmed.is_empty() && trimmed == book_id {
        return trimmed.to_string();
    }

    let stem = if trimmed.is_empty() { "book" } else { trimmed };
    let digest = format!("{:x}", Sha256::digest(book_id.as_bytes()));
    format!("{}.{}", stem, &digest[..12])
}
