use super::request::GenerationRequest;
use super::segments::Segment;

const SAFETY: &str = "Original characters only; do not depict any real person's identifiable face or likeness; no brands, trademarks or logos.";

/// Turns a segment into provider instruction text. Output depends only on the
/// inputs, so the same segment always yields the same bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptCompiler {
    strict_timing: bool,
}

impl PromptCompiler {
    pub fn new(strict_timing: bool) -> Self {
        Self { strict_timing }
    }

    pub fn compile(&self, segment: &Segment, request: &GenerationRequest) -> String {
        let secs = segment.duration.secs();
        let aspect = segment.style.aspect_ratio;
        let language = request.narration_language.as_str();

        let mut header = format!(
            "Book promotional video, {} seconds, cinematic style, {}.",
            secs, aspect
        );
        if let Some(title) = request.book_title.as_deref().filter(|t| !t.trim().is_empty()) {
            header.push_str(&format!(" Book: \"{}\".", title.trim()));
        }

        let mut lines = vec![
            header,
            format!(
                "Visual style: {}. Composition: {}.",
                segment.style.visual_style.descriptor(),
                aspect.composition_hint()
            ),
        ];

        if segment.total_segments > 1 {
            lines.push(format!(
                "Part {} of {}. {}",
                segment.index,
                segment.total_segments,
                transition_hint(segment)
            ));
        }

        lines.push(SAFETY.to_string());

        if self.strict_timing {
            lines.push(format!(
                "Strict timing: final output length must be {}±0.5 seconds. Do not end early; if under-length, extend shot holds.",
                secs
            ));
        }

        lines.push(format!("{} voice-over with background music.", language));

        format!(
            "{}\n\nVoice-over ({}): {}",
            lines.join("\n"),
            language,
            segment.narration
        )
    }
}

fn transition_hint(segment: &Segment) -> &'static str {
    if segment.is_first() {
        "Opening hook: establish the world and grab attention immediately."
    } else if segment.is_last() {
        "Resolution: bring the story beat to a close and end on a memorable final image."
    } else {
        "Build: raise tension and carry momentum from the previous part."
    }
}
