use super::request::{AspectRatio, GenerationRequest, SegmentationMode, VisualStyle};
use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use tracing::{debug, warn};

/// Clip lengths the provider accepts. Anything else is rejected upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SegmentDuration {
    Four,
    Eight,
    Twelve,
}

impl SegmentDuration {
    pub const ALL: [SegmentDuration; 3] = [
        SegmentDuration::Four,
        SegmentDuration::Eight,
        SegmentDuration::Twelve,
    ];

    pub fn secs(&self) -> u32 {
        match self {
            SegmentDuration::Four => 4,
            SegmentDuration::Eight => 8,
            SegmentDuration::Twelve => 12,
        }
    }

    /// Nearest accepted value; ties resolve to the longer clip.
    pub fn nearest(secs: f64) -> Self {
        let mut best = SegmentDuration::Four;
        let mut best_distance = f64::MAX;
        for candidate in Self::ALL {
            let distance = (candidate.secs() as f64 - secs).abs();
            if distance <= best_distance {
                best = candidate;
                best_distance = distance;
            }
        }
        best
    }

    pub fn smallest() -> Self {
        SegmentDuration::Four
    }

    pub fn largest() -> Self {
        SegmentDuration::Twelve
    }
}

impl TryFrom<u32> for SegmentDuration {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            4 => Ok(SegmentDuration::Four),
            8 => Ok(SegmentDuration::Eight),
            12 => Ok(SegmentDuration::Twelve),
            other => Err(format!("unsupported clip duration {}s", other)),
        }
    }
}

impl From<SegmentDuration> for u32 {
    fn from(value: SegmentDuration) -> Self {
        value.secs()
    }
}

impl fmt::Display for SegmentDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.secs())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentStyle {
    pub aspect_ratio: AspectRatio,
    pub visual_style: VisualStyle,
}

impl Default for SegmentStyle {
    fn default() -> Self {
        Self {
            aspect_ratio: AspectRatio::Wide,
            visual_style: VisualStyle::default(),
        }
    }
}

/// One planned clip of the final video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// 1-based ordinal
    pub index: u32,
    pub total_segments: u32,
    pub duration: SegmentDuration,
    pub narration: String,
    pub style: SegmentStyle,
}

impl Segment {
    pub fn is_first(&self) -> bool {
        self.index == 1
    }

    pub fn is_last(&self) -> bool {
        self.index == self.total_segments
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Narration characters one 12 second clip can voice. Shorter clips get a
    /// proportional share.
    pub chars_per_12s: usize,
    /// Characters that end a sentence.
    pub sentence_terminators: String,
    /// Upper bound on clips in parts mode.
    pub max_parts: u32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            chars_per_12s: 50,
            sentence_terminators: String::from("。.!?！？"),
            max_parts: 4,
        }
    }
}

const ELLIPSIS: char = '…';

pub struct SegmentPlanner {
    config: PlannerConfig,
    sentence_re: Regex,
}

impl SegmentPlanner {
    pub fn new(config: PlannerConfig) -> Result<Self> {
        if config.sentence_terminators.is_empty() {
            return Err(PipelineError::Config(
                "at least one sentence terminator is required".into(),
            ));
        }
        if config.chars_per_12s == 0 {
            return Err(PipelineError::Config("chars_per_12s must be positive".into()));
        }
        let class: String = config
            .sentence_terminators
            .chars()
            .map(|c| regex::escape(&c.to_string()))
            .collect();
        let sentence_re = Regex::new(&format!("[^{class}]+[{class}]*"))
            .map_err(|e| PipelineError::Config(format!("bad sentence terminators: {}", e)))?;
        Ok(Self {
            config,
            sentence_re,
        })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Character budget for a clip of the given length.
    pub fn ceiling_for(&self, duration: SegmentDuration) -> usize {
        (self.config.chars_per_12s * duration.secs() as usize / 12).max(1)
    }

    /// Plan a request and stamp its style onto every segment.
    pub fn plan_request(&self, request: &GenerationRequest) -> Result<Vec<Segment>> {
        let style = SegmentStyle {
            aspect_ratio: request.aspect_ratio,
            visual_style: request.visual_style.clone(),
        };
        let mut segments = self.plan(&request.narration, request.total_duration_secs, request.mode)?;
        for segment in &mut segments {
            segment.style = style.clone();
        }
        Ok(segments)
    }

    pub fn plan(
        &self,
        narration: &str,
        total_duration: u32,
        mode: SegmentationMode,
    ) -> Result<Vec<Segment>> {
        let narration = narration.trim();
        if narration.is_empty() {
            return Err(PipelineError::InvalidInput("narration is empty".into()));
        }

        let smallest = SegmentDuration::smallest().secs();
        let total_duration = if total_duration < smallest {
            warn!(
                requested = total_duration,
                clamped = smallest,
                "target duration below the shortest clip, clamping"
            );
            smallest
        } else {
            total_duration
        };

        let (count, duration) = match mode {
            SegmentationMode::Single => (1, SegmentDuration::nearest(total_duration as f64)),
            SegmentationMode::Scenes => {
                let count = scene_count(total_duration);
                (
                    count,
                    SegmentDuration::nearest(total_duration as f64 / count as f64),
                )
            }
            SegmentationMode::Parts => {
                let unit = SegmentDuration::largest().secs();
                let count = total_duration
                    .div_ceil(unit)
                    .clamp(1, self.config.max_parts.max(1));
                (count, SegmentDuration::largest())
            }
        };

        // Every segment needs at least one spoken character of narration
        let visible = narration.chars().filter(|c| self.is_spoken(*c)).count() as u32;
        if visible == 0 {
            return Err(PipelineError::InvalidInput(
                "narration has no spoken text".into(),
            ));
        }
        let count = if count > visible {
            warn!(
                planned = count,
                reduced = visible,
                "narration too short for the planned segment count, reducing"
            );
            visible
        } else {
            count
        };

        let ceiling = self.ceiling_for(duration);
        let slices = if count == 1 {
            vec![narration.to_string()]
        } else {
            self.split(narration, count as usize)
        };

        let segments: Vec<Segment> = slices
            .iter()
            .enumerate()
            .map(|(i, slice)| Segment {
                index: i as u32 + 1,
                total_segments: count,
                duration,
                narration: self.fit_to_ceiling(slice, ceiling),
                style: SegmentStyle::default(),
            })
            .collect();

        debug!(
            segments = segments.len(),
            duration = %duration,
            ceiling,
            ?mode,
            "planned narration"
        );
        Ok(segments)
    }

    fn is_terminator(&self, c: char) -> bool {
        self.config.sentence_terminators.contains(c)
    }

    fn is_spoken(&self, c: char) -> bool {
        !c.is_whitespace() && !self.is_terminator(c)
    }

    fn sentences(&self, text: &str) -> Vec<Range<usize>> {
        self.sentence_re
            .find_iter(text)
            .filter(|m| !m.as_str().trim().is_empty())
            .map(|m| m.range())
            .collect()
    }

    /// Split into `count` contiguous groups of whole sentences; the last group
    /// absorbs the remainder.
    fn split(&self, text: &str, count: usize) -> Vec<String> {
        let sentences = self.sentences(text);
        let per_group = sentences.len() / count;
        if per_group == 0 {
            return self.split_chars(text, count);
        }

        (0..count)
            .map(|i| {
                let first = i * per_group;
                let last = if i + 1 == count {
                    sentences.len() - 1
                } else {
                    first + per_group - 1
                };
                text[sentences[first].start..sentences[last].end]
                    .trim()
                    .to_string()
            })
            .collect()
    }

    /// Cut into `count` runs holding near-equal numbers of spoken characters.
    /// Callers guarantee at least `count` of them.
    fn split_chars(&self, text: &str, count: usize) -> Vec<String> {
        let spoken: Vec<usize> = text
            .char_indices()
            .filter(|(_, c)| self.is_spoken(*c))
            .map(|(i, _)| i)
            .collect();
        let len = spoken.len();
        (0..count)
            .map(|i| {
                let start = if i == 0 { 0 } else { spoken[i * len / count] };
                let end = if i + 1 == count {
                    text.len()
                } else {
                    spoken[(i + 1) * len / count]
                };
                text[start..end].trim().to_string()
            })
            .collect()
    }

    /// Keep whole sentences up to the ceiling, otherwise hard-cut with an ellipsis.
    fn fit_to_ceiling(&self, text: &str, ceiling: usize) -> String {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= ceiling {
            return text.to_string();
        }

        let window = &chars[..ceiling];
        if let Some(end) = window.iter().rposition(|c| self.is_terminator(*c)) {
            let kept: String = window[..=end].iter().collect();
            let kept = kept.trim();
            if kept.chars().any(|c| !self.is_terminator(c)) {
                return kept.to_string();
            }
        }

        let mut cut: String = chars[..ceiling - 1].iter().collect();
        cut.truncate(cut.trim_end().len());
        cut.push(ELLIPSIS);
        cut
    }
}

/// Scene count policy for scenes mode.
fn scene_count(total_duration: u32) -> u32 {
    match total_duration {
        0..=4 => 2,
        5..=8 => 3,
        _ => 4,
    }
}
