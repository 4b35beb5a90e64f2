use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One backlog record to be enriched. Read-only once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkItem {
    #[serde(default)]
    pub id: i64,
    pub external_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub stats: EngagementStats,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EngagementStats {
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub comments: i64,
    #[serde(default)]
    pub shares: i64,
    #[serde(default)]
    pub duration_seconds: i64,
}

/// Content source kinds, declared from highest to lowest priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Transcript,
    DerivedVideoSummary,
    DerivedThumbnailSummary,
    Description,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Transcript => "transcript",
            SourceTag::DerivedVideoSummary => "derived_video_summary",
            SourceTag::DerivedThumbnailSummary => "derived_thumbnail_summary",
            SourceTag::Description => "description",
        }
    }

    pub fn parse_tag(s: &str) -> Option<Self> {
        match s {
            "transcript" => Some(SourceTag::Transcript),
            "derived_video_summary" => Some(SourceTag::DerivedVideoSummary),
            "derived_thumbnail_summary" => Some(SourceTag::DerivedThumbnailSummary),
            "description" => Some(SourceTag::Description),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            SourceTag::Transcript => "TRANSCRIPT",
            SourceTag::DerivedVideoSummary => "VIDEO SUMMARY",
            SourceTag::DerivedThumbnailSummary => "THUMBNAIL SUMMARY",
            SourceTag::Description => "DESCRIPTION",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlock {
    pub tag: SourceTag,
    pub text: String,
}

/// Labeled content gathered for a single item. Lives for one item only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeInput {
    pub blocks: Vec<SourceBlock>,
    pub primary_source: Option<SourceTag>,
}

impl CompositeInput {
    /// Build from blocks in any order; blocks are sorted by priority and
    /// the primary source is the highest-priority block present.
    pub fn from_blocks(mut blocks: Vec<SourceBlock>) -> Self {
        blocks.sort_by_key(|b| b.tag);
        let primary_source = blocks.first().map(|b| b.tag);
        Self {
            blocks,
            primary_source,
        }
    }

    pub fn is_viable(&self) -> bool {
        self.primary_source.is_some()
    }

    pub fn has(&self, tag: SourceTag) -> bool {
        self.blocks.iter().any(|b| b.tag == tag)
    }

    /// Render every block as a labeled section, highest priority first.
    pub fn render(&self) -> String {
        self.blocks
            .iter()
            .map(|b| format!("[{}]\n{}", b.tag.label(), b.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Structured annotation extracted from an inference response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructuredResult {
    pub classification: String,
    pub primary_factors: Vec<String>,
    #[serde(default)]
    pub opening_strategy: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_confidence() -> f64 {
    0.5
}

/// One persisted analysis per successfully processed item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub work_item_id: i64,
    pub external_id: String,
    pub primary_source: SourceTag,
    pub payload: StructuredResult,
    pub raw_input: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(
        item: &WorkItem,
        primary_source: SourceTag,
        payload: StructuredResult,
        raw_input: String,
        model: &str,
    ) -> Self {
        Self {
            work_item_id: item.id,
            external_id: item.external_id.clone(),
            primary_source,
            payload,
            raw_input,
            model: model.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Terminal classification of one item's processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    Error,
    Skipped,
}

impl ItemOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemOutcome::Success => "success",
            ItemOutcome::Error => "error",
            ItemOutcome::Skipped => "skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(tag: SourceTag, text: &str) -> SourceBlock {
        SourceBlock {
            tag,
            text: text.to_string(),
        }
    }

    #[test]
    fn primary_source_follows_priority_not_insertion_order() {
        let input = CompositeInput::from_blocks(vec![
            block(SourceTag::Description, "caption"),
            block(SourceTag::DerivedThumbnailSummary, "a dog on a beach"),
            block(SourceTag::Transcript, "hello and welcome back"),
        ]);
        assert_eq!(input.primary_source, Some(SourceTag::Transcript));
        assert_eq!(input.blocks[0].tag, SourceTag::Transcript);
        assert_eq!(input.blocks[2].tag, SourceTag::Description);
    }

    #[test]
    fn render_labels_each_block() {
        let input = CompositeInput::from_blocks(vec![
            block(SourceTag::Transcript, " words "),
            block(SourceTag::Description, "caption"),
        ]);
        assert_eq!(input.render(), "[TRANSCRIPT]\nwords\n\n[DESCRIPTION]\ncaption");
    }

    #[test]
    fn source_tag_round_trips_through_str() {
        for tag in [
            SourceTag::Transcript,
            SourceTag::DerivedVideoSummary,
            SourceTag::DerivedThumbnailSummary,
            SourceTag::Description,
        ] {
            assert_eq!(SourceTag::parse_tag(tag.as_str()), Some(tag));
        }
        assert_eq!(SourceTag::parse_tag("bogus"), None);
    }
}
