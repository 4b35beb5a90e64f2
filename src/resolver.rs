//! Gathers every available content source for a work item.
//!
//! Sources are attempted independently in priority order; a failing source is
//! omitted, never fatal. An item whose only source is its caption is not worth
//! a paid call and resolves to an empty (non-viable) input.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::media::MediaAnalyzer;
use crate::model::{CompositeInput, SourceBlock, SourceTag, WorkItem};

/// Transcripts at or below this many characters are ignored.
pub const MIN_TRANSCRIPT_CHARS: usize = 10;

/// Resolution order, highest priority first.
pub const RESOLUTION_ORDER: [SourceTag; 4] = [
    SourceTag::Transcript,
    SourceTag::DerivedVideoSummary,
    SourceTag::DerivedThumbnailSummary,
    SourceTag::Description,
];

#[derive(Clone)]
pub struct SourceResolver {
    media: Arc<dyn MediaAnalyzer>,
    max_video_seconds: u32,
}

impl SourceResolver {
    pub fn new(media: Arc<dyn MediaAnalyzer>, max_video_seconds: u32) -> Self {
        Self {
            media,
            max_video_seconds,
        }
    }

    pub async fn resolve(&self, item: &WorkItem) -> CompositeInput {
        let mut blocks = Vec::new();
        for tag in RESOLUTION_ORDER {
            if let Some(text) = self.attempt(tag, item).await {
                blocks.push(SourceBlock { tag, text });
            }
        }

        if blocks.iter().all(|b| b.tag == SourceTag::Description) {
            debug!(
                external_id = %item.external_id,
                has_caption = !blocks.is_empty(),
                "no source beyond the caption; item is not viable"
            );
            return CompositeInput::default();
        }
        CompositeInput::from_blocks(blocks)
    }

    async fn attempt(&self, tag: SourceTag, item: &WorkItem) -> Option<String> {
        match tag {
            SourceTag::Transcript => transcript(item),
            SourceTag::DerivedVideoSummary => {
                let url = non_empty(item.video_url.as_deref())?;
                match self.media.summarize_video(url, self.max_video_seconds).await {
                    Ok(summary) => non_empty(Some(summary.as_str())).map(str::to_string),
                    Err(err) => {
                        warn!(?err, external_id = %item.external_id, "video summary unavailable");
                        None
                    }
                }
            }
            SourceTag::DerivedThumbnailSummary => {
                let url = non_empty(item.thumbnail_url.as_deref())?;
                match self.media.summarize_image(url).await {
                    Ok(summary) => non_empty(Some(summary.as_str())).map(str::to_string),
                    Err(err) => {
                        warn!(?err, external_id = %item.external_id, "thumbnail summary unavailable");
                        None
                    }
                }
            }
            SourceTag::Description => description(item),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn transcript(item: &WorkItem) -> Option<String> {
    let text = non_empty(item.transcript.as_deref())?;
    (text.chars().count() > MIN_TRANSCRIPT_CHARS).then(|| text.to_string())
}

fn description(item: &WorkItem) -> Option<String> {
    let parts: Vec<&str> = [item.title.as_deref(), item.caption.as_deref()]
        .into_iter()
        .filter_map(non_empty)
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}
