use crate::model::{CompositeInput, WorkItem};

const ANALYSIS_TEMPLATE: &str = r#"You are annotating a short-form video for a content library.

Engagement: {views} views, {likes} likes, {comments} comments, {shares} shares, {duration}s long.
Primary source: {primary}

{sources}

Respond with a single JSON object and nothing else:
{"classification": string, "primary_factors": [1-5 strings, most important first], "opening_strategy": string, "confidence": number between 0 and 1}
Add any other fields you find useful. If the material is insufficient, say so plainly instead of guessing."#;

/// Render the analysis prompt for one item.
pub fn build(item: &WorkItem, input: &CompositeInput) -> String {
    let primary = input
        .primary_source
        .map(|s| s.as_str())
        .unwrap_or("none");
    ANALYSIS_TEMPLATE
        .replace("{views}", &item.stats.views.to_string())
        .replace("{likes}", &item.stats.likes.to_string())
        .replace("{comments}", &item.stats.comments.to_string())
        .replace("{shares}", &item.stats.shares.to_string())
        .replace("{duration}", &item.stats.duration_seconds.to_string())
        .replace("{primary}", primary)
        .replace("{sources}", &input.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceBlock, SourceTag};

    #[test]
    fn prompt_includes_sources_and_stats() {
        let mut item = WorkItem {
            external_id: "v".into(),
            ..Default::default()
        };
        item.stats.views = 1200;
        let input = CompositeInput::from_blocks(vec![SourceBlock {
            tag: SourceTag::Transcript,
            text: "welcome to the channel".into(),
        }]);
        let prompt = build(&item, &input);
        assert!(prompt.contains("1200 views"));
        assert!(prompt.contains("Primary source: transcript"));
        assert!(prompt.contains("[TRANSCRIPT]\nwelcome to the channel"));
    }
}
