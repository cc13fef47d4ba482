//! Changelog summarization hook.
//!
//! Summaries are optional decoration: a summarizer that fails, returns
//! nothing, or exceeds its deadline leaves the candidate's summary unset.

use async_trait::async_trait;

/// Turns changelog text into a short summary.
#[async_trait]
pub trait ChangelogSummarizer: Send + Sync {
    async fn summarize(&self, changelog: &str) -> Option<String>;
}

/// Maximum length of an extractive summary, in characters.
pub const MAX_SUMMARY_CHARS: usize = 140;

/// Summarizer that keeps the first sentence of the first non-empty line,
/// with markup removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstSentenceSummarizer;

#[async_trait]
impl ChangelogSummarizer for FirstSentenceSummarizer {
    async fn summarize(&self, changelog: &str) -> Option<String> {
        first_sentence(changelog)
    }
}

/// Remove `<...>` tags and common list/heading markers.
pub fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            _ => out.push(c),
        }
    }
    out
}

pub fn first_sentence(changelog: &str) -> Option<String> {
    let plain = strip_markup(changelog);
    let line = plain
        .lines()
        .map(|line| line.trim().trim_start_matches(['#', '*', '-', ' ']).trim())
        .find(|line| !line.is_empty())?;

    let sentence = match line.find(". ") {
        Some(end) => &line[..=end],
        None => line,
    };

    let mut summary: String = sentence.chars().take(MAX_SUMMARY_CHARS).collect();
    if sentence.chars().count() > MAX_SUMMARY_CHARS {
        summary.push('…');
    }
    Some(summary)
}
