//! Storage partition names derived from photo metadata.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::PhotoItem;

/// Used when neither the configured default nor any candidate survives sanitising.
pub const FALLBACK_CATEGORY: &str = "uncategorized";

const MAX_CATEGORY_LEN: usize = 50;

static SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\s/?%*:|"<>\\.]+"#).expect("valid separator regex"));

/// Lowercase, collapse separators into single hyphens, trim hyphens, cap length.
/// Returns `None` when nothing usable is left.
pub fn sanitize(candidate: &str) -> Option<String> {
    let lowered = candidate.to_lowercase();
    let hyphenated = SEPARATORS.replace_all(&lowered, "-");
    let trimmed = hyphenated.trim_matches('-');
    let capped: String = trimmed.chars().take(MAX_CATEGORY_LEN).collect();
    let capped = capped.trim_end_matches('-');
    if capped.is_empty() {
        None
    } else {
        Some(capped.to_string())
    }
}

/// Primary topic slug, then first tag title, then `default`.
pub fn resolve_category(item: &PhotoItem, default: &str) -> String {
    let topic = item.topics.first().and_then(|t| t.slug.as_deref());
    let tag = item.tags.first().and_then(|t| t.title.as_deref());

    topic
        .into_iter()
        .chain(tag)
        .chain(std::iter::once(default))
        .find_map(sanitize)
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}
