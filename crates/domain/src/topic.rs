//! Topic names and topic filters, following MQTT 3.1.1 §4.7.
//!
//! Topic names are concrete (`home/kitchen/temp`). Topic filters may contain
//! `+` (exactly one level) and a trailing `#` (zero or more levels). Topics
//! starting with `$` are never matched by a filter whose first level is a
//! wildcard.

use crate::error::ValidationError;

/// Universal wildcard used by the bridge to observe all broker traffic.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Check that `topic` can be used as a publish topic.
///
/// # Errors
///
/// Returns [`ValidationError::EmptyTopic`] for an empty name and
/// [`ValidationError::WildcardInTopic`] when it contains `+` or `#`.
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    if topic.contains(['+', '#', '\0']) {
        return Err(ValidationError::WildcardInTopic(topic.to_string()));
    }
    Ok(())
}

/// Check that `filter` can be used in a subscription.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidTopicFilter`] when a wildcard does not
/// occupy a whole level or `#` is not the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }
    let invalid = || ValidationError::InvalidTopicFilter(filter.to_string());
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            MULTI_LEVEL_WILDCARD if levels.peek().is_some() => return Err(invalid()),
            MULTI_LEVEL_WILDCARD | SINGLE_LEVEL_WILDCARD => {}
            literal if literal.contains(['+', '#', '\0']) => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `filter` contains at least one wildcard level.
#[must_use]
pub fn is_wildcard_filter(filter: &str) -> bool {
    filter
        .split('/')
        .any(|level| level == MULTI_LEVEL_WILDCARD || level == SINGLE_LEVEL_WILDCARD)
}

/// Whether the concrete `topic` is selected by `filter`.
///
/// Both arguments are assumed valid; use [`validate_topic_name`] and
/// [`validate_topic_filter`] at the boundary.
#[must_use]
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('#') || filter.starts_with('+')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            MULTI_LEVEL_WILDCARD => return true,
            SINGLE_LEVEL_WILDCARD => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}
