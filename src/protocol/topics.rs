//! Topic name and topic filter rules
//!
//! Publish targets must be concrete topic names; subscriptions may use the
//! `+` (single level) and `#` (multi level, last position only) wildcards.

use thiserror::Error;

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains a NUL character")]
    NulCharacter,
    #[error("Topic name must not contain wildcards: {0}")]
    WildcardInName(String),
    #[error("Invalid wildcard placement in filter: {0}")]
    InvalidWildcard(String),
}

/// Validate a topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(TopicError::WildcardInName(topic.to_string()));
    }
    Ok(())
}

/// Validate a topic filter used for subscribing
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NulCharacter);
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        let valid = match *level {
            "#" => index == last,
            "+" => true,
            other => !other.contains('+') && !other.contains('#'),
        };
        if !valid {
            return Err(TopicError::InvalidWildcard(filter.to_string()));
        }
    }

    Ok(())
}

/// Check whether a concrete topic matches a (valid) filter
///
/// Topics starting with `$` are not matched by a leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
