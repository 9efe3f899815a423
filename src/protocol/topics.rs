//! Topic name and topic filter handling.
//!
//! Pure functions: validation of publish topics and subscription filters,
//! and wildcard matching per MQTT 3.1.1 section 4.7 (`+` matches one level,
//! `#` matches the remainder, neither matches `$`-prefixed topics from the
//! first level).

use crate::error::SessionError;

/// Longest topic the protocol can express (u16 length prefix).
const MAX_TOPIC_LEN: usize = u16::MAX as usize;

fn check_common(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("topic exceeds {MAX_TOPIC_LEN} bytes"));
    }
    if topic.contains('\0') {
        return Err("topic must not contain NUL".to_string());
    }
    Ok(())
}

/// Validate a topic name used for publishing. Wildcards are not allowed.
pub fn validate_publish_topic(topic: &str) -> Result<(), SessionError> {
    check_common(topic).map_err(SessionError::InvalidTopic)?;
    if topic.contains('+') || topic.contains('#') {
        return Err(SessionError::InvalidTopic(format!(
            "publish topic {topic:?} must not contain wildcards"
        )));
    }
    Ok(())
}

/// Validate a subscription filter, including wildcard placement rules.
pub fn validate_filter(filter: &str) -> Result<(), SessionError> {
    check_common(filter).map_err(SessionError::InvalidTopic)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('+') && *level != "+" {
            return Err(SessionError::InvalidTopic(format!(
                "'+' must occupy a whole level in {filter:?}"
            )));
        }
        if level.contains('#') {
            if *level != "#" {
                return Err(SessionError::InvalidTopic(format!(
                    "'#' must occupy a whole level in {filter:?}"
                )));
            }
            if i != levels.len() - 1 {
                return Err(SessionError::InvalidTopic(format!(
                    "'#' must be the last level in {filter:?}"
                )));
            }
        }
    }
    Ok(())
}

/// Does `filter` match `topic`?
///
/// Both inputs are assumed valid. Topics beginning with `$` (broker-internal
/// topics such as `$SYS/...`) are never matched by a filter whose first level
/// is a wildcard.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // '#' swallows the rest of the topic, including zero levels
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
