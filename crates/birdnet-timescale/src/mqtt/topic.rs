//! MQTT topic filter matching.

/// Check whether `topic` is matched by the subscription `filter`.
///
/// `+` matches exactly one level, `#` matches the remaining levels (including
/// none). Wildcards in the first level never match topics starting with `$`.
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();
    matches_levels(&filter_levels, &topic_levels)
}

fn matches_levels(filter: &[&str], topic: &[&str]) -> bool {
    match (filter.first(), topic.first()) {
        (None, None) => true,
        (Some(&"#"), _) => filter.len() == 1,
        (Some(_), None) | (None, Some(_)) => false,
        (Some(&"+"), Some(_)) => matches_levels(&filter[1..], &topic[1..]),
        (Some(f), Some(t)) => f == t && matches_levels(&filter[1..], &topic[1..]),
    }
}

/// Validate a subscription filter: non-empty, `#` only as the last level,
/// wildcards only as whole levels.
pub fn validate_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("Topic filter must not be empty".to_string());
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(format!(
                "Topic filter '{filter}': '#' must be the last level on its own"
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!(
                "Topic filter '{filter}': '+' must occupy a whole level"
            ));
        }
    }
    Ok(())
}
