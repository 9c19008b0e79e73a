//! Small shared helpers for the backends.

/// Case-insensitive wildcard match; both `*` and `%` match any run of
/// characters.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_lowercase().replace('%', "*");
    let name = name.to_lowercase();
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = name.as_str();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // Without a trailing wildcard the final segment must close out the name
    if !pattern.ends_with('*') {
        segments
            .last()
            .map(|s| s.is_empty() || name.ends_with(&s.to_lowercase()) && rest.is_empty())
            .unwrap_or(true)
    } else {
        true
    }
}

/// Quote a string literal for embedding in SQL text.
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(wildcard_match("created_at", "created_at"));
        assert!(!wildcard_match("created_at", "created"));
    }

    #[test]
    fn test_prefix_wildcard() {
        assert!(wildcard_match("created*", "created_at"));
        assert!(wildcard_match("*_at", "created_at"));
        assert!(!wildcard_match("*_at", "created_on"));
    }

    #[test]
    fn test_percent_and_case() {
        assert!(wildcard_match("%AT", "created_at"));
        assert!(wildcard_match("CREATED%", "created_at"));
    }

    #[test]
    fn test_inner_wildcard() {
        assert!(wildcard_match("c*_at", "created_at"));
        assert!(!wildcard_match("x*_at", "created_at"));
    }

    #[test]
    fn test_sql_quote_escapes() {
        assert_eq!(sql_quote("it's"), "'it''s'");
    }
}
