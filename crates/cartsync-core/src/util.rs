//! Shared utility functions used across multiple modules.

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Normalize a display name into a natural id.
///
/// Lowercases, trims and collapses inner whitespace runs to a single space,
/// so "  Whole   Milk " and "whole milk" match. Returns `None` for names
/// that are empty after trimming.
pub fn normalize_natural_id(name: &str) -> Option<String> {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" /tmp/cart.db ".to_string())),
            Some("/tmp/cart.db".to_string())
        );
    }

    #[test]
    fn natural_id_is_case_and_space_insensitive() {
        assert_eq!(normalize_natural_id("Milk").as_deref(), Some("milk"));
        assert_eq!(
            normalize_natural_id("  Whole \t  MILK ").as_deref(),
            Some("whole milk")
        );
        assert_eq!(normalize_natural_id(" \n "), None);
    }
}
