use similar::TextDiff;

/// Peels matching wrapping quotes off assistant output.
///
/// Remote augmentation sometimes returns the rewritten prompt wrapped in
/// double or single quotes, occasionally nested. Quotes are only removed in
/// matched pairs at both ends; interior quotes are preserved.
pub fn strip_wrapping_quotes(text: &str) -> String {
    let mut current = text.trim();
    loop {
        let bytes = current.as_bytes();
        if bytes.len() >= 2 {
            let first = bytes[0];
            let last = bytes[bytes.len() - 1];
            if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
                current = current[1..current.len() - 1].trim();
                continue;
            }
        }
        return current.to_string();
    }
}

/// Unified diff between the operator's prompt and the augmented rewrite,
/// one rendered line per entry. `None` when nothing changed.
pub fn prompt_diff(original: &str, augmented: &str) -> Option<Vec<String>> {
    if original == augmented {
        return None;
    }
    let diff = TextDiff::from_lines(original, augmented);
    let rendered = diff
        .unified_diff()
        .header("original", "augmented")
        .to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

#[cfg(test)]
mod tests {
    use super::{prompt_diff, strip_wrapping_quotes};

    #[test]
    fn strips_matched_double_quotes() {
        assert_eq!(
            strip_wrapping_quotes("\"baroque facade at dusk\""),
            "baroque facade at dusk"
        );
    }

    #[test]
    fn strips_nested_mixed_quotes_and_whitespace() {
        assert_eq!(
            strip_wrapping_quotes("  \" 'glass atrium' \"  "),
            "glass atrium"
        );
    }

    #[test]
    fn keeps_interior_and_unmatched_quotes() {
        assert_eq!(
            strip_wrapping_quotes("say \"hello\" twice"),
            "say \"hello\" twice"
        );
        assert_eq!(strip_wrapping_quotes("\"leading only"), "\"leading only");
        assert_eq!(strip_wrapping_quotes("\""), "\"");
    }

    #[test]
    fn strip_handles_empty_pair() {
        assert_eq!(strip_wrapping_quotes("\"\""), "");
        assert_eq!(strip_wrapping_quotes("   "), "");
    }

    #[test]
    fn diff_reports_changed_prompt() {
        let lines = prompt_diff("small house", "small house with a slate roof")
            .unwrap_or_default();
        assert!(lines.iter().any(|line| line.starts_with("-small house")));
        assert!(lines
            .iter()
            .any(|line| line.starts_with("+small house with a slate roof")));
    }

    #[test]
    fn diff_is_none_when_unchanged() {
        assert_eq!(prompt_diff("same", "same"), None);
    }
}
