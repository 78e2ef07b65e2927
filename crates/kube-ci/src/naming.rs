//! Resource naming helpers.
//!
//! Execution identifiers double as Job names and, under the per-execution
//! namespace policy, namespace names. Both must be RFC 1123 labels.

/// Maximum length of a Kubernetes DNS label.
pub const MAX_NAME_LENGTH: usize = 63;

/// Convert a caller-supplied identifier into a legal resource name.
///
/// Lowercases, maps common separators to `-`, drops everything else that is
/// not `[a-z0-9-]`, trims `-` from both ends and truncates to
/// [`MAX_NAME_LENGTH`]. Returns `None` when nothing legal remains.
#[must_use]
pub fn resource_name(raw: &str) -> Option<String> {
    let mut sanitized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            '_' | '.' | ' ' | ':' | '/' => '-',
            other => other,
        })
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-')
        .collect();

    sanitized = sanitized.trim_matches('-').to_string();

    if sanitized.len() > MAX_NAME_LENGTH {
        sanitized.truncate(MAX_NAME_LENGTH);
        // Ensure it still ends with alphanumeric after truncation
        sanitized = sanitized.trim_end_matches('-').to_string();
    }

    if sanitized.is_empty() {
        None
    } else {
        Some(sanitized)
    }
}

/// Returns true if `name` is already a valid RFC 1123 label.
#[must_use]
pub fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_valid_names() {
        assert_eq!(resource_name("ci0").as_deref(), Some("ci0"));
        assert_eq!(
            resource_name("20240131-150405-123").as_deref(),
            Some("20240131-150405-123")
        );
    }

    #[test]
    fn sanitizes_case_and_separators() {
        assert_eq!(
            resource_name("Lab1_Student.Submission").as_deref(),
            Some("lab1-student-submission")
        );
        assert_eq!(resource_name("  run: 42 ").as_deref(), Some("run--42"));
        assert_eq!(resource_name("--edge--").as_deref(), Some("edge"));
        assert_eq!(resource_name("grüße").as_deref(), Some("gre"));
    }

    #[test]
    fn rejects_identifiers_with_nothing_legal() {
        assert_eq!(resource_name(""), None);
        assert_eq!(resource_name("___"), None);
        assert_eq!(resource_name("!!!"), None);
    }

    #[test]
    fn truncates_long_identifiers() {
        let raw = format!("{}-{}", "a".repeat(62), "b".repeat(10));
        let name = resource_name(&raw).unwrap();
        assert_eq!(name.len(), 62);
        assert!(is_valid_resource_name(&name));
    }

    #[test]
    fn validity_check() {
        assert!(is_valid_resource_name("ci-9"));
        assert!(!is_valid_resource_name("-ci"));
        assert!(!is_valid_resource_name("ci-"));
        assert!(!is_valid_resource_name("Ci"));
        assert!(!is_valid_resource_name(&"a".repeat(64)));
    }
}
