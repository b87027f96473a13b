//! Domain name normalization and validation

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("Empty domain")]
    Empty,

    #[error("Domain too long: {0} characters")]
    TooLong(usize),

    #[error("Invalid domain label {label:?} in {domain}")]
    InvalidLabel { domain: String, label: String },
}

/// Lowercase and strip a trailing root dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Normalize and validate a domain a client asks to register.
///
/// Labels are 1-63 characters of letters, digits and inner hyphens;
/// wildcards are not registrable.
pub fn validate_domain(domain: &str) -> Result<String, DomainError> {
    let normalized = normalize_domain(domain);
    if normalized.is_empty() {
        return Err(DomainError::Empty);
    }
    if normalized.len() > 253 {
        return Err(DomainError::TooLong(normalized.len()));
    }

    for label in normalized.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(DomainError::InvalidLabel {
                domain: normalized.clone(),
                label: label.to_string(),
            });
        }
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_domain() {
        assert_eq!(validate_domain("A.Example.com.").unwrap(), "a.example.com");
        assert_eq!(validate_domain("localhost").unwrap(), "localhost");
        assert_eq!(validate_domain("my-app.example.com").unwrap(), "my-app.example.com");
    }

    #[test]
    fn test_rejects_invalid_domains() {
        assert_eq!(validate_domain("  "), Err(DomainError::Empty));
        assert!(validate_domain("*.example.com").is_err());
        assert!(validate_domain("a..example.com").is_err());
        assert!(validate_domain("-a.example.com").is_err());
        assert!(validate_domain("a_b.example.com").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
        assert!(matches!(
            validate_domain(&"a.".repeat(130)),
            Err(DomainError::TooLong(_))
        ));
    }
}
