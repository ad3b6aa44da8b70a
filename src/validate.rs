//! Input checks run before any side effect

use crate::error::{DomainError, Result};

/// Characters that would break out of an nginx directive
const FORBIDDEN_IN_SUBFOLDER: [char; 7] = [';', '{', '}', '\'', '"', '$', '#'];

/// Validate a DNS hostname and return it lower-cased
pub fn domain_name(raw: &str) -> Result<String> {
    let name = raw.trim().trim_end_matches('.').to_ascii_lowercase();

    if name.is_empty() {
        return Err(DomainError::InvalidInput("domain must not be empty".to_string()));
    }
    if name.len() > 253 {
        return Err(DomainError::InvalidInput(format!(
            "domain {} is longer than 253 characters",
            raw
        )));
    }

    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(DomainError::InvalidInput(format!(
                "{} is not a valid hostname",
                raw
            )));
        }
    }

    Ok(name)
}

/// Validate an upstream subfolder and strip surrounding slashes
pub fn subfolder(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches('/').trim_end_matches('/');

    if trimmed.is_empty() {
        return Err(DomainError::InvalidInput("subfolder must not be empty".to_string()));
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || FORBIDDEN_IN_SUBFOLDER.contains(&c))
    {
        return Err(DomainError::InvalidInput(format!(
            "subfolder {} contains characters not allowed in a proxy path",
            raw
        )));
    }

    Ok(trimmed.to_string())
}

/// Validate a contact email for certificate registration
pub fn email(raw: Option<&str>) -> Result<String> {
    let email = raw.map(str::trim).unwrap_or_default();
    if email.is_empty() {
        return Err(DomainError::InvalidInput("email must not be empty".to_string()));
    }

    let valid = !email.chars().any(char::is_whitespace)
        && matches!(email.split_once('@'), Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@'));
    if !valid {
        return Err(DomainError::InvalidInput(format!("{} is not a valid email", email)));
    }

    Ok(email.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_name() {
        assert_eq!(domain_name("A.Example.com").unwrap(), "a.example.com");
        assert_eq!(domain_name("example.com.").unwrap(), "example.com");
        assert_eq!(domain_name("my-site.example.com").unwrap(), "my-site.example.com");

        for bad in ["", "-a.example.com", "a-.example.com", "a..com", "a b.com", "../etc", "a/b.com", "*.example.com"] {
            assert!(domain_name(bad).is_err(), "accepted {:?}", bad);
        }
        assert!(domain_name(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_subfolder() {
        assert_eq!(subfolder("blog").unwrap(), "blog");
        assert_eq!(subfolder("/blog/posts/").unwrap(), "blog/posts");

        for bad in ["", "/", "a b", "blog;", "x{", "$host", "a\"b"] {
            assert!(subfolder(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_email() {
        assert_eq!(email(Some(" ops@example.com ")).unwrap(), "ops@example.com");

        assert!(matches!(email(None), Err(DomainError::InvalidInput(_))));
        for bad in ["", "ops", "@example.com", "ops@", "a@b@c", "o ps@example.com"] {
            assert!(email(Some(bad)).is_err(), "accepted {:?}", bad);
        }
    }
}
