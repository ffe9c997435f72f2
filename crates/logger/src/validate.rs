//! Domain and tag validation shared by all backends

use crate::error::{Error, Result};

/// Minimum length of a domain.
pub const MIN_LEN_DOMAIN: usize = 3;

/// Maximum length of a domain.
pub const MAX_LEN_DOMAIN: usize = 32;

/// Maximum length of a tag.
pub const MAX_LEN_TAG: usize = 128;

/// Characters allowed to separate domain segments.
pub const DOMAIN_SEPARATORS: [char; 3] = ['.', '-', ':'];

/// Checks a domain for validity.
///
/// A valid domain is 3 to 32 characters of `[a-z0-9]` and the separators
/// `.`, `-` and `:`. It contains at least one separator, does not start or
/// end with one, and never has two separators next to each other.
///
/// # Errors
///
/// Returns [`Error::InvalidDomain`] describing the first violation.
pub fn check_domain(domain: &str) -> Result<&str> {
    let invalid = |reason: String| Error::InvalidDomain {
        domain: domain.to_string(),
        reason,
    };

    let len = domain.chars().count();
    if len < MIN_LEN_DOMAIN {
        return Err(invalid(format!("length[{len}] < min[{MIN_LEN_DOMAIN}]")));
    }
    if len > MAX_LEN_DOMAIN {
        return Err(invalid(format!("length[{len}] > max[{MAX_LEN_DOMAIN}]")));
    }

    let mut separators = 0usize;
    let mut last_was_separator = false;
    for (i, c) in domain.chars().enumerate() {
        if c.is_ascii_digit() || c.is_ascii_lowercase() {
            last_was_separator = false;
            continue;
        }
        if !DOMAIN_SEPARATORS.contains(&c) {
            return Err(invalid(format!(
                "character[{c}] at index[{i}] is not one of [a-z][0-9][.-:]"
            )));
        }
        if i == 0 {
            return Err(invalid("must start with [a-z] or [0-9]".into()));
        }
        if i == len - 1 {
            return Err(invalid("must end with [a-z] or [0-9]".into()));
        }
        if last_was_separator {
            return Err(invalid(format!(
                "separator[{c}] at index[{i}] follows another separator"
            )));
        }
        separators += 1;
        last_was_separator = true;
    }

    if separators == 0 {
        return Err(invalid("must contain at least 1 separator [.-:]".into()));
    }
    Ok(domain)
}

/// Checks a tag for validity: 1 to 128 characters, no whitespace.
///
/// # Errors
///
/// Returns [`Error::InvalidTag`] describing the violation.
pub fn check_tag(tag: &str) -> Result<&str> {
    let invalid = |reason| Error::InvalidTag {
        tag: tag.to_string(),
        reason,
    };

    if tag.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if tag.chars().count() > MAX_LEN_TAG {
        return Err(invalid("length exceeds 128 characters"));
    }
    if tag.chars().any(char::is_whitespace) {
        return Err(invalid("cannot contain whitespace"));
    }
    Ok(tag)
}

/// Derives a domain from a module path target, e.g. `my_crate::net` becomes
/// `my-crate`. Returns `None` when the result would not be a valid domain.
#[must_use]
pub fn domain_from_target(target: &str) -> Option<String> {
    let head = target.split("::").next()?;
    let domain = head.replace('_', "-");
    check_domain(&domain).ok()?;
    Some(domain)
}

/// Derives a valid tag from a module path target, truncating and replacing
/// whitespace where necessary.
#[must_use]
pub fn tag_from_target(target: &str) -> String {
    let tag: String = target
        .chars()
        .take(MAX_LEN_TAG)
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if tag.is_empty() { "unknown".to_string() } else { tag }
}
