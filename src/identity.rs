use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{SyncError, SyncResult};

pub const MAX_DISPLAY_NAME_LEN: usize = 64;
pub const MAX_BIO_LEN: usize = 280;
pub const MIN_USERNAME_LEN: usize = 3;
pub const MAX_USERNAME_LEN: usize = 30;
pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_SEARCH_QUERY_LEN: usize = 64;
pub const WALLET_ADDRESS_BYTES: usize = 20;

const _: [(); MAX_DISPLAY_NAME_LEN - MAX_USERNAME_LEN] = [(); MAX_DISPLAY_NAME_LEN - MAX_USERNAME_LEN];

fn invalid(message: impl Into<String>) -> SyncError {
    SyncError::Validation(message.into())
}

pub fn canonicalize_display_name(value: &str) -> SyncResult<Option<String>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(invalid(format!(
            "Display name exceeds {MAX_DISPLAY_NAME_LEN} character limit"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

pub fn canonicalize_bio(value: &str) -> SyncResult<Option<String>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_BIO_LEN {
        return Err(invalid(format!("Bio exceeds {MAX_BIO_LEN} character limit")));
    }
    Ok(Some(trimmed.to_string()))
}

/// Lowercase ASCII letters, digits, `_` and `.`.
pub fn canonicalize_username(value: &str) -> SyncResult<String> {
    let normalized = value.trim().trim_start_matches('@').to_ascii_lowercase();
    let length = normalized.chars().count();
    if length < MIN_USERNAME_LEN {
        return Err(invalid(format!(
            "Username must be at least {MIN_USERNAME_LEN} characters"
        )));
    }
    if length > MAX_USERNAME_LEN {
        return Err(invalid(format!(
            "Username exceeds {MAX_USERNAME_LEN} character limit"
        )));
    }
    if let Some(bad) = normalized
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '.'))
    {
        return Err(invalid(format!("Username cannot contain {bad:?}")));
    }
    Ok(normalized)
}

pub fn canonicalize_email(value: &str) -> SyncResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("Email is required"));
    }
    match trimmed.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {
            Ok(trimmed.to_ascii_lowercase())
        }
        _ => Err(invalid("Email address is not valid")),
    }
}

pub fn validate_password(value: &str) -> SyncResult<()> {
    if value.is_empty() {
        return Err(invalid("Password is required"));
    }
    if value.chars().count() < MIN_PASSWORD_LEN {
        return Err(invalid(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// `ilike` pattern matching `query` anywhere in a username. Blank queries
/// match nothing.
pub fn username_search_pattern(query: &str) -> Option<String> {
    let trimmed = query.trim().trim_start_matches('@');
    if trimmed.is_empty() {
        return None;
    }
    let bounded: String = trimmed
        .chars()
        .filter(|c| *c != '%')
        .take(MAX_SEARCH_QUERY_LEN)
        .collect();
    if bounded.is_empty() {
        return None;
    }
    Some(format!("%{bounded}%"))
}

/// Fresh `0x`-prefixed address from operating-system randomness.
pub fn generate_wallet_address() -> String {
    let mut bytes = [0u8; WALLET_ADDRESS_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

pub fn decode_wallet_address(value: &str) -> SyncResult<Vec<u8>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid("Wallet address cannot be empty"));
    }
    let bytes = hex::decode(strip_hex_prefix(trimmed))
        .map_err(|err| invalid(format!("Wallet address is not hex: {err}")))?;
    if bytes.len() != WALLET_ADDRESS_BYTES {
        return Err(invalid(format!(
            "Wallet address must be {WALLET_ADDRESS_BYTES} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

pub fn normalize_currency(value: &str) -> SyncResult<String> {
    let normalized = value.trim().to_ascii_uppercase();
    if !(3..=5).contains(&normalized.len()) || !normalized.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(invalid(format!("Unsupported currency code {value:?}")));
    }
    Ok(normalized)
}

fn strip_hex_prefix(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_validation() {
        assert!(canonicalize_display_name("Alice").unwrap().is_some());
        assert!(canonicalize_display_name("   ").unwrap().is_none());
        let long_name = "a".repeat(MAX_DISPLAY_NAME_LEN + 1);
        assert!(canonicalize_display_name(&long_name).is_err());
    }

    #[test]
    fn bio_validation() {
        let long_bio = "x".repeat(MAX_BIO_LEN + 1);
        assert!(canonicalize_bio(&long_bio).is_err());
        assert_eq!(canonicalize_bio(" hi ").unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn username_rules() {
        assert_eq!(canonicalize_username("@Ada_L").unwrap(), "ada_l");
        assert!(canonicalize_username("ab").is_err());
        assert!(canonicalize_username("has space").is_err());
    }

    #[test]
    fn email_and_password_rules() {
        assert_eq!(canonicalize_email(" Ada@Example.com ").unwrap(), "ada@example.com");
        assert!(canonicalize_email("not-an-email").is_err());
        assert!(validate_password("").is_err());
        assert!(validate_password("12345").is_err());
        assert!(validate_password("123456").is_ok());
    }

    #[test]
    fn search_pattern_wraps_query() {
        assert_eq!(username_search_pattern("@ada").as_deref(), Some("%ada%"));
        assert_eq!(username_search_pattern("%%"), None);
        assert_eq!(username_search_pattern("   "), None);
    }

    #[test]
    fn generated_addresses_decode() {
        let address = generate_wallet_address();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 2 + WALLET_ADDRESS_BYTES * 2);
        assert_eq!(decode_wallet_address(&address).unwrap().len(), WALLET_ADDRESS_BYTES);
        assert_ne!(address, generate_wallet_address());
        assert!(decode_wallet_address("0xabc").is_err());
    }

    #[test]
    fn currency_codes() {
        assert_eq!(normalize_currency("eur").unwrap(), "EUR");
        assert!(normalize_currency("E1").is_err());
    }
}
